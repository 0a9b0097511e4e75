/// Value coercions shared by the evaluators
pub mod coercion;

/// Transition conditions
pub mod condition;

/// State change events and error context
pub mod events;

/// Restricted expression interpreter
pub mod expression;

/// Single-flow pattern-matching machine
pub mod flow_machine;

/// JSON-logic rule evaluation
pub mod json_logic;

/// Wildcards and `#{}` interpolation
pub mod pattern;

/// Context tiers and the invocation stack
pub mod scoped_context;

/// `call:` targets, aggregation and return values
pub mod sub_flow;

/// Transition outcomes
pub mod transition;
