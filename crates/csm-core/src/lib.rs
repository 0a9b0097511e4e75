//!
//! CSM Core - flow execution runtime for conversational state machines
//!
//! This crate runs machine definitions produced by `csm-definition`: a
//! pattern-matching machine per flow, an agent orchestrating many flows with
//! nested invocations over a three-tier context, and a compact session token
//! so a conversation survives stateless request boundaries.
//!
//! ```no_run
//! use csm_core::{AgentOptions, ConversationalAgent};
//!
//! # async fn run(definition: &str, token: Option<&str>) -> Result<(), csm_core::CoreError> {
//! let mut agent = match token {
//!     Some(token) => ConversationalAgent::from_url_hash(token, AgentOptions::new())?,
//!     None => ConversationalAgent::new(AgentOptions::new()),
//! };
//! agent.add_machine_json(definition).await?;
//! if let Some((machine, state)) = agent.restore_point().map(|(m, s)| (m.to_string(), s.to_string())) {
//!     agent.restore_state(&machine, &state).await?;
//! }
//!
//! let result = agent.process_input("order a coffee").await?;
//! println!("now in {}/{}", result.machine, result.state);
//! let next_token = agent.to_url_hash()?;
//! # let _ = next_token;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - flow machines, context model and evaluators
pub mod domain;

/// Application layer - the agent, its hooks and the session codec
pub mod application;

/// Agent configuration
pub mod config;

/// Error types
pub mod error;

/// Context type and path lookup
pub mod types;

pub use application::agent::{AgentOptions, ConversationalAgent, ProcessResult};
pub use application::handlers::{ErrorHandler, NoopStateChangeHandler, StateChangeHandler};
pub use application::serialization::{decode_token, encode_token, SerializedAgentState, SCHEMA_VERSION};
pub use application::subflow_manager::{SubFlowManager, SubFlowResult};
pub use config::{AgentConfig, RootTerminationPolicy};
pub use domain::condition::{ConditionEvaluator, DefaultConditionEvaluator};
pub use domain::events::{ErrorContext, ErrorOperation, StateChangeEvent, StateChangeTrigger};
pub use domain::flow_machine::FlowMachine;
pub use domain::scoped_context::{
    apply_context_operations, deserialize_flow_execution_state, serialize_flow_execution_state, FlowError,
    FlowExecutionState, FlowResult, FlowStackFrame, ScopedContext, SerializableFlowExecutionState,
};
pub use domain::sub_flow::{is_sub_flow_call, parse_sub_flow_call, AggregationStrategy, SubFlowCall};
pub use domain::transition::TransitionResult;
pub use error::{CoreError, CoreResult};
pub use types::Context;

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
