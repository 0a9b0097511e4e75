use serde::{Deserialize, Serialize};
use std::fmt;

use super::condition::Condition;
use super::operation::ContextOperation;
use super::ContextMap;

/// Reserved pattern and target spellings
pub mod markers {
    /// Pattern that matches any input
    pub const DEFAULT_PATTERN: &str = ":default";

    /// Terminate the current flow successfully
    pub const END: &str = ":end";

    /// Terminate the current flow as cancelled
    pub const CANCEL: &str = ":cancel";

    /// Terminate the current flow with an error
    pub const ERROR: &str = ":error";

    /// Prefix of a cross-flow jump target
    pub const MACHINE_PREFIX: &str = "machine:";

    /// Prefix of a string-encoded sub-flow call
    pub const CALL_PREFIX: &str = "call:";

    /// Prefix of a target resolved through context
    pub const VARIABLE_PREFIX: char = '@';

    /// Placeholder for the invoked flow's returned value inside result handlers
    pub const RESULT_REFERENCE: &str = "$result";
}

/// A single outgoing edge of a state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionDefinition {
    /// Input pattern; absent means the transition fires automatically
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// State id, `@variable`, `machine:<flow>`, `call:<flow>:<agg>:<var>` or a termination marker
    #[serde(default)]
    pub target: String,

    /// Context updates applied when the transition is taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextMap>,

    /// Guard evaluated before pattern matching
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,

    /// Higher priorities are tried first
    #[serde(default, skip_serializing_if = "is_zero")]
    pub priority: i64,

    /// Structured sub-flow invocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_invocation: Option<FlowInvocation>,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

impl TransitionDefinition {
    /// Transition to `target` with no pattern
    pub fn to(target: impl Into<String>) -> Self {
        TransitionDefinition {
            pattern: None,
            target: target.into(),
            context: None,
            condition: None,
            priority: 0,
            flow_invocation: None,
        }
    }

    /// Transition that invokes another flow
    pub fn invoke(invocation: FlowInvocation) -> Self {
        let mut transition = TransitionDefinition::to(String::new());
        transition.flow_invocation = Some(invocation);
        transition
    }

    /// Set the input pattern
    pub fn on(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the guard
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Set the context updates
    pub fn with_context(mut self, context: ContextMap) -> Self {
        self.context = Some(context);
        self
    }

    /// A transition without a pattern fires on empty input
    pub fn is_automatic(&self) -> bool {
        self.pattern.is_none()
    }
}

/// Structured invocation of another flow with per-outcome result handlers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowInvocation {
    /// Flow to invoke
    pub flow_id: String,

    /// Initial params tier of the invoked flow
    #[serde(default)]
    pub parameters: ContextMap,

    /// Handlers keyed by termination reason
    #[serde(default)]
    pub on_result: ResultHandlers,
}

impl FlowInvocation {
    /// Invoke `flow_id` with no parameters and no handlers
    pub fn new(flow_id: impl Into<String>) -> Self {
        FlowInvocation {
            flow_id: flow_id.into(),
            parameters: ContextMap::new(),
            on_result: ResultHandlers::default(),
        }
    }

    /// Set the parameters
    pub fn with_parameters(mut self, parameters: ContextMap) -> Self {
        self.parameters = parameters;
        self
    }

    /// Set the handler for one termination reason
    pub fn on(mut self, reason: TerminationReason, handler: ResultHandler) -> Self {
        match reason {
            TerminationReason::End => self.on_result.end = Some(handler),
            TerminationReason::Cancel => self.on_result.cancel = Some(handler),
            TerminationReason::Error => self.on_result.error = Some(handler),
        }
        self
    }
}

/// Result handlers of an invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultHandlers {
    /// Normal completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<ResultHandler>,

    /// Cancelled by the user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel: Option<ResultHandler>,

    /// Failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResultHandler>,
}

impl ResultHandlers {
    /// Handler for a termination reason
    pub fn get(&self, reason: TerminationReason) -> Option<&ResultHandler> {
        match reason {
            TerminationReason::End => self.end.as_ref(),
            TerminationReason::Cancel => self.cancel.as_ref(),
            TerminationReason::Error => self.error.as_ref(),
        }
    }
}

/// Operations to apply and the state to resume in after an invoked flow returns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultHandler {
    /// Context operations, applied in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<ContextOperation>,

    /// State of the invoking flow to resume in
    pub target: String,
}

impl ResultHandler {
    /// Resume in `target` without touching context
    pub fn new(target: impl Into<String>) -> Self {
        ResultHandler {
            operations: Vec::new(),
            target: target.into(),
        }
    }

    /// Append an operation
    pub fn with_operation(mut self, operation: ContextOperation) -> Self {
        self.operations.push(operation);
        self
    }
}

/// Why an invoked flow returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminationReason {
    /// `:end`
    End,
    /// `:cancel`
    Cancel,
    /// `:error`
    Error,
}

impl TerminationReason {
    /// Parse a termination marker target
    pub fn from_target(target: &str) -> Option<Self> {
        match target {
            markers::END => Some(TerminationReason::End),
            markers::CANCEL => Some(TerminationReason::Cancel),
            markers::ERROR => Some(TerminationReason::Error),
            _ => None,
        }
    }

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::End => "end",
            TerminationReason::Cancel => "cancel",
            TerminationReason::Error => "error",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transition_wire_form() {
        let transition: TransitionDefinition = serde_json::from_value(json!({
            "pattern": "Order Coffee",
            "target": "ChooseSize",
            "priority": 5,
            "context": { "orderType": "coffee" }
        }))
        .unwrap();

        assert_eq!(transition.pattern.as_deref(), Some("Order Coffee"));
        assert_eq!(transition.priority, 5);
        assert!(!transition.is_automatic());
        assert_eq!(transition.context.unwrap()["orderType"], json!("coffee"));
    }

    #[test]
    fn test_flow_invocation_wire_form() {
        let transition: TransitionDefinition = serde_json::from_value(json!({
            "pattern": "coffee",
            "target": "",
            "flowInvocation": {
                "flowId": "OrderCoffee",
                "onResult": {
                    "end": {
                        "operations": [{ "append": { "to": "orders", "value": "$result" } }],
                        "target": "Menu"
                    },
                    "cancel": { "target": "Menu" }
                }
            }
        }))
        .unwrap();

        let invocation = transition.flow_invocation.unwrap();
        assert_eq!(invocation.flow_id, "OrderCoffee");
        assert!(invocation.parameters.is_empty());
        assert_eq!(invocation.on_result.get(TerminationReason::End).unwrap().operations.len(), 1);
        assert_eq!(invocation.on_result.get(TerminationReason::Cancel).unwrap().target, "Menu");
        assert!(invocation.on_result.get(TerminationReason::Error).is_none());
    }

    #[test]
    fn test_termination_markers() {
        assert_eq!(TerminationReason::from_target(":end"), Some(TerminationReason::End));
        assert_eq!(TerminationReason::from_target(":cancel"), Some(TerminationReason::Cancel));
        assert_eq!(TerminationReason::from_target(":error"), Some(TerminationReason::Error));
        assert_eq!(TerminationReason::from_target(":default"), None);
        assert_eq!(TerminationReason::from_target("end"), None);
    }
}
