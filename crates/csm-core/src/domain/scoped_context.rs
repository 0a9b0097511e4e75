//! Three-tier context model and the invocation stack.
//!
//! Everything here is pure data plus functions that return new values; the
//! agent is the only owner that replaces its copies.

use csm_definition::{markers, ContextOperation, TerminationReason};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{lookup_value_path, Context};

/// Context split by lifetime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopedContext {
    /// Lives as long as the agent; mirrored by the flat context
    pub conversation: Context,
    /// Lives for one flow invocation
    pub flow: Context,
    /// Arguments of the current invocation
    pub params: Context,
}

impl ScopedContext {
    /// Scoped context with only a conversation tier
    pub fn with_conversation(conversation: Context) -> Self {
        ScopedContext {
            conversation,
            ..Self::default()
        }
    }

    /// Merged view used for lookups: params shadow flow, flow shadows conversation
    pub fn resolution_view(&self) -> Context {
        let mut view = self.conversation.clone();
        view.extend(self.flow.iter().map(|(k, v)| (k.clone(), v.clone())));
        view.extend(self.params.iter().map(|(k, v)| (k.clone(), v.clone())));
        view
    }
}

/// Apply context operations in order, returning the new context.
///
/// All operations write the conversation tier.
pub fn apply_context_operations(context: &ScopedContext, operations: &[ContextOperation]) -> ScopedContext {
    let mut next = context.clone();
    for operation in operations {
        apply_operation(&mut next.conversation, operation);
    }
    next
}

fn apply_operation(conversation: &mut Context, operation: &ContextOperation) {
    match operation {
        ContextOperation::Set { variable, value } => {
            conversation.insert(variable.clone(), value.clone());
        }
        ContextOperation::Append { to, value } => match conversation.get_mut(to) {
            Some(Value::Array(items)) => items.push(value.clone()),
            _ => {
                conversation.insert(to.clone(), Value::Array(vec![value.clone()]));
            }
        },
        ContextOperation::Merge { into, value } => match (conversation.get_mut(into), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                existing.extend(incoming.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            _ => {
                conversation.insert(into.clone(), value.clone());
            }
        },
    }
}

/// Replace `$result` placeholders inside operation values with the returned value.
///
/// `"$result"` is the whole value; `"$result.path"` a field of it, `null` when absent.
pub fn resolve_result_references(operations: &[ContextOperation], result: &Value) -> Vec<ContextOperation> {
    operations
        .iter()
        .map(|operation| operation.with_value(substitute(operation.value(), result)))
        .collect()
}

fn substitute(value: &Value, result: &Value) -> Value {
    match value {
        Value::String(s) if s == markers::RESULT_REFERENCE => result.clone(),
        Value::String(s) => match s
            .strip_prefix(markers::RESULT_REFERENCE)
            .and_then(|rest| rest.strip_prefix('.'))
        {
            Some(path) => lookup_value_path(result, path).cloned().unwrap_or(Value::Null),
            None => value.clone(),
        },
        Value::Array(items) => Value::Array(items.iter().map(|item| substitute(item, result)).collect()),
        Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), substitute(v, result))).collect()),
        other => other.clone(),
    }
}

/// A pending return: where to resume and what the context looked like
#[derive(Debug, Clone, PartialEq)]
pub struct FlowStackFrame {
    /// Invoking flow
    pub flow_id: String,
    /// Invoking state
    pub state_id: String,
    /// Declaration index of the invoking transition within the state
    pub transition_index: usize,
    /// Deep copy of all tiers at invocation time
    pub context_snapshot: ScopedContext,
}

/// Failure payload of an invoked flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowError {
    /// `cancel` or `error`
    #[serde(rename = "type")]
    pub reason: TerminationReason,
    /// Human-readable description
    pub message: String,
    /// Flow tier at termination
    #[serde(default)]
    pub context: Value,
}

/// Outcome of an invoked flow
#[derive(Debug, Clone, PartialEq)]
pub enum FlowResult {
    /// The flow ended normally with a value
    Success(Value),
    /// The flow was cancelled or failed
    Failure(FlowError),
}

impl FlowResult {
    /// Termination reason that produced this result
    pub fn reason(&self) -> TerminationReason {
        match self {
            FlowResult::Success(_) => TerminationReason::End,
            FlowResult::Failure(error) => error.reason,
        }
    }

    /// Value exposed to result handlers as `$result`
    pub fn value(&self) -> Value {
        match self {
            FlowResult::Success(value) => value.clone(),
            FlowResult::Failure(error) => error.context.clone(),
        }
    }
}

/// Execution position plus the invocation stack
#[derive(Debug, Clone, PartialEq)]
pub struct FlowExecutionState {
    /// Active flow
    pub current_flow: String,
    /// Active state of the active flow
    pub current_state: String,
    /// Pending returns, innermost last
    pub flow_stack: Vec<FlowStackFrame>,
    /// Result of the most recent return, kept until the next turn
    pub pending_result: Option<FlowResult>,
}

/// Compact persisted form of [`FlowExecutionState`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializableFlowExecutionState {
    /// Current flow
    pub cf: String,
    /// Current state
    pub cs: String,
    /// Flow stack
    pub fs: Vec<SerializableFrame>,
    /// Pending result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<SerializableResult>,
}

/// Compact stack frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializableFrame {
    /// Flow id
    pub f: String,
    /// State id
    pub s: String,
    /// Transition index
    pub t: usize,
    /// Context snapshot
    pub c: SerializableContext,
}

/// Compact scoped context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializableContext {
    /// Conversation tier
    pub conv: Context,
    /// Flow tier
    pub flow: Context,
    /// Params tier
    pub params: Context,
}

/// Compact flow result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializableResult {
    /// Success flag
    pub ok: bool,
    /// Value on success, serialized [`FlowError`] on failure
    pub data: Value,
}

/// Convert to the compact form
pub fn serialize_flow_execution_state(state: &FlowExecutionState) -> SerializableFlowExecutionState {
    SerializableFlowExecutionState {
        cf: state.current_flow.clone(),
        cs: state.current_state.clone(),
        fs: state
            .flow_stack
            .iter()
            .map(|frame| SerializableFrame {
                f: frame.flow_id.clone(),
                s: frame.state_id.clone(),
                t: frame.transition_index,
                c: SerializableContext {
                    conv: frame.context_snapshot.conversation.clone(),
                    flow: frame.context_snapshot.flow.clone(),
                    params: frame.context_snapshot.params.clone(),
                },
            })
            .collect(),
        pr: state.pending_result.as_ref().map(|result| match result {
            FlowResult::Success(value) => SerializableResult { ok: true, data: value.clone() },
            FlowResult::Failure(error) => SerializableResult {
                ok: false,
                data: serde_json::json!({
                    "type": error.reason,
                    "message": error.message,
                    "context": error.context,
                }),
            },
        }),
    }
}

/// Convert back from the compact form.
///
/// Fails only if a failure result's payload is not a valid [`FlowError`].
pub fn deserialize_flow_execution_state(
    state: SerializableFlowExecutionState,
) -> Result<FlowExecutionState, serde_json::Error> {
    let pending_result = match state.pr {
        None => None,
        Some(SerializableResult { ok: true, data }) => Some(FlowResult::Success(data)),
        Some(SerializableResult { ok: false, data }) => Some(FlowResult::Failure(serde_json::from_value(data)?)),
    };

    Ok(FlowExecutionState {
        current_flow: state.cf,
        current_state: state.cs,
        flow_stack: state
            .fs
            .into_iter()
            .map(|frame| FlowStackFrame {
                flow_id: frame.f,
                state_id: frame.s,
                transition_index: frame.t,
                context_snapshot: ScopedContext {
                    conversation: frame.c.conv,
                    flow: frame.c.flow,
                    params: frame.c.params,
                },
            })
            .collect(),
        pending_result,
    })
}
