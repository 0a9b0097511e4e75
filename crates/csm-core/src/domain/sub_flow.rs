use std::fmt;
use std::str::FromStr;

use csm_definition::{
    markers, ContextOperation, FlowInvocation, ResultHandler, ReturnType, TerminationReason, TransitionDefinition,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::domain::expression;
use crate::error::{CoreError, CoreResult};
use crate::types::Context;

/// How a sub-flow's return value is folded into the return variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationStrategy {
    /// Push onto an array
    Append,
    /// Replace
    Overwrite,
    /// Shallow-merge objects, replacing otherwise
    Merge,
}

impl AggregationStrategy {
    /// The context operation implementing this strategy
    pub fn operation(&self, variable: &str, value: Value) -> ContextOperation {
        match self {
            AggregationStrategy::Append => ContextOperation::Append { to: variable.to_string(), value },
            AggregationStrategy::Overwrite => ContextOperation::Set { variable: variable.to_string(), value },
            AggregationStrategy::Merge => ContextOperation::Merge { into: variable.to_string(), value },
        }
    }
}

impl FromStr for AggregationStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "append" => Ok(AggregationStrategy::Append),
            "overwrite" => Ok(AggregationStrategy::Overwrite),
            "merge" => Ok(AggregationStrategy::Merge),
            other => Err(CoreError::InvalidTarget(format!("Unknown aggregation strategy '{}'", other))),
        }
    }
}

impl fmt::Display for AggregationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AggregationStrategy::Append => "append",
            AggregationStrategy::Overwrite => "overwrite",
            AggregationStrategy::Merge => "merge",
        })
    }
}

/// A parsed `call:<flowId>:<aggregation>:<returnVariable>` target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubFlowCall {
    /// Flow to invoke
    pub flow_id: String,
    /// Aggregation strategy
    pub aggregation: AggregationStrategy,
    /// Conversation variable receiving the result
    pub return_var: String,
}

impl SubFlowCall {
    /// Structured invocation equivalent to this call.
    ///
    /// Normal completion folds `$result` into the return variable; every
    /// outcome resumes in `return_state`.
    pub fn to_invocation(&self, return_state: &str) -> FlowInvocation {
        let value = Value::String(markers::RESULT_REFERENCE.to_string());
        FlowInvocation::new(self.flow_id.clone())
            .on(
                TerminationReason::End,
                ResultHandler::new(return_state).with_operation(self.aggregation.operation(&self.return_var, value)),
            )
            .on(TerminationReason::Cancel, ResultHandler::new(return_state))
            .on(TerminationReason::Error, ResultHandler::new(return_state))
    }
}

impl fmt::Display for SubFlowCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}:{}", markers::CALL_PREFIX, self.flow_id, self.aggregation, self.return_var)
    }
}

/// Whether a target uses the `call:` convention
pub fn is_sub_flow_call(target: &str) -> bool {
    target.starts_with(markers::CALL_PREFIX)
}

/// Parse a `call:` target; `None` unless it has exactly four well-formed parts
pub fn parse_sub_flow_call(target: &str) -> Option<SubFlowCall> {
    let parts: Vec<&str> = target.split(':').collect();
    match parts.as_slice() {
        ["call", flow_id, aggregation, return_var] if !flow_id.is_empty() && !return_var.is_empty() => {
            Some(SubFlowCall {
                flow_id: flow_id.to_string(),
                aggregation: aggregation.parse().ok()?,
                return_var: return_var.to_string(),
            })
        }
        _ => None,
    }
}

/// The invocation performed by a transition, whichever convention it uses
pub fn resolve_invocation(transition: &TransitionDefinition, state_id: &str) -> CoreResult<Option<FlowInvocation>> {
    if let Some(invocation) = &transition.flow_invocation {
        return Ok(Some(invocation.clone()));
    }
    if is_sub_flow_call(&transition.target) {
        return parse_sub_flow_call(&transition.target)
            .map(|call| Some(call.to_invocation(state_id)))
            .ok_or_else(|| {
                CoreError::InvalidTarget(format!(
                    "'{}' must have the form call:<flow>:<append|overwrite|merge>:<variable>",
                    transition.target
                ))
            });
    }
    Ok(None)
}

/// Value returned by a terminating flow.
///
/// Without a return type the whole flow tier is returned. With one, the
/// whitelisted fields are copied from `view`; a transform expression, when
/// present, replaces them unless it fails to evaluate.
pub fn shape_return_value(return_type: Option<&ReturnType>, flow_tier: &Context, view: &Context) -> Value {
    let return_type = match return_type {
        Some(return_type) => return_type,
        None => return Value::Object(flow_tier.clone()),
    };

    let fields: Context = return_type
        .fields
        .iter()
        .filter_map(|field| view.get(field).map(|value| (field.clone(), value.clone())))
        .collect();

    match &return_type.transform {
        Some(transform) => match expression::evaluate(transform, view) {
            Ok(value) => value,
            Err(err) => {
                warn!(return_type = %return_type.type_name, error = %err, "Return value transform failed, using field extraction");
                Value::Object(fields)
            }
        },
        None => Value::Object(fields),
    }
}
