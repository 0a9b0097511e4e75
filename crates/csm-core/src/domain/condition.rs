use csm_definition::Condition;
use serde_json::Value;

use crate::domain::{expression, json_logic};
use crate::error::CoreError;
use crate::types::Context;

/// Evaluates transition guards
pub trait ConditionEvaluator: Send + Sync {
    /// Evaluate the condition within the given context
    fn evaluate(&self, condition: &Condition, context: &Context) -> Result<bool, CoreError>;
}

/// Default evaluator: the restricted expression interpreter for expression
/// conditions and the JSON-logic evaluator for rule trees
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConditionEvaluator;

impl ConditionEvaluator for DefaultConditionEvaluator {
    fn evaluate(&self, condition: &Condition, context: &Context) -> Result<bool, CoreError> {
        match condition {
            Condition::Expression(source) | Condition::Code { expression: source } => {
                expression::evaluate_truthy(source, context)
            }
            Condition::JsonLogic { rule } => {
                let data = Value::Object(context.clone());
                json_logic::apply(rule, &data).map(|result| json_logic::truthy(&result))
            }
        }
    }
}
