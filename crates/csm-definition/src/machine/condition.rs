use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A guard attached to a transition.
///
/// Three authoring forms are accepted: a bare expression string, a structured
/// code expression (`{"type": "code", "expression": "..."}`) and a JSON-logic
/// rule tree (`{"type": "jsonlogic", "rule": {...}}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawCondition", into = "RawCondition")]
pub enum Condition {
    /// Free-form expression, e.g. `context.verified === true`
    Expression(String),

    /// Structured code expression
    Code {
        /// Expression source
        expression: String,
    },

    /// JSON-logic rule tree
    JsonLogic {
        /// The rule object
        rule: Value,
    },
}

impl Condition {
    /// Expression source for the two expression forms
    pub fn expression(&self) -> Option<&str> {
        match self {
            Condition::Expression(source) => Some(source),
            Condition::Code { expression } => Some(expression),
            Condition::JsonLogic { .. } => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawCondition {
    Expression(String),
    Structured(StructuredCondition),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum StructuredCondition {
    Code { expression: String },
    Jsonlogic { rule: Value },
}

impl From<RawCondition> for Condition {
    fn from(raw: RawCondition) -> Self {
        match raw {
            RawCondition::Expression(source) => Condition::Expression(source),
            RawCondition::Structured(StructuredCondition::Code { expression }) => Condition::Code { expression },
            RawCondition::Structured(StructuredCondition::Jsonlogic { rule }) => Condition::JsonLogic { rule },
        }
    }
}

impl From<Condition> for RawCondition {
    fn from(condition: Condition) -> Self {
        match condition {
            Condition::Expression(source) => RawCondition::Expression(source),
            Condition::Code { expression } => RawCondition::Structured(StructuredCondition::Code { expression }),
            Condition::JsonLogic { rule } => RawCondition::Structured(StructuredCondition::Jsonlogic { rule }),
        }
    }
}
