use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A context mutation performed when a sub-flow result is handled.
///
/// Serialized in its externally tagged form, e.g.
/// `{"append": {"to": "orders", "value": "$result"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextOperation {
    /// Overwrite a conversation variable
    Set {
        /// Variable name
        variable: String,
        /// New value
        value: Value,
    },

    /// Push onto a conversation array, creating it when absent
    Append {
        /// Array variable name
        to: String,
        /// Element to push
        value: Value,
    },

    /// Shallow-merge an object into a conversation variable
    Merge {
        /// Object variable name
        into: String,
        /// Object to merge
        value: Value,
    },
}

impl ContextOperation {
    /// The conversation variable this operation writes
    pub fn variable(&self) -> &str {
        match self {
            ContextOperation::Set { variable, .. } => variable,
            ContextOperation::Append { to, .. } => to,
            ContextOperation::Merge { into, .. } => into,
        }
    }

    /// The operation's value
    pub fn value(&self) -> &Value {
        match self {
            ContextOperation::Set { value, .. }
            | ContextOperation::Append { value, .. }
            | ContextOperation::Merge { value, .. } => value,
        }
    }

    /// Same operation with its value replaced
    pub fn with_value(&self, value: Value) -> Self {
        match self {
            ContextOperation::Set { variable, .. } => ContextOperation::Set { variable: variable.clone(), value },
            ContextOperation::Append { to, .. } => ContextOperation::Append { to: to.clone(), value },
            ContextOperation::Merge { into, .. } => ContextOperation::Merge { into: into.clone(), value },
        }
    }
}
