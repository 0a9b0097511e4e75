use serde::{Deserialize, Serialize};

use super::transition::TransitionDefinition;
use super::ContextMap;

/// A state: an ordered list of transitions plus presentation metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDefinition {
    /// Transitions in declaration order
    pub transitions: Vec<TransitionDefinition>,

    /// Optional metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<StateMeta>,
}

impl StateDefinition {
    /// State with no transitions
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transition
    pub fn with_transition(mut self, transition: TransitionDefinition) -> Self {
        self.transitions.push(transition);
        self
    }

    /// Set metadata
    pub fn with_meta(mut self, meta: StateMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Message id shown when the state is entered
    pub fn message_id(&self) -> Option<&str> {
        self.meta.as_ref().and_then(|meta| meta.message_id.as_deref())
    }
}

/// Metadata attached to a state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMeta {
    /// Message associated with the state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    /// Authoring hint; runtime transience is derived from the transitions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transient: Option<bool>,

    /// Free-form tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Arbitrary application data
    #[serde(default, skip_serializing_if = "ContextMap::is_empty")]
    pub custom: ContextMap,
}

impl StateMeta {
    /// Metadata carrying only a message id
    pub fn message(message_id: impl Into<String>) -> Self {
        StateMeta {
            message_id: Some(message_id.into()),
            ..Self::default()
        }
    }
}
