use chrono::{DateTime, Utc};
use csm_definition::TransitionDefinition;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::Context;

/// What caused a state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateChangeTrigger {
    /// User input matched a transition
    Input,
    /// A transient state fired automatically
    Transient,
    /// A `machine:` jump switched flows
    Machine,
    /// State restored from a session token
    Restore,
    /// First flow registered with the agent
    Init,
}

impl StateChangeTrigger {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            StateChangeTrigger::Input => "input",
            StateChangeTrigger::Transient => "transient",
            StateChangeTrigger::Machine => "machine",
            StateChangeTrigger::Restore => "restore",
            StateChangeTrigger::Init => "init",
        }
    }
}

impl fmt::Display for StateChangeTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted once per committed step
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChangeEvent {
    /// Agent id
    pub agent: String,
    /// Active machine after the step
    pub machine: String,
    /// Active state after the step
    pub state: String,
    /// State before the step
    pub previous_state: Option<String>,
    /// Machine before the step, set when the step switched machines
    pub previous_machine: Option<String>,
    /// Cause of the step
    pub trigger: StateChangeTrigger,
    /// Input that drove the step; empty for automatic steps
    pub input: Option<String>,
    /// Copy of the flat context after the step
    pub context: Context,
    /// When the step committed
    pub timestamp: DateTime<Utc>,
    /// Transition taken, if any
    pub transition: Option<TransitionDefinition>,
}

/// Operation during which an error surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorOperation {
    /// `process_input`
    ProcessInput,
    /// `to_url_hash`
    Serialize,
    /// `from_url_hash`
    Deserialize,
    /// Registration or explicit state changes
    Transition,
    /// State change handler
    StateEntry,
}

/// Diagnostic context passed to the error hook
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorContext {
    /// Agent id
    pub agent: String,
    /// Active machine, if any
    pub machine: Option<String>,
    /// Active state, if any
    pub state: Option<String>,
    /// Failing operation
    pub operation: ErrorOperation,
    /// Input being processed
    pub input: Option<String>,
    /// Copy of the flat context
    pub context: Context,
}
