//! Assertion utilities for validating agent positions and context.

use csm_core::ConversationalAgent;
use serde_json::Value;
use thiserror::Error;

/// Error type for agent state validation failures
#[derive(Debug, Error)]
pub enum AgentStateValidationError {
    #[error("Invalid position: expected {expected}, got {actual}")]
    InvalidPosition { expected: String, actual: String },

    #[error("Missing context key: {0}")]
    MissingContextKey(String),

    #[error("Invalid context value for '{key}': expected {expected}, got {actual}")]
    InvalidContextValue { key: String, expected: String, actual: String },

    #[error("Invalid stack depth: expected {expected}, got {actual}")]
    InvalidDepth { expected: usize, actual: usize },
}

/// Asserts that the agent is in `state` of `machine`.
pub fn assert_position(
    agent: &ConversationalAgent,
    machine: &str,
    state: &str,
) -> Result<(), AgentStateValidationError> {
    let actual = format!(
        "{}/{}",
        agent.current_machine().unwrap_or("<none>"),
        agent.current_state().unwrap_or("<none>")
    );
    let expected = format!("{}/{}", machine, state);

    if actual != expected {
        return Err(AgentStateValidationError::InvalidPosition { expected, actual });
    }
    Ok(())
}

/// Asserts that the flat context holds `expected` under `key`.
pub fn assert_context_value(
    agent: &ConversationalAgent,
    key: &str,
    expected: Value,
) -> Result<(), AgentStateValidationError> {
    let actual = agent
        .context()
        .get(key)
        .ok_or_else(|| AgentStateValidationError::MissingContextKey(key.to_string()))?;

    if *actual != expected {
        return Err(AgentStateValidationError::InvalidContextValue {
            key: key.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// Asserts how many invocations are awaiting a return.
pub fn assert_depth(agent: &ConversationalAgent, expected: usize) -> Result<(), AgentStateValidationError> {
    let actual = agent.depth();
    if actual != expected {
        return Err(AgentStateValidationError::InvalidDepth { expected, actual });
    }
    Ok(())
}
