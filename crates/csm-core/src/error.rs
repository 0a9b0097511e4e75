use csm_definition::{DefinitionError, TerminationReason};
use thiserror::Error;

/// Core error type for the conversation runtime
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Machine definition rejected at load time
    #[error("Definition error: {0}")]
    DefinitionError(String),

    /// `set_state` named an unregistered machine
    #[error("Machine '{0}' not found")]
    MachineNotFound(String),

    /// `machine:` jump to an unregistered flow
    #[error("Target machine '{0}' not found")]
    TargetMachineNotFound(String),

    /// Invocation of an unregistered flow
    #[error("Flow '{0}' not found")]
    FlowNotFound(String),

    /// Sub-flow manager lookup failed
    #[error("Sub-flow '{0}' not found")]
    SubFlowNotFound(String),

    /// State id unknown to a flow
    #[error("State '{state}' does not exist in flow '{flow}'")]
    StateNotFound {
        /// Missing state
        state: String,
        /// Flow searched
        flow: String,
    },

    /// Flow id registered twice
    #[error("Flow with ID '{0}' already exists")]
    DuplicateFlow(String),

    /// Attempt to unregister the active flow
    #[error("Cannot remove the currently active flow")]
    ActiveFlowRemoval,

    /// Attempt to unregister a flow that an invocation will return to
    #[error("Cannot remove flow '{0}' while an invocation is waiting to return to it")]
    PendingFlowRemoval(String),

    /// `@variable` target did not resolve to a string
    #[error("Context variable '{0}' not found or not a string")]
    UnresolvedTarget(String),

    /// Target that cannot be interpreted
    #[error("Invalid transition target: {0}")]
    InvalidTarget(String),

    /// Invoking transition has no handler for the termination reason
    #[error("No '{reason}' result handler on the invoking transition in state '{state}' of flow '{flow}'")]
    MissingResultHandler {
        /// Invoking flow
        flow: String,
        /// Invoking state
        state: String,
        /// Termination reason
        reason: TerminationReason,
    },

    /// Termination with an empty execution stack
    #[error("Flow '{flow}' terminated with '{reason}' but no invoking flow is waiting for its result")]
    RootFlowTermination {
        /// Terminating flow
        flow: String,
        /// Termination reason
        reason: TerminationReason,
    },

    /// Transient drain did not settle
    #[error("Transient state chain exceeded {0} steps")]
    TransientLimitExceeded(usize),

    /// No flow has been registered yet
    #[error("No active machine")]
    NoActiveMachine,

    /// Condition evaluation error
    #[error("Condition evaluation error: {0}")]
    ConditionEvaluationError(String),

    /// Expression evaluation error
    #[error("Expression evaluation error: {0}")]
    ExpressionError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Session token could not be restored
    #[error("Failed to deserialize agent state: {0}")]
    DeserializationError(String),

    /// State change handler failed
    #[error("State change handler failed: {0}")]
    EventHandlerError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Result alias used throughout the runtime
pub type CoreResult<T> = Result<T, CoreError>;

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<DefinitionError> for CoreError {
    fn from(err: DefinitionError) -> Self {
        CoreError::DefinitionError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}
