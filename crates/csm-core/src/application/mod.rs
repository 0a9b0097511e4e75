/// The multi-flow orchestrator
pub mod agent;

/// Event and error hooks
pub mod handlers;

/// Session token codec
pub mod serialization;

/// `call:` convention and standalone sub-flow execution
pub mod subflow_manager;
