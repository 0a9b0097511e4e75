//! # CSM Definition
//!
//! Data model and loading of conversational state machine definitions.
//!
//! A machine definition is produced by an external DSL compiler as JSON (or
//! YAML). It comes in one of two shapes:
//!
//! * the legacy single-flow shape: `id`, `initial`, `states`
//! * the multi-flow shape: `id`, `initialFlow`, `flows`
//!
//! Loading runs structural validation over the raw document first, so every
//! problem is reported with a code and a path, then decodes the typed model
//! and checks its references.
//!
//! ## Example
//!
//! ```
//! use csm_definition::parse_machine_definition;
//!
//! let json = r#"{
//!     "id": "Greeting",
//!     "initial": "Start",
//!     "states": {
//!         "Start": { "transitions": [{ "pattern": "hello", "target": "Done" }] },
//!         "Done": { "transitions": [] }
//!     }
//! }"#;
//!
//! let machine = parse_machine_definition(json).unwrap();
//! assert_eq!(machine.id(), "Greeting");
//! ```
//!
//! Handling validation errors:
//!
//! ```
//! use csm_definition::parse_machine_definition;
//!
//! let json = r#"{ "id": "Greeting", "initial": "Missing", "states": {} }"#;
//!
//! let err = parse_machine_definition(json).unwrap_err();
//! assert!(err.error_code().contains("INVALID_REFERENCE"));
//! ```

mod error;
mod parser;

pub mod analysis;
pub mod machine;
pub mod validation;

pub use error::DefinitionError;
pub use machine::{
    markers, Condition, ContextMap, ContextOperation, FlowDefinition, FlowInvocation, MachineDefinition,
    MultiFlowMachine, ResultHandler, ResultHandlers, ReturnType, StateDefinition, StateMeta, TerminationReason,
    TransitionDefinition,
};
pub use parser::{machine_from_value, parse_machine_definition, parse_machine_definition_yaml};
pub use validation::ValidationError;

/// Returns a version string for the definition crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
