use std::fmt;
use std::error::Error;
use serde_json::Value;
use crate::error::DefinitionError;

mod flow_validator;
mod shape_validator;

/// Represents a validation error found in a machine definition document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Error code (should be a constant identifier)
    pub code: &'static str,

    /// Human-readable error message
    pub message: String,

    /// Optional path to the location of the error (e.g., "flows.Order.states.Start.transitions[0]")
    pub path: Option<String>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(path) = &self.path {
            write!(f, "{}: {} (at {})", self.code, self.message, path)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl Error for ValidationError {}

/// Validation error codes
pub mod error_codes {
    /// A value has the wrong JSON type
    pub const INVALID_TYPE: &str = "ERR_DEF_VALIDATION_INVALID_TYPE";

    /// Missing required field
    pub const MISSING_REQUIRED_FIELD: &str = "ERR_DEF_VALIDATION_MISSING_REQUIRED_FIELD";

    /// Invalid reference (initial state, initial flow)
    pub const INVALID_REFERENCE: &str = "ERR_DEF_VALIDATION_INVALID_REFERENCE";

    /// Both the single-flow and the multi-flow shape are present
    pub const MIXED_SHAPE: &str = "ERR_DEF_VALIDATION_MIXED_SHAPE";

    /// Neither shape is present
    pub const UNKNOWN_SHAPE: &str = "ERR_DEF_VALIDATION_UNKNOWN_SHAPE";

    /// Multi-flow machine without flows
    pub const EMPTY_MACHINE: &str = "ERR_DEF_VALIDATION_EMPTY_MACHINE";

    /// Malformed transition condition
    pub const INVALID_CONDITION: &str = "ERR_DEF_VALIDATION_INVALID_CONDITION";

    /// Malformed context operation
    pub const INVALID_OPERATION: &str = "ERR_DEF_VALIDATION_INVALID_OPERATION";

    /// Malformed flow invocation
    pub const INVALID_INVOCATION: &str = "ERR_DEF_VALIDATION_INVALID_INVOCATION";
}

/// A trait for validators that check specific aspects of a raw definition document
pub trait Validator {
    /// Validate the document and return a list of validation errors (if any)
    fn validate(&self, document: &Value) -> Vec<ValidationError>;
}

/// Which of the two machine shapes a document uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineShape {
    /// `id`, `initial`, `states`
    SingleFlow,
    /// `id`, `initialFlow`, `flows`
    MultiFlow,
    /// Keys of both shapes
    Mixed,
    /// Keys of neither shape
    Unknown,
}

/// Detect the shape of a raw document by key presence
pub fn detect_shape(document: &Value) -> MachineShape {
    let single = document.get("states").is_some() || document.get("initial").is_some();
    let multi = document.get("flows").is_some() || document.get("initialFlow").is_some();

    match (single, multi) {
        (true, false) => MachineShape::SingleFlow,
        (false, true) => MachineShape::MultiFlow,
        (true, true) => MachineShape::Mixed,
        (false, false) => MachineShape::Unknown,
    }
}

/// Validate a raw machine definition document
pub fn validate_document(document: &Value) -> Result<(), DefinitionError> {
    let validators: Vec<Box<dyn Validator>> = vec![
        Box::new(shape_validator::ShapeValidator::new()),
        Box::new(flow_validator::FlowValidator::new()),
    ];

    let mut errors = Vec::new();

    for validator in validators {
        errors.extend(validator.validate(document));
    }

    if !errors.is_empty() {
        return Err(DefinitionError::from_validation_errors(errors));
    }

    Ok(())
}
