use serde_json::Value;
use crate::validation::{detect_shape, error_codes, MachineShape, ValidationError, Validator};

/// Validates the root object and which machine shape it uses
pub struct ShapeValidator {}

impl ShapeValidator {
    /// Create a new shape validator
    pub fn new() -> Self {
        ShapeValidator {}
    }

    fn validate_multi_flow(&self, document: &Value) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        let flows = match document.get("flows") {
            Some(Value::Object(flows)) => flows,
            Some(_) => {
                errors.push(ValidationError {
                    code: error_codes::INVALID_TYPE,
                    message: "Multi-flow machine must have a flows object".to_string(),
                    path: Some("flows".to_string()),
                });
                return errors;
            }
            None => {
                errors.push(ValidationError {
                    code: error_codes::MISSING_REQUIRED_FIELD,
                    message: "Multi-flow machine must have a flows object".to_string(),
                    path: Some("flows".to_string()),
                });
                return errors;
            }
        };

        if flows.is_empty() {
            errors.push(ValidationError {
                code: error_codes::EMPTY_MACHINE,
                message: "Multi-flow machine must define at least one flow".to_string(),
                path: Some("flows".to_string()),
            });
        }

        match document.get("initialFlow") {
            Some(Value::String(initial_flow)) => {
                if !flows.is_empty() && !flows.contains_key(initial_flow) {
                    errors.push(ValidationError {
                        code: error_codes::INVALID_REFERENCE,
                        message: format!("Initial flow '{}' not found in flows", initial_flow),
                        path: Some("initialFlow".to_string()),
                    });
                }
            }
            _ => errors.push(ValidationError {
                code: error_codes::MISSING_REQUIRED_FIELD,
                message: "Multi-flow machine must have an initialFlow string".to_string(),
                path: Some("initialFlow".to_string()),
            }),
        }

        errors
    }
}

impl Default for ShapeValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator for ShapeValidator {
    fn validate(&self, document: &Value) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !document.is_object() {
            errors.push(ValidationError {
                code: error_codes::INVALID_TYPE,
                message: "Machine definition must be an object".to_string(),
                path: None,
            });
            return errors;
        }

        if !document.get("id").map(Value::is_string).unwrap_or(false) {
            errors.push(ValidationError {
                code: error_codes::MISSING_REQUIRED_FIELD,
                message: "Machine definition must have an id string".to_string(),
                path: Some("id".to_string()),
            });
        }

        match detect_shape(document) {
            MachineShape::SingleFlow => {}
            MachineShape::MultiFlow => errors.extend(self.validate_multi_flow(document)),
            MachineShape::Mixed => errors.push(ValidationError {
                code: error_codes::MIXED_SHAPE,
                message: "Machine definition must use either initial/states or initialFlow/flows, not both".to_string(),
                path: None,
            }),
            MachineShape::Unknown => errors.push(ValidationError {
                code: error_codes::UNKNOWN_SHAPE,
                message: "Machine definition must have an initial state and a states object, or an initialFlow and a flows object".to_string(),
                path: None,
            }),
        }

        errors
    }
}
