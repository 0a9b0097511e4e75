use thiserror::Error;
use crate::validation::ValidationError;
use std::fmt;

/// All possible errors that can occur while loading a machine definition
#[derive(Error, Debug)]
pub enum DefinitionError {
    /// Errors that occur during YAML parsing
    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Errors that occur during JSON processing
    #[error("JSON processing error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// A single validation error
    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),

    /// Multiple validation errors
    #[error("{}", MultipleErrorsFormat(.0))]
    MultipleValidationErrors(Vec<ValidationError>),

    /// The document is neither a single-flow nor a multi-flow machine
    #[error("Unsupported machine shape: {0}")]
    UnsupportedShape(String),

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(String),
}

// Helper struct to format multiple errors
struct MultipleErrorsFormat<'a>(&'a [ValidationError]);

impl fmt::Display for MultipleErrorsFormat<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Multiple validation errors ({} issues):", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            write!(f, "\n  {}. {}", i + 1, err)?;
        }
        Ok(())
    }
}

impl DefinitionError {
    /// Create a DefinitionError from a vector of validation errors
    pub fn from_validation_errors(errors: Vec<ValidationError>) -> Self {
        let mut errors = errors;
        match errors.len() {
            0 => DefinitionError::InternalError("Called from_validation_errors with empty vector".to_string()),
            1 => DefinitionError::ValidationError(errors.remove(0)),
            _ => DefinitionError::MultipleValidationErrors(errors),
        }
    }

    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            DefinitionError::YamlError(_) => "ERR_DEF_YAML_PARSE",
            DefinitionError::JsonError(_) => "ERR_DEF_JSON_PARSE",
            DefinitionError::ValidationError(err) => err.code,
            DefinitionError::MultipleValidationErrors(_) => "ERR_DEF_VALIDATION_MULTIPLE",
            DefinitionError::UnsupportedShape(_) => "ERR_DEF_UNSUPPORTED_SHAPE",
            DefinitionError::InternalError(_) => "ERR_DEF_INTERNAL",
        }
    }

    /// All validation errors carried by this error, if any
    pub fn validation_errors(&self) -> Vec<&ValidationError> {
        match self {
            DefinitionError::ValidationError(err) => vec![err],
            DefinitionError::MultipleValidationErrors(errs) => errs.iter().collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::error_codes;

    fn validation_error(message: &str) -> ValidationError {
        ValidationError {
            code: error_codes::MISSING_REQUIRED_FIELD,
            message: message.to_string(),
            path: Some("states.Start".to_string()),
        }
    }

    #[test]
    fn test_from_single_validation_error() {
        let err = DefinitionError::from_validation_errors(vec![validation_error("missing")]);
        assert!(matches!(err, DefinitionError::ValidationError(_)));
        assert_eq!(err.error_code(), error_codes::MISSING_REQUIRED_FIELD);
    }

    #[test]
    fn test_multiple_errors_display() {
        let err = DefinitionError::from_validation_errors(vec![
            validation_error("first"),
            validation_error("second"),
        ]);
        let text = err.to_string();
        assert!(text.starts_with("Multiple validation errors (2 issues):"));
        assert!(text.contains("1. ERR_DEF_VALIDATION_MISSING_REQUIRED_FIELD: first (at states.Start)"));
        assert_eq!(err.validation_errors().len(), 2);
    }

    #[test]
    fn test_empty_errors_is_internal() {
        let err = DefinitionError::from_validation_errors(Vec::new());
        assert_eq!(err.error_code(), "ERR_DEF_INTERNAL");
    }
}
