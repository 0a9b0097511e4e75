use serde_json::{Map, Value};
use crate::validation::{detect_shape, error_codes, MachineShape, ValidationError, Validator};

/// Validates flows, states and transitions of either machine shape
pub struct FlowValidator {}

/// A flow located in the document, with the prefix used for error paths
struct FlowLocation<'a> {
    name: Option<&'a str>,
    prefix: String,
    value: &'a Value,
}

impl FlowValidator {
    /// Create a new flow validator
    pub fn new() -> Self {
        FlowValidator {}
    }

    fn locate_flows<'a>(&self, document: &'a Value) -> Vec<FlowLocation<'a>> {
        match detect_shape(document) {
            MachineShape::SingleFlow => vec![FlowLocation {
                name: None,
                prefix: String::new(),
                value: document,
            }],
            MachineShape::MultiFlow => match document.get("flows") {
                Some(Value::Object(flows)) => flows
                    .iter()
                    .map(|(key, value)| FlowLocation {
                        name: Some(key.as_str()),
                        prefix: format!("flows.{}.", key),
                        value,
                    })
                    .collect(),
                _ => Vec::new(),
            },
            MachineShape::Mixed | MachineShape::Unknown => Vec::new(),
        }
    }

    fn validate_flow(&self, flow: &FlowLocation<'_>) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let subject = match flow.name {
            Some(name) => format!("Flow '{}'", name),
            None => "Machine definition".to_string(),
        };

        let object = match flow.value.as_object() {
            Some(object) => object,
            None => {
                errors.push(ValidationError {
                    code: error_codes::INVALID_TYPE,
                    message: format!("{} must be an object", subject),
                    path: Some(flow.prefix.trim_end_matches('.').to_string()),
                });
                return errors;
            }
        };

        let initial = object.get("initial").and_then(Value::as_str);
        if initial.is_none() {
            errors.push(ValidationError {
                code: error_codes::MISSING_REQUIRED_FIELD,
                message: format!("{} must have an initial state", subject),
                path: Some(format!("{}initial", flow.prefix)),
            });
        }

        let states = match object.get("states").and_then(Value::as_object) {
            Some(states) => states,
            None => {
                errors.push(ValidationError {
                    code: error_codes::MISSING_REQUIRED_FIELD,
                    message: format!("{} must have states object", subject),
                    path: Some(format!("{}states", flow.prefix)),
                });
                return errors;
            }
        };

        for (state_id, state) in states {
            errors.extend(self.validate_state(state_id, state, &format!("{}states.{}", flow.prefix, state_id)));
        }

        if let Some(initial) = initial {
            if !states.contains_key(initial) {
                errors.push(ValidationError {
                    code: error_codes::INVALID_REFERENCE,
                    message: format!("Initial state '{}' not found in states", initial),
                    path: Some(format!("{}initial", flow.prefix)),
                });
            }
        }

        errors
    }

    fn validate_state(&self, state_id: &str, state: &Value, path: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        let object = match state.as_object() {
            Some(object) => object,
            None => {
                errors.push(ValidationError {
                    code: error_codes::INVALID_TYPE,
                    message: format!("State '{}' must be an object", state_id),
                    path: Some(path.to_string()),
                });
                return errors;
            }
        };

        if let Some(meta) = object.get("meta") {
            if !meta.is_object() {
                errors.push(ValidationError {
                    code: error_codes::INVALID_TYPE,
                    message: format!("State '{}' meta must be an object", state_id),
                    path: Some(format!("{}.meta", path)),
                });
            }
        }

        let transitions = match object.get("transitions").and_then(Value::as_array) {
            Some(transitions) => transitions,
            None => {
                errors.push(ValidationError {
                    code: error_codes::MISSING_REQUIRED_FIELD,
                    message: format!("State '{}' must have transitions array", state_id),
                    path: Some(format!("{}.transitions", path)),
                });
                return errors;
            }
        };

        for (index, transition) in transitions.iter().enumerate() {
            let transition_path = format!("{}.transitions[{}]", path, index);
            errors.extend(self.validate_transition(state_id, index, transition, &transition_path));
        }

        errors
    }

    fn validate_transition(&self, state_id: &str, index: usize, transition: &Value, path: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        let object = match transition.as_object() {
            Some(object) => object,
            None => {
                errors.push(ValidationError {
                    code: error_codes::INVALID_TYPE,
                    message: format!("Transition {} in state '{}' must be an object", index, state_id),
                    path: Some(path.to_string()),
                });
                return errors;
            }
        };

        let has_invocation = object.contains_key("flowInvocation");
        let target_ok = match object.get("target") {
            Some(target) => target.is_string(),
            None => has_invocation,
        };
        if !target_ok {
            errors.push(ValidationError {
                code: error_codes::MISSING_REQUIRED_FIELD,
                message: format!("Transition {} in state '{}' must have a target string", index, state_id),
                path: Some(format!("{}.target", path)),
            });
        }

        let field_checks: [(&str, fn(&Value) -> bool, &str); 3] = [
            ("pattern", Value::is_string, "a string"),
            ("priority", Value::is_i64, "an integer"),
            ("context", Value::is_object, "an object"),
        ];
        for (field, check, expected) in field_checks {
            if let Some(value) = object.get(field) {
                if !check(value) {
                    errors.push(ValidationError {
                        code: error_codes::INVALID_TYPE,
                        message: format!(
                            "Transition {} in state '{}' {} must be {}",
                            index, state_id, field, expected
                        ),
                        path: Some(format!("{}.{}", path, field)),
                    });
                }
            }
        }

        if let Some(condition) = object.get("condition") {
            if !is_valid_condition(condition) {
                errors.push(ValidationError {
                    code: error_codes::INVALID_CONDITION,
                    message: format!(
                        "Transition {} in state '{}' has an invalid condition; expected an expression string, {{\"type\": \"code\", \"expression\"}} or {{\"type\": \"jsonlogic\", \"rule\"}}",
                        index, state_id
                    ),
                    path: Some(format!("{}.condition", path)),
                });
            }
        }

        if let Some(invocation) = object.get("flowInvocation") {
            errors.extend(self.validate_invocation(invocation, &format!("{}.flowInvocation", path)));
        }

        errors
    }

    fn validate_invocation(&self, invocation: &Value, path: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        let object = match invocation.as_object() {
            Some(object) => object,
            None => {
                errors.push(invalid_invocation("Flow invocation must be an object", path));
                return errors;
            }
        };

        if !object.get("flowId").map(Value::is_string).unwrap_or(false) {
            errors.push(invalid_invocation("Flow invocation must have a flowId string", &format!("{}.flowId", path)));
        }

        if let Some(parameters) = object.get("parameters") {
            if !parameters.is_object() {
                errors.push(invalid_invocation(
                    "Flow invocation parameters must be an object",
                    &format!("{}.parameters", path),
                ));
            }
        }

        let handlers = match object.get("onResult") {
            None => return errors,
            Some(Value::Object(handlers)) => handlers,
            Some(_) => {
                errors.push(invalid_invocation("onResult must be an object", &format!("{}.onResult", path)));
                return errors;
            }
        };

        for (reason, handler) in handlers {
            let handler_path = format!("{}.onResult.{}", path, reason);
            if !matches!(reason.as_str(), "end" | "cancel" | "error") {
                errors.push(invalid_invocation(
                    &format!("Unknown result handler '{}'; expected end, cancel or error", reason),
                    &handler_path,
                ));
                continue;
            }
            errors.extend(self.validate_handler(handler, &handler_path));
        }

        errors
    }

    fn validate_handler(&self, handler: &Value, path: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        let object = match handler.as_object() {
            Some(object) => object,
            None => {
                errors.push(invalid_invocation("Result handler must be an object", path));
                return errors;
            }
        };

        if !object.get("target").map(Value::is_string).unwrap_or(false) {
            errors.push(invalid_invocation(
                "Result handler must have a target string",
                &format!("{}.target", path),
            ));
        }

        match object.get("operations") {
            None => {}
            Some(Value::Array(operations)) => {
                for (index, operation) in operations.iter().enumerate() {
                    if let Some(message) = operation_problem(operation) {
                        errors.push(ValidationError {
                            code: error_codes::INVALID_OPERATION,
                            message,
                            path: Some(format!("{}.operations[{}]", path, index)),
                        });
                    }
                }
            }
            Some(_) => errors.push(ValidationError {
                code: error_codes::INVALID_OPERATION,
                message: "Result handler operations must be an array".to_string(),
                path: Some(format!("{}.operations", path)),
            }),
        }

        errors
    }
}

impl Default for FlowValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator for FlowValidator {
    fn validate(&self, document: &Value) -> Vec<ValidationError> {
        self.locate_flows(document)
            .iter()
            .flat_map(|flow| self.validate_flow(flow))
            .collect()
    }
}

fn invalid_invocation(message: &str, path: &str) -> ValidationError {
    ValidationError {
        code: error_codes::INVALID_INVOCATION,
        message: message.to_string(),
        path: Some(path.to_string()),
    }
}

fn is_valid_condition(condition: &Value) -> bool {
    match condition {
        Value::String(_) => true,
        Value::Object(object) => match object.get("type").and_then(Value::as_str) {
            Some("code") => object.get("expression").map(Value::is_string).unwrap_or(false),
            Some("jsonlogic") => object.contains_key("rule"),
            _ => false,
        },
        _ => false,
    }
}

fn operation_problem(operation: &Value) -> Option<String> {
    let object: &Map<String, Value> = match operation.as_object() {
        Some(object) if object.len() == 1 => object,
        _ => return Some("Context operation must be an object with exactly one of set, append or merge".to_string()),
    };

    let (kind, body) = object.iter().next()?;
    let name_field = match kind.as_str() {
        "set" => "variable",
        "append" => "to",
        "merge" => "into",
        other => return Some(format!("Unknown context operation '{}'", other)),
    };

    let body = match body.as_object() {
        Some(body) => body,
        None => return Some(format!("Context operation '{}' must be an object", kind)),
    };

    if !body.get(name_field).map(Value::is_string).unwrap_or(false) {
        return Some(format!("Context operation '{}' must have a {} string", kind, name_field));
    }
    if !body.contains_key("value") {
        return Some(format!("Context operation '{}' must have a value", kind));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn messages(document: Value) -> Vec<String> {
        FlowValidator::new()
            .validate(&document)
            .into_iter()
            .map(|e| e.message)
            .collect()
    }

    #[test]
    fn test_missing_states_object() {
        assert_eq!(
            messages(json!({ "id": "m", "initial": "S" })),
            vec!["Machine definition must have states object".to_string()]
        );
    }

    #[test]
    fn test_initial_state_must_exist() {
        assert_eq!(
            messages(json!({ "id": "m", "initial": "Missing", "states": { "S": { "transitions": [] } } })),
            vec!["Initial state 'Missing' not found in states".to_string()]
        );
    }

    #[test]
    fn test_state_shape_errors() {
        let found = messages(json!({
            "id": "m",
            "initial": "A",
            "states": {
                "A": "not a state",
                "B": { "meta": {} },
                "C": { "transitions": [42, { "pattern": 1, "target": "A", "priority": "high" }] }
            }
        }));

        assert!(found.contains(&"State 'A' must be an object".to_string()));
        assert!(found.contains(&"State 'B' must have transitions array".to_string()));
        assert!(found.contains(&"Transition 0 in state 'C' must be an object".to_string()));
        assert!(found.contains(&"Transition 1 in state 'C' pattern must be a string".to_string()));
        assert!(found.contains(&"Transition 1 in state 'C' priority must be an integer".to_string()));
    }

    #[test]
    fn test_multi_flow_paths() {
        let errors = FlowValidator::new().validate(&json!({
            "id": "m",
            "initialFlow": "Main",
            "flows": {
                "Main": { "initial": "S", "states": { "S": { "transitions": [{ "pattern": "x" }] } } }
            }
        }));

        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path.as_deref(), Some("flows.Main.states.S.transitions[0].target"));
    }

    #[test]
    fn test_condition_shapes() {
        let found = messages(json!({
            "id": "m",
            "initial": "S",
            "states": {
                "S": { "transitions": [
                    { "target": "S", "condition": "context.ok" },
                    { "target": "S", "condition": { "type": "code", "expression": "context.ok" } },
                    { "target": "S", "condition": { "type": "jsonlogic", "rule": { "var": "ok" } } },
                    { "target": "S", "condition": { "type": "python" } }
                ] }
            }
        }));
        assert_eq!(found.len(), 1);
        assert!(found[0].starts_with("Transition 3 in state 'S' has an invalid condition"));
    }

    #[test]
    fn test_flow_invocation_shape() {
        let errors = FlowValidator::new().validate(&json!({
            "id": "m",
            "initial": "S",
            "states": {
                "S": { "transitions": [{
                    "pattern": "go",
                    "flowInvocation": {
                        "flowId": "Sub",
                        "onResult": {
                            "end": { "target": "S", "operations": [{ "append": { "to": "orders" } }] },
                            "retry": { "target": "S" },
                            "cancel": { "operations": [] }
                        }
                    }
                }] }
            }
        }));

        let found: Vec<(&str, String)> = errors.iter().map(|e| (e.code, e.message.clone())).collect();
        assert!(found.contains(&(
            error_codes::INVALID_OPERATION,
            "Context operation 'append' must have a value".to_string()
        )));
        assert!(found.contains(&(
            error_codes::INVALID_INVOCATION,
            "Unknown result handler 'retry'; expected end, cancel or error".to_string()
        )));
        assert!(found.contains(&(
            error_codes::INVALID_INVOCATION,
            "Result handler must have a target string".to_string()
        )));
        assert_eq!(found.len(), 3);
    }
}
