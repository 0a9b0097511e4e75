mod condition;
mod operation;
mod state;
mod transition;

pub use condition::Condition;
pub use operation::ContextOperation;
pub use state::{StateDefinition, StateMeta};
pub use transition::{
    markers, FlowInvocation, ResultHandler, ResultHandlers, TerminationReason, TransitionDefinition,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::DefinitionError;
use crate::validation::{error_codes, ValidationError};

/// Key-value map used for context tiers, parameters and metadata
pub type ContextMap = serde_json::Map<String, serde_json::Value>;

/// A loadable machine: either the legacy single-flow shape or the multi-flow shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MachineDefinition {
    /// Several flows sharing one context
    Multi(MultiFlowMachine),

    /// A single flow
    Single(FlowDefinition),
}

impl MachineDefinition {
    /// Machine id
    pub fn id(&self) -> &str {
        match self {
            MachineDefinition::Multi(machine) => &machine.id,
            MachineDefinition::Single(flow) => &flow.id,
        }
    }

    /// All flows of the machine
    pub fn flows(&self) -> Vec<&FlowDefinition> {
        match self {
            MachineDefinition::Multi(machine) => machine.flows.values().collect(),
            MachineDefinition::Single(flow) => vec![flow],
        }
    }

    /// Collapse to a single flow.
    ///
    /// A multi-flow machine yields its initial flow, with the machine metadata
    /// merged under the flow's own and the extraction recorded in `meta`.
    pub fn into_single_flow(self) -> Result<FlowDefinition, DefinitionError> {
        let machine = match self {
            MachineDefinition::Single(flow) => return Ok(flow),
            MachineDefinition::Multi(machine) => machine,
        };

        let MultiFlowMachine { id, initial_flow, mut flows, meta } = machine;
        let mut flow = flows.remove(&initial_flow).ok_or_else(|| {
            DefinitionError::from_validation_errors(vec![ValidationError {
                code: error_codes::INVALID_REFERENCE,
                message: format!("Flow '{}' not found in machine definition", initial_flow),
                path: Some("initialFlow".to_string()),
            }])
        })?;

        let mut merged = meta.unwrap_or_default();
        merged.extend(flow.meta.take().unwrap_or_default());
        merged.insert("originalStructure".to_string(), "multi-flow".into());
        merged.insert("extractedFlow".to_string(), initial_flow.into());
        flow.meta = Some(merged);
        if !id.is_empty() {
            flow.id = id;
        }
        Ok(flow)
    }

    /// Semantic checks on a typed definition
    pub fn validate(&self) -> Result<(), DefinitionError> {
        let errors = match self {
            MachineDefinition::Multi(machine) => machine.semantic_errors(),
            MachineDefinition::Single(flow) => flow.semantic_errors(""),
        };

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DefinitionError::from_validation_errors(errors))
        }
    }
}

impl From<FlowDefinition> for MachineDefinition {
    fn from(flow: FlowDefinition) -> Self {
        MachineDefinition::Single(flow)
    }
}

impl From<MultiFlowMachine> for MachineDefinition {
    fn from(machine: MultiFlowMachine) -> Self {
        MachineDefinition::Multi(machine)
    }
}

/// The multi-flow shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiFlowMachine {
    /// Machine id
    pub id: String,

    /// Flow activated when the machine is loaded
    pub initial_flow: String,

    /// Flows keyed by their id
    pub flows: BTreeMap<String, FlowDefinition>,

    /// Optional metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ContextMap>,
}

impl MultiFlowMachine {
    /// Empty machine
    pub fn new(id: impl Into<String>, initial_flow: impl Into<String>) -> Self {
        MultiFlowMachine {
            id: id.into(),
            initial_flow: initial_flow.into(),
            flows: BTreeMap::new(),
            meta: None,
        }
    }

    /// Add a flow under its own id
    pub fn with_flow(mut self, flow: FlowDefinition) -> Self {
        self.flows.insert(flow.id.clone(), flow);
        self
    }

    /// The map key is the canonical flow id
    pub fn normalize_flow_ids(&mut self) {
        for (key, flow) in self.flows.iter_mut() {
            if flow.id != *key {
                flow.id = key.clone();
            }
        }
    }

    fn semantic_errors(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.id.is_empty() {
            errors.push(ValidationError {
                code: error_codes::MISSING_REQUIRED_FIELD,
                message: "Machine definition must have an id string".to_string(),
                path: Some("id".to_string()),
            });
        }

        if self.flows.is_empty() {
            errors.push(ValidationError {
                code: error_codes::EMPTY_MACHINE,
                message: "Multi-flow machine must define at least one flow".to_string(),
                path: Some("flows".to_string()),
            });
        } else if !self.flows.contains_key(&self.initial_flow) {
            errors.push(ValidationError {
                code: error_codes::INVALID_REFERENCE,
                message: format!("Initial flow '{}' not found in flows", self.initial_flow),
                path: Some("initialFlow".to_string()),
            });
        }

        for (key, flow) in &self.flows {
            errors.extend(flow.semantic_errors(&format!("flows.{}.", key)));
        }

        errors
    }
}

/// A single flow: states and transitions for one sub-topic of a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    /// Flow id
    #[serde(default)]
    pub id: String,

    /// Initial state id
    pub initial: String,

    /// States keyed by id
    pub states: BTreeMap<String, StateDefinition>,

    /// Optional metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ContextMap>,

    /// Shape of the value returned when the flow is invoked as a sub-flow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_type: Option<ReturnType>,
}

impl FlowDefinition {
    /// Flow with no states
    pub fn new(id: impl Into<String>, initial: impl Into<String>) -> Self {
        FlowDefinition {
            id: id.into(),
            initial: initial.into(),
            states: BTreeMap::new(),
            meta: None,
            return_type: None,
        }
    }

    /// Add a state
    pub fn with_state(mut self, id: impl Into<String>, state: StateDefinition) -> Self {
        self.states.insert(id.into(), state);
        self
    }

    /// Set the return type
    pub fn with_return_type(mut self, return_type: ReturnType) -> Self {
        self.return_type = Some(return_type);
        self
    }

    /// Look up a state
    pub fn state(&self, id: &str) -> Option<&StateDefinition> {
        self.states.get(id)
    }

    /// Semantic checks on a typed flow
    pub fn validate(&self) -> Result<(), DefinitionError> {
        let errors = self.semantic_errors("");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(DefinitionError::from_validation_errors(errors))
        }
    }

    fn semantic_errors(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.id.is_empty() {
            errors.push(ValidationError {
                code: error_codes::MISSING_REQUIRED_FIELD,
                message: "Flow definition must have an id string".to_string(),
                path: Some(format!("{}id", prefix)),
            });
        }

        if !self.states.contains_key(&self.initial) {
            errors.push(ValidationError {
                code: error_codes::INVALID_REFERENCE,
                message: format!("Initial state '{}' not found in states", self.initial),
                path: Some(format!("{}initial", prefix)),
            });
        }

        errors
    }
}

/// Return-type descriptor of a sub-flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnType {
    /// Declared type name, informational
    #[serde(rename = "type")]
    pub type_name: String,

    /// Whitelisted context fields copied into the return value
    #[serde(default)]
    pub fields: Vec<String>,

    /// Object-literal expression computing the return value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
}

impl ReturnType {
    /// Return type copying `fields`
    pub fn new(type_name: impl Into<String>, fields: &[&str]) -> Self {
        ReturnType {
            type_name: type_name.into(),
            fields: fields.iter().map(|field| field.to_string()).collect(),
            transform: None,
        }
    }

    /// Set the transform expression
    pub fn with_transform(mut self, transform: impl Into<String>) -> Self {
        self.transform = Some(transform.into());
        self
    }
}
