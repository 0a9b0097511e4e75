use serde_json::Value;
use tracing::debug;

use crate::error::DefinitionError;
use crate::machine::{FlowDefinition, MachineDefinition, MultiFlowMachine};
use crate::validation::{self, detect_shape, MachineShape};

/// Parse a JSON machine definition, validating it structurally and semantically.
pub fn parse_machine_definition(json_str: &str) -> Result<MachineDefinition, DefinitionError> {
    let document: Value = serde_json::from_str(json_str)?;
    machine_from_value(document)
}

/// Parse a YAML machine definition.
///
/// YAML is decoded into the same JSON document model before validation, so
/// both encodings accept exactly the same definitions.
pub fn parse_machine_definition_yaml(yaml_str: &str) -> Result<MachineDefinition, DefinitionError> {
    let document: Value = serde_yaml::from_str(yaml_str)?;
    machine_from_value(document)
}

/// Turn an already decoded document into a typed machine definition.
pub fn machine_from_value(document: Value) -> Result<MachineDefinition, DefinitionError> {
    validation::validate_document(&document)?;

    let machine = match detect_shape(&document) {
        MachineShape::SingleFlow => MachineDefinition::Single(serde_json::from_value::<FlowDefinition>(document)?),
        MachineShape::MultiFlow => {
            let mut machine: MultiFlowMachine = serde_json::from_value(document)?;
            machine.normalize_flow_ids();
            MachineDefinition::Multi(machine)
        }
        shape => return Err(DefinitionError::UnsupportedShape(format!("{:?}", shape))),
    };

    machine.validate()?;

    debug!(machine_id = %machine.id(), flows = machine.flows().len(), "Loaded machine definition");
    Ok(machine)
}
