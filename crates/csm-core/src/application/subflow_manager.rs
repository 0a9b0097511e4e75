use std::collections::BTreeMap;

use csm_definition::{
    ContextOperation, FlowDefinition, FlowInvocation, ResultHandler, StateDefinition, TerminationReason,
    TransitionDefinition,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::application::agent::{AgentOptions, ConversationalAgent};
use crate::config::AgentConfig;
use crate::domain::scoped_context::{apply_context_operations, FlowResult, ScopedContext};
use crate::domain::sub_flow::{shape_return_value, AggregationStrategy, SubFlowCall};
use crate::error::{CoreError, CoreResult};
use crate::types::Context;

pub use crate::domain::sub_flow::{is_sub_flow_call, parse_sub_flow_call};

const HOST_FLOW: &str = "__subflow_host__";
const RETURN_VARIABLE: &str = "__return";

/// Outcome of a standalone sub-flow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubFlowResult {
    /// The sub-flow ended normally
    pub completed: bool,
    /// Returned value on normal completion
    pub return_value: Option<Value>,
    /// Why the sub-flow did not complete
    pub error: Option<String>,
    /// State the execution stopped in
    pub final_state: String,
}

/// Registry of flows reachable through `call:` targets
#[derive(Debug, Clone, Default)]
pub struct SubFlowManager {
    sub_flows: BTreeMap<String, FlowDefinition>,
    config: AgentConfig,
}

impl SubFlowManager {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty registry whose executions use `config`
    pub fn with_config(config: AgentConfig) -> Self {
        Self {
            sub_flows: BTreeMap::new(),
            config,
        }
    }

    /// Register a sub-flow, replacing any flow with the same id
    pub fn register_sub_flow(&mut self, definition: FlowDefinition) -> CoreResult<()> {
        definition.validate()?;
        debug!(flow_id = %definition.id, "Sub-flow registered");
        self.sub_flows.insert(definition.id.clone(), definition);
        Ok(())
    }

    /// Registered definition
    pub fn definition(&self, flow_id: &str) -> Option<&FlowDefinition> {
        self.sub_flows.get(flow_id)
    }

    /// Registered ids, sorted
    pub fn sub_flow_ids(&self) -> Vec<&str> {
        self.sub_flows.keys().map(String::as_str).collect()
    }

    /// Register every sub-flow the agent does not already know
    pub async fn install(&self, agent: &mut ConversationalAgent) -> CoreResult<()> {
        for definition in self.sub_flows.values() {
            if !agent.has_flow(&definition.id) {
                agent.add_flow(definition.clone()).await?;
            }
        }
        Ok(())
    }

    /// Run a sub-flow to its return, feeding `inputs` one turn at a time.
    ///
    /// The flow is invoked from a scratch host flow, so it runs through the same
    /// invocation and return machinery as inside a conversation. Execution stops
    /// at the first return; inputs left over are ignored.
    pub async fn execute_sub_flow(&self, call: &SubFlowCall, inputs: &[&str]) -> CoreResult<SubFlowResult> {
        if !self.sub_flows.contains_key(&call.flow_id) {
            return Err(CoreError::SubFlowNotFound(call.flow_id.clone()));
        }

        let mut agent = ConversationalAgent::new(AgentOptions::new().with_config(self.config.clone()));
        agent.add_flow(host_flow(&call.flow_id)).await?;
        self.install(&mut agent).await?;

        info!(call = %call, inputs = inputs.len(), "Executing sub-flow");
        if let Err(err) = agent.process_input("").await {
            return Ok(failed(&agent, err));
        }

        for input in inputs {
            if agent.current_machine() == Some(HOST_FLOW) {
                break;
            }
            if let Err(err) = agent.process_input(input).await {
                return Ok(failed(&agent, err));
            }
        }

        let final_state = agent.current_state().unwrap_or_default().to_string();
        if agent.current_machine() != Some(HOST_FLOW) {
            debug!(call = %call, state = %final_state, "Sub-flow still waiting for input");
            return Ok(SubFlowResult {
                completed: false,
                return_value: None,
                error: None,
                final_state,
            });
        }

        let result = match agent.pending_result() {
            Some(FlowResult::Failure(error)) => SubFlowResult {
                completed: false,
                return_value: None,
                error: Some(error.message.clone()),
                final_state,
            },
            _ => SubFlowResult {
                completed: true,
                return_value: agent.context().get(RETURN_VARIABLE).cloned(),
                error: None,
                final_state,
            },
        };
        Ok(result)
    }

    /// Fold `value` into `variable` of a flat context
    pub fn apply_aggregation(
        &self,
        context: &Context,
        variable: &str,
        value: Value,
        strategy: AggregationStrategy,
    ) -> Context {
        let scoped = ScopedContext::with_conversation(context.clone());
        apply_context_operations(&scoped, &[strategy.operation(variable, value)]).conversation
    }

    /// Value a sub-flow returns given its final context
    pub fn create_return_value(&self, definition: &FlowDefinition, context: &Context) -> Value {
        shape_return_value(definition.return_type.as_ref(), context, context)
    }
}

/// Transient host state invoking `flow_id` and parking in a terminal state per outcome
fn host_flow(flow_id: &str) -> FlowDefinition {
    let invocation = FlowInvocation::new(flow_id)
        .on(
            TerminationReason::End,
            ResultHandler::new("Done").with_operation(ContextOperation::Set {
                variable: RETURN_VARIABLE.to_string(),
                value: Value::String("$result".to_string()),
            }),
        )
        .on(TerminationReason::Cancel, ResultHandler::new("Cancelled"))
        .on(TerminationReason::Error, ResultHandler::new("Failed"));

    FlowDefinition::new(HOST_FLOW, "Start")
        .with_state("Start", StateDefinition::new().with_transition(TransitionDefinition::invoke(invocation)))
        .with_state("Done", StateDefinition::new())
        .with_state("Cancelled", StateDefinition::new())
        .with_state("Failed", StateDefinition::new())
}

fn failed(agent: &ConversationalAgent, err: CoreError) -> SubFlowResult {
    warn!(error = %err, "Sub-flow execution failed");
    SubFlowResult {
        completed: false,
        return_value: None,
        error: Some(err.to_string()),
        final_state: agent.current_state().unwrap_or_default().to_string(),
    }
}
