use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use csm_definition::{markers, FlowDefinition, MachineDefinition, StateDefinition, TerminationReason, TransitionDefinition};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::condition::{ConditionEvaluator, DefaultConditionEvaluator};
use crate::domain::pattern::{compile_wildcard, interpolate, is_wildcard};
use crate::domain::sub_flow::{is_sub_flow_call, resolve_invocation};
use crate::domain::transition::TransitionResult;
use crate::error::{CoreError, CoreResult};
use crate::types::{lookup_path, Context};

/// Pattern-matching state machine for a single flow.
///
/// The machine knows nothing about other flows: cross-flow jumps, invocations
/// and terminations are reported as [`TransitionResult`] variants for the
/// agent to act on. Only plain state transitions move `current_state`.
pub struct FlowMachine {
    definition: FlowDefinition,
    current_state: String,
    wildcards: HashMap<(String, String), Regex>,
    evaluator: Arc<dyn ConditionEvaluator>,
}

impl fmt::Debug for FlowMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowMachine")
            .field("id", &self.definition.id)
            .field("current_state", &self.current_state)
            .finish_non_exhaustive()
    }
}

impl FlowMachine {
    /// Build a machine with the default condition evaluator
    pub fn new(definition: FlowDefinition) -> CoreResult<Self> {
        Self::with_evaluator(definition, Arc::new(DefaultConditionEvaluator))
    }

    /// Build a machine with a custom condition evaluator
    pub fn with_evaluator(definition: FlowDefinition, evaluator: Arc<dyn ConditionEvaluator>) -> CoreResult<Self> {
        definition.validate()?;

        let mut wildcards = HashMap::new();
        for (state_id, state) in &definition.states {
            for pattern in state.transitions.iter().filter_map(|t| t.pattern.as_deref()) {
                if is_wildcard(pattern) {
                    wildcards.insert((state_id.clone(), pattern.to_string()), compile_wildcard(pattern)?);
                }
            }
        }

        Ok(FlowMachine {
            current_state: definition.initial.clone(),
            definition,
            wildcards,
            evaluator,
        })
    }

    /// Build from a machine definition, which must use the single-flow shape
    pub fn from_machine(machine: MachineDefinition) -> CoreResult<Self> {
        match machine {
            MachineDefinition::Single(flow) => Self::new(flow),
            MachineDefinition::Multi(multi) => Err(CoreError::DefinitionError(format!(
                "Machine '{}' uses the multi-flow shape; register it with an agent instead",
                multi.id
            ))),
        }
    }

    /// Flow id
    pub fn id(&self) -> &str {
        &self.definition.id
    }

    /// Flow definition
    pub fn definition(&self) -> &FlowDefinition {
        &self.definition
    }

    /// Current state id
    pub fn current_state(&self) -> &str {
        &self.current_state
    }

    /// Current state definition
    pub fn current_state_definition(&self) -> Option<&StateDefinition> {
        self.definition.states.get(&self.current_state)
    }

    /// Move to `state`, which must exist
    pub fn set_state(&mut self, state: &str) -> CoreResult<()> {
        if !self.definition.states.contains_key(state) {
            return Err(CoreError::StateNotFound {
                state: state.to_string(),
                flow: self.definition.id.clone(),
            });
        }
        self.current_state = state.to_string();
        Ok(())
    }

    /// Return to the initial state
    pub fn reset(&mut self) {
        self.current_state = self.definition.initial.clone();
    }

    /// Exactly one transition, without a pattern
    pub fn is_transient(&self) -> bool {
        self.transient_transition().is_some()
    }

    /// The automatic transition of a transient state
    pub fn transient_transition(&self) -> Option<&TransitionDefinition> {
        match self.current_state_definition().map(|state| state.transitions.as_slice()) {
            Some([only]) if only.is_automatic() => Some(only),
            _ => None,
        }
    }

    /// Evaluate `input` against the current state.
    ///
    /// Transitions are tried by descending priority, ties in declaration
    /// order. Condition and interpolation failures count as non-matches.
    pub fn transition(&mut self, input: &str, context: &Context) -> CoreResult<TransitionResult> {
        let state = self.current_state_definition().ok_or_else(|| CoreError::StateNotFound {
            state: self.current_state.clone(),
            flow: self.definition.id.clone(),
        })?;

        let mut ordered: Vec<(usize, &TransitionDefinition)> = state.transitions.iter().enumerate().collect();
        ordered.sort_by(|a, b| b.1.priority.cmp(&a.1.priority));

        let matched = ordered
            .iter()
            .find(|(_, transition)| self.matches(transition, input, context))
            .or_else(|| {
                ordered.iter().find(|(_, transition)| {
                    transition.pattern.is_none() || transition.pattern.as_deref() == Some(markers::DEFAULT_PATTERN)
                })
            })
            .map(|(index, transition)| (*index, (*transition).clone()));

        match matched {
            Some((index, transition)) => {
                debug!(
                    flow_id = %self.definition.id,
                    state = %self.current_state,
                    pattern = ?transition.pattern,
                    target = %transition.target,
                    "Transition matched"
                );
                self.create_result(index, transition, context)
            }
            None => Ok(TransitionResult::None),
        }
    }

    fn matches(&self, transition: &TransitionDefinition, input: &str, context: &Context) -> bool {
        let pattern = match transition.pattern.as_deref() {
            None => return true,
            Some(pattern) => pattern,
        };
        if pattern == markers::DEFAULT_PATTERN {
            return true;
        }

        if let Some(condition) = &transition.condition {
            match self.evaluator.evaluate(condition, context) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(err) => {
                    warn!(flow_id = %self.definition.id, state = %self.current_state, error = %err, "Condition evaluation failed");
                    return false;
                }
            }
        }

        let resolved = match interpolate(pattern, context) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(flow_id = %self.definition.id, state = %self.current_state, error = %err, "Pattern interpolation failed");
                return false;
            }
        };

        if resolved.to_lowercase() == input.to_lowercase() {
            return true;
        }

        self.wildcards
            .get(&(self.current_state.clone(), pattern.to_string()))
            .map(|regex| regex.is_match(input))
            .unwrap_or(false)
    }

    fn create_result(
        &mut self,
        transition_index: usize,
        transition: TransitionDefinition,
        context: &Context,
    ) -> CoreResult<TransitionResult> {
        if let Some(invocation) = resolve_invocation(&transition, &self.current_state)? {
            return Ok(TransitionResult::FlowInvocation {
                invocation,
                transition_index,
                transition,
            });
        }

        let target = match transition.target.strip_prefix(markers::VARIABLE_PREFIX) {
            Some(variable) => match lookup_path(context, variable) {
                Some(Value::String(resolved)) if is_sub_flow_call(resolved) => {
                    return Err(CoreError::InvalidTarget(format!(
                        "'@{}' resolved to sub-flow call '{}'; calls must be declared literally",
                        variable, resolved
                    )))
                }
                Some(Value::String(resolved)) => resolved.clone(),
                _ => return Err(CoreError::UnresolvedTarget(variable.to_string())),
            },
            None => transition.target.clone(),
        };

        if let Some(reason) = TerminationReason::from_target(&target) {
            return Ok(TransitionResult::FlowTermination { reason, transition });
        }

        if let Some(machine) = target.strip_prefix(markers::MACHINE_PREFIX) {
            return Ok(TransitionResult::Machine {
                target: machine.to_string(),
                transition,
            });
        }

        self.set_state(&target)?;
        Ok(TransitionResult::State { target, transition })
    }
}
