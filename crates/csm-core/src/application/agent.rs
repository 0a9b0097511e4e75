//! The conversational agent: a registry of flow machines sharing one scoped
//! context, an execution stack for nested invocations, and the token codec
//! that carries a session across requests.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use csm_definition::analysis::{analyze_targets, Severity};
use csm_definition::{
    parse_machine_definition, FlowDefinition, FlowInvocation, MachineDefinition, ResultHandler, TerminationReason,
    TransitionDefinition,
};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::handlers::{ErrorHandler, StateChangeHandler};
use crate::application::serialization::{decode_token, encode_token, SerializedAgentState, SCHEMA_VERSION};
use crate::config::{AgentConfig, RootTerminationPolicy};
use crate::domain::condition::{ConditionEvaluator, DefaultConditionEvaluator};
use crate::domain::events::{ErrorContext, ErrorOperation, StateChangeEvent, StateChangeTrigger};
use crate::domain::flow_machine::FlowMachine;
use crate::domain::scoped_context::{
    apply_context_operations, deserialize_flow_execution_state, resolve_result_references,
    serialize_flow_execution_state, FlowError, FlowExecutionState, FlowResult, FlowStackFrame, ScopedContext,
};
use crate::domain::sub_flow::{resolve_invocation, shape_return_value};
use crate::domain::transition::TransitionResult;
use crate::error::{CoreError, CoreResult};
use crate::types::Context;

/// Construction options for [`ConversationalAgent`]
#[derive(Clone, Default)]
pub struct AgentOptions {
    /// Agent id; a random UUID when absent
    pub id: Option<String>,
    /// Initial conversation context
    pub context: Context,
    /// Limits and policies
    pub config: AgentConfig,
    /// Awaited once per committed step
    pub on_state_change: Option<Arc<dyn StateChangeHandler>>,
    /// Notified before errors are returned
    pub on_error: Option<Arc<dyn ErrorHandler>>,
    /// Evaluator for transition conditions
    pub condition_evaluator: Option<Arc<dyn ConditionEvaluator>>,
}

impl AgentOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the agent id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the initial conversation context
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Set the configuration
    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the state change handler
    pub fn with_state_change_handler(mut self, handler: Arc<dyn StateChangeHandler>) -> Self {
        self.on_state_change = Some(handler);
        self
    }

    /// Set the error hook
    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.on_error = Some(handler);
        self
    }

    /// Replace the condition evaluator
    pub fn with_condition_evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.condition_evaluator = Some(evaluator);
        self
    }
}

impl fmt::Debug for AgentOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentOptions")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("on_state_change", &self.on_state_change.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}

/// Outcome of one turn
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessResult {
    /// State after the turn, transients drained
    pub state: String,
    /// Active machine after the turn
    pub machine: String,
    /// Whether any transition was taken
    pub transitioned: bool,
    /// First transition taken during the turn
    pub transition: Option<TransitionDefinition>,
    /// Copy of the flat context
    pub context: Context,
}

/// Where a step started
struct Origin {
    machine: String,
    state: String,
    trigger: StateChangeTrigger,
    input: Option<String>,
}

/// Multi-flow conversation orchestrator.
///
/// One agent serves one session. All mutation goes through `&mut self`; use
/// [`ConversationalAgent::to_url_hash`] and
/// [`ConversationalAgent::from_url_hash`] to carry the session between requests.
pub struct ConversationalAgent {
    id: String,
    config: AgentConfig,
    flows: BTreeMap<String, FlowMachine>,
    active: Option<String>,
    context: ScopedContext,
    flow_stack: Vec<FlowStackFrame>,
    pending_result: Option<FlowResult>,
    restore_point: Option<(String, String)>,
    initialized: bool,
    evaluator: Arc<dyn ConditionEvaluator>,
    on_state_change: Option<Arc<dyn StateChangeHandler>>,
    on_error: Option<Arc<dyn ErrorHandler>>,
}

impl fmt::Debug for ConversationalAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationalAgent")
            .field("id", &self.id)
            .field("active", &self.active)
            .field("flows", &self.flows.keys().collect::<Vec<_>>())
            .field("depth", &self.flow_stack.len())
            .finish_non_exhaustive()
    }
}

impl ConversationalAgent {
    /// Create an agent with no flows
    pub fn new(options: AgentOptions) -> Self {
        Self {
            id: options.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            config: options.config,
            flows: BTreeMap::new(),
            active: None,
            context: ScopedContext::with_conversation(options.context),
            flow_stack: Vec::new(),
            pending_result: None,
            restore_point: None,
            initialized: false,
            evaluator: options
                .condition_evaluator
                .unwrap_or_else(|| Arc::new(DefaultConditionEvaluator)),
            on_state_change: options.on_state_change,
            on_error: options.on_error,
        }
    }

    /// Agent id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Active configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Active machine id
    pub fn current_machine(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Current state of the active machine
    pub fn current_state(&self) -> Option<&str> {
        self.active_machine().map(FlowMachine::current_state)
    }

    /// Flat context, i.e. the conversation tier
    pub fn context(&self) -> &Context {
        &self.context.conversation
    }

    /// Merge values into the conversation tier
    pub fn update_context(&mut self, updates: Context) {
        self.context.conversation.extend(updates);
    }

    /// All three context tiers
    pub fn scoped_context(&self) -> &ScopedContext {
        &self.context
    }

    /// Position, stack and pending result; `None` before any flow is active
    pub fn execution_state(&self) -> Option<FlowExecutionState> {
        let machine = self.active_machine()?;
        Some(FlowExecutionState {
            current_flow: machine.id().to_string(),
            current_state: machine.current_state().to_string(),
            flow_stack: self.flow_stack.clone(),
            pending_result: self.pending_result.clone(),
        })
    }

    /// Result of the most recent return, cleared when the next turn starts
    pub fn pending_result(&self) -> Option<&FlowResult> {
        self.pending_result.as_ref()
    }

    /// Number of invocations awaiting a return
    pub fn depth(&self) -> usize {
        self.flow_stack.len()
    }

    /// Registered flow ids, sorted
    pub fn flow_ids(&self) -> Vec<&str> {
        self.flows.keys().map(String::as_str).collect()
    }

    /// Whether a flow is registered
    pub fn has_flow(&self, flow_id: &str) -> bool {
        self.flows.contains_key(flow_id)
    }

    /// Machine and state recorded in the token this agent was restored from
    pub fn restore_point(&self) -> Option<(&str, &str)> {
        self.restore_point
            .as_ref()
            .map(|(machine, state)| (machine.as_str(), state.as_str()))
    }

    fn active_machine(&self) -> Option<&FlowMachine> {
        self.active.as_ref().and_then(|id| self.flows.get(id))
    }

    fn position(&self) -> CoreResult<(String, String)> {
        let machine_id = self.active.as_ref().ok_or(CoreError::NoActiveMachine)?;
        let machine = self
            .flows
            .get(machine_id)
            .ok_or_else(|| CoreError::MachineNotFound(machine_id.clone()))?;
        Ok((machine_id.clone(), machine.current_state().to_string()))
    }

    // Registration

    /// Register a single flow; the first flow ever added becomes active
    pub async fn add_flow(&mut self, flow: FlowDefinition) -> CoreResult<()> {
        let flow_id = flow.id.clone();
        if let Err(err) = self.register_flow(flow) {
            self.report_error(&err, ErrorOperation::Transition, None);
            return Err(err);
        }
        info!(agent_id = %self.id, flow_id = %flow_id, "Flow registered");

        if self.active.is_none() {
            self.active = Some(flow_id);
        }
        self.emit_init().await;
        Ok(())
    }

    /// Register a machine of either shape.
    ///
    /// A multi-flow machine registers all of its flows and activates its
    /// initial flow, unless the agent was restored from a token.
    pub async fn add_machine(&mut self, machine: MachineDefinition) -> CoreResult<()> {
        let (initial_flow, multi) = match self.register_machine(machine) {
            Ok(registered) => registered,
            Err(err) => {
                self.report_error(&err, ErrorOperation::Transition, None);
                return Err(err);
            }
        };

        if self.active.is_none() || (multi && self.restore_point.is_none()) {
            self.active = Some(initial_flow);
        }
        self.emit_init().await;
        Ok(())
    }

    /// Validate and register a machine given as raw JSON
    pub async fn add_machine_json(&mut self, json: &str) -> CoreResult<()> {
        match parse_machine_definition(json) {
            Ok(machine) => self.add_machine(machine).await,
            Err(err) => {
                let err = CoreError::from(err);
                self.report_error(&err, ErrorOperation::Transition, None);
                Err(err)
            }
        }
    }

    /// Unregister a flow that is neither active nor waiting on the stack
    pub fn remove_flow(&mut self, flow_id: &str) -> CoreResult<()> {
        if self.active.as_deref() == Some(flow_id) {
            return Err(CoreError::ActiveFlowRemoval);
        }
        if self.flow_stack.iter().any(|frame| frame.flow_id == flow_id) {
            return Err(CoreError::PendingFlowRemoval(flow_id.to_string()));
        }
        if self.flows.remove(flow_id).is_none() {
            return Err(CoreError::FlowNotFound(flow_id.to_string()));
        }
        info!(agent_id = %self.id, flow_id = %flow_id, "Flow removed");
        Ok(())
    }

    fn register_flow(&mut self, flow: FlowDefinition) -> CoreResult<()> {
        if self.flows.contains_key(&flow.id) {
            return Err(CoreError::DuplicateFlow(flow.id));
        }
        let machine = FlowMachine::with_evaluator(flow, self.evaluator.clone())?;
        self.flows.insert(machine.id().to_string(), machine);
        Ok(())
    }

    fn register_machine(&mut self, machine: MachineDefinition) -> CoreResult<(String, bool)> {
        machine.validate()?;
        self.check_targets(&machine)?;

        match machine {
            MachineDefinition::Single(flow) => {
                let flow_id = flow.id.clone();
                self.register_flow(flow)?;
                info!(agent_id = %self.id, flow_id = %flow_id, "Single-flow machine registered");
                Ok((flow_id, false))
            }
            MachineDefinition::Multi(mut multi) => {
                multi.normalize_flow_ids();
                if let Some(duplicate) = multi.flows.keys().find(|id| self.flows.contains_key(*id)) {
                    return Err(CoreError::DuplicateFlow(duplicate.clone()));
                }

                let machines = multi
                    .flows
                    .into_values()
                    .map(|flow| FlowMachine::with_evaluator(flow, self.evaluator.clone()))
                    .collect::<CoreResult<Vec<_>>>()?;
                let count = machines.len();
                for machine in machines {
                    self.flows.insert(machine.id().to_string(), machine);
                }

                info!(
                    agent_id = %self.id,
                    machine_id = %multi.id,
                    initial_flow = %multi.initial_flow,
                    flows = count,
                    "Multi-flow machine registered"
                );
                Ok((multi.initial_flow, true))
            }
        }
    }

    fn check_targets(&self, machine: &MachineDefinition) -> CoreResult<()> {
        let known: Vec<&str> = self.flows.keys().map(String::as_str).collect();
        let mut problems = Vec::new();
        for issue in analyze_targets(machine, &known) {
            match issue.severity {
                Severity::Warning => {
                    warn!(agent_id = %self.id, machine_id = %machine.id(), issue = %issue, "Structural issue");
                    problems.push(issue.to_string());
                }
                Severity::Info => debug!(agent_id = %self.id, machine_id = %machine.id(), issue = %issue, "Structural note"),
            }
        }

        if self.config.strict_targets && !problems.is_empty() {
            return Err(CoreError::DefinitionError(format!(
                "Machine '{}' has unresolved targets: {}",
                machine.id(),
                problems.join("; ")
            )));
        }
        Ok(())
    }

    // Explicit positioning

    /// Move to `state` of `machine_id` without emitting an event
    pub fn set_state(&mut self, machine_id: &str, state: &str) -> CoreResult<()> {
        let result = self.move_to(machine_id, state);
        if let Err(err) = &result {
            self.report_error(err, ErrorOperation::Transition, None);
        }
        result
    }

    /// Like [`set_state`](Self::set_state), then emit a `restore` event
    pub async fn restore_state(&mut self, machine_id: &str, state: &str) -> CoreResult<()> {
        let previous_machine = self.active.clone();
        let previous_state = self.current_state().map(str::to_string);
        self.set_state(machine_id, state)?;
        self.emit(
            StateChangeTrigger::Restore,
            None,
            previous_machine.as_deref(),
            previous_state.as_deref(),
            None,
        )
        .await;
        Ok(())
    }

    fn move_to(&mut self, machine_id: &str, state: &str) -> CoreResult<()> {
        let machine = self
            .flows
            .get_mut(machine_id)
            .ok_or_else(|| CoreError::MachineNotFound(machine_id.to_string()))?;
        machine.set_state(state)?;
        self.active = Some(machine_id.to_string());
        debug!(agent_id = %self.id, machine = %machine_id, state = %state, "State set");
        Ok(())
    }

    // Turn processing

    /// Run one turn: match `input`, act on the outcome, then drain transient states
    pub async fn process_input(&mut self, input: &str) -> CoreResult<ProcessResult> {
        match self.run_turn(input).await {
            Ok(result) => Ok(result),
            Err(err) => {
                error!(
                    agent_id = %self.id,
                    machine = ?self.active,
                    state = ?self.current_state(),
                    input = %input,
                    error = %err,
                    "Failed to process input"
                );
                self.report_error(&err, ErrorOperation::ProcessInput, Some(input));
                Err(err)
            }
        }
    }

    async fn run_turn(&mut self, input: &str) -> CoreResult<ProcessResult> {
        self.position()?;
        self.pending_result = None;

        let taken = self.step(Some(input), StateChangeTrigger::Input).await?;
        let drained = self.drain_transients().await?;

        let (machine, state) = self.position()?;
        Ok(ProcessResult {
            state,
            machine,
            transitioned: taken.is_some() || drained.is_some(),
            transition: taken.or(drained),
            context: self.context.conversation.clone(),
        })
    }

    async fn drain_transients(&mut self) -> CoreResult<Option<TransitionDefinition>> {
        let limit = self.config.max_transient_steps;
        let mut steps = 0;
        let mut first = None;

        while self.active_machine().map_or(false, FlowMachine::is_transient) {
            if limit > 0 && steps >= limit {
                return Err(CoreError::TransientLimitExceeded(limit));
            }
            match self.step(None, StateChangeTrigger::Transient).await? {
                Some(transition) => {
                    first.get_or_insert(transition);
                    steps += 1;
                }
                None => break,
            }
        }
        Ok(first)
    }

    /// One transition of the active machine; the transition when a step was committed
    async fn step(
        &mut self,
        input: Option<&str>,
        trigger: StateChangeTrigger,
    ) -> CoreResult<Option<TransitionDefinition>> {
        let (machine_id, previous_state) = self.position()?;
        let view = self.context.resolution_view();

        let outcome = match self.flows.get_mut(&machine_id) {
            Some(machine) => machine.transition(input.unwrap_or_default(), &view)?,
            None => return Err(CoreError::MachineNotFound(machine_id)),
        };
        let transition = outcome.transition().cloned();

        let origin = Origin {
            machine: machine_id,
            state: previous_state,
            trigger,
            input: input.map(str::to_string),
        };
        let committed = self.dispatch(outcome, origin).await?;
        Ok(transition.filter(|_| committed))
    }

    async fn dispatch(&mut self, outcome: TransitionResult, origin: Origin) -> CoreResult<bool> {
        let (trigger, transition) = match outcome {
            TransitionResult::None => return Ok(false),
            TransitionResult::State { transition, .. } => {
                self.apply_transition_updates(&transition);
                (origin.trigger, transition)
            }
            TransitionResult::Machine { target, transition } => {
                if !self.flows.contains_key(&target) {
                    return Err(CoreError::TargetMachineNotFound(target));
                }
                self.apply_transition_updates(&transition);
                debug!(agent_id = %self.id, from = %origin.machine, to = %target, "Switching machine");
                self.active = Some(target);
                (StateChangeTrigger::Machine, transition)
            }
            TransitionResult::FlowInvocation {
                invocation,
                transition_index,
                transition,
            } => {
                self.invoke(invocation, transition_index, &transition, &origin)?;
                (origin.trigger, transition)
            }
            TransitionResult::FlowTermination { reason, transition } => {
                if self.flow_stack.is_empty() {
                    return self.terminate_root(reason, &origin);
                }
                self.terminate(reason, &transition, &origin)?;
                (origin.trigger, transition)
            }
        };

        self.emit(
            trigger,
            origin.input.as_deref(),
            Some(&origin.machine),
            Some(&origin.state),
            Some(transition),
        )
        .await;
        Ok(true)
    }

    /// Context updates go to the conversation tier at the root and to the flow tier while nested
    fn apply_transition_updates(&mut self, transition: &TransitionDefinition) {
        if let Some(updates) = &transition.context {
            let tier = if self.flow_stack.is_empty() {
                &mut self.context.conversation
            } else {
                &mut self.context.flow
            };
            tier.extend(updates.iter().map(|(key, value)| (key.clone(), value.clone())));
        }
    }

    fn invoke(
        &mut self,
        invocation: FlowInvocation,
        transition_index: usize,
        transition: &TransitionDefinition,
        origin: &Origin,
    ) -> CoreResult<()> {
        self.flows
            .get_mut(&invocation.flow_id)
            .ok_or_else(|| CoreError::FlowNotFound(invocation.flow_id.clone()))?
            .reset();

        self.apply_transition_updates(transition);
        self.flow_stack.push(FlowStackFrame {
            flow_id: origin.machine.clone(),
            state_id: origin.state.clone(),
            transition_index,
            context_snapshot: self.context.clone(),
        });
        self.context.params = invocation.parameters;
        self.context.flow = Context::new();

        debug!(
            agent_id = %self.id,
            from = %origin.machine,
            state = %origin.state,
            flow_id = %invocation.flow_id,
            depth = self.flow_stack.len(),
            "Flow invoked"
        );
        self.active = Some(invocation.flow_id);
        Ok(())
    }

    fn terminate(&mut self, reason: TerminationReason, transition: &TransitionDefinition, origin: &Origin) -> CoreResult<()> {
        let frame = match self.flow_stack.last() {
            Some(frame) => frame.clone(),
            None => {
                return Err(CoreError::RootFlowTermination {
                    flow: origin.machine.clone(),
                    reason,
                })
            }
        };

        let handler = self.result_handler(&frame, reason)?;
        let parent = self
            .flows
            .get_mut(&frame.flow_id)
            .ok_or_else(|| CoreError::FlowNotFound(frame.flow_id.clone()))?;
        if parent.definition().state(&handler.target).is_none() {
            return Err(CoreError::StateNotFound {
                state: handler.target,
                flow: frame.flow_id,
            });
        }
        parent.set_state(&handler.target)?;

        let result = self.build_result(&origin.machine, reason, transition);
        let operations = resolve_result_references(&handler.operations, &result.value());
        self.flow_stack.pop();
        let resumed = ScopedContext {
            conversation: std::mem::take(&mut self.context.conversation),
            flow: frame.context_snapshot.flow.clone(),
            params: frame.context_snapshot.params.clone(),
        };
        self.context = apply_context_operations(&resumed, &operations);

        debug!(
            agent_id = %self.id,
            flow_id = %origin.machine,
            reason = %reason,
            resumed = %frame.flow_id,
            state = %handler.target,
            depth = self.flow_stack.len(),
            "Flow returned"
        );
        self.active = Some(frame.flow_id);
        self.pending_result = Some(result);
        Ok(())
    }

    fn terminate_root(&self, reason: TerminationReason, origin: &Origin) -> CoreResult<bool> {
        match self.config.root_termination {
            RootTerminationPolicy::Error => Err(CoreError::RootFlowTermination {
                flow: origin.machine.clone(),
                reason,
            }),
            RootTerminationPolicy::Ignore => {
                warn!(
                    agent_id = %self.id,
                    flow_id = %origin.machine,
                    reason = %reason,
                    "Ignoring termination of a flow nobody invoked"
                );
                Ok(false)
            }
        }
    }

    /// The handler for `reason` on the transition that pushed `frame`
    fn result_handler(&self, frame: &FlowStackFrame, reason: TerminationReason) -> CoreResult<ResultHandler> {
        let missing = || CoreError::MissingResultHandler {
            flow: frame.flow_id.clone(),
            state: frame.state_id.clone(),
            reason,
        };

        let parent = self
            .flows
            .get(&frame.flow_id)
            .ok_or_else(|| CoreError::FlowNotFound(frame.flow_id.clone()))?;
        let state = parent
            .definition()
            .state(&frame.state_id)
            .ok_or_else(|| CoreError::StateNotFound {
                state: frame.state_id.clone(),
                flow: frame.flow_id.clone(),
            })?;
        let transition = state.transitions.get(frame.transition_index).ok_or_else(missing)?;
        let invocation = resolve_invocation(transition, &frame.state_id)?.ok_or_else(missing)?;
        invocation.on_result.get(reason).cloned().ok_or_else(missing)
    }

    fn build_result(&self, flow_id: &str, reason: TerminationReason, transition: &TransitionDefinition) -> FlowResult {
        let mut scoped = self.context.clone();
        if let Some(updates) = &transition.context {
            scoped.flow.extend(updates.iter().map(|(key, value)| (key.clone(), value.clone())));
        }

        match reason {
            TerminationReason::End => {
                let return_type = self
                    .flows
                    .get(flow_id)
                    .and_then(|machine| machine.definition().return_type.as_ref());
                FlowResult::Success(shape_return_value(return_type, &scoped.flow, &scoped.resolution_view()))
            }
            reason => FlowResult::Failure(FlowError {
                reason,
                message: format!("Flow '{}' terminated with '{}'", flow_id, reason),
                context: Value::Object(scoped.flow),
            }),
        }
    }

    // Events

    async fn emit_init(&mut self) {
        if self.initialized || self.restore_point.is_some() {
            return;
        }
        self.initialized = true;
        self.emit(StateChangeTrigger::Init, None, None, None, None).await;
    }

    async fn emit(
        &self,
        trigger: StateChangeTrigger,
        input: Option<&str>,
        previous_machine: Option<&str>,
        previous_state: Option<&str>,
        transition: Option<TransitionDefinition>,
    ) {
        let machine = self.active.clone().unwrap_or_default();
        let state = self.current_state().unwrap_or_default().to_string();
        debug!(
            agent_id = %self.id,
            machine = %machine,
            state = %state,
            previous_state = ?previous_state,
            trigger = %trigger,
            "State changed"
        );

        let handler = match &self.on_state_change {
            Some(handler) => handler.clone(),
            None => return,
        };

        let event = StateChangeEvent {
            agent: self.id.clone(),
            previous_machine: previous_machine.filter(|previous| *previous != machine).map(str::to_string),
            previous_state: previous_state.map(str::to_string),
            machine,
            state,
            trigger,
            input: input.map(str::to_string),
            context: self.context.conversation.clone(),
            timestamp: Utc::now(),
            transition,
        };

        if let Err(err) = handler.on_state_change(event).await {
            warn!(agent_id = %self.id, trigger = %trigger, error = %err, "State change handler failed");
            self.report_error(
                &CoreError::EventHandlerError(err.to_string()),
                ErrorOperation::StateEntry,
                input,
            );
        }
    }

    fn report_error(&self, err: &CoreError, operation: ErrorOperation, input: Option<&str>) {
        if let Some(handler) = &self.on_error {
            let context = ErrorContext {
                agent: self.id.clone(),
                machine: self.active.clone(),
                state: self.current_state().map(str::to_string),
                operation,
                input: input.map(str::to_string),
                context: self.context.conversation.clone(),
            };
            handler.on_error(err, &context);
        }
    }

    // Session tokens

    /// Serializable form of the current session
    pub fn snapshot(&self) -> CoreResult<SerializedAgentState> {
        let (machine, state) = self.position()?;
        let nested = !self.flow_stack.is_empty();

        Ok(SerializedAgentState {
            agent_id: self.id.clone(),
            machine,
            state,
            context: self.context.conversation.clone(),
            version: SCHEMA_VERSION,
            flow: nested.then(|| self.context.flow.clone()),
            params: nested.then(|| self.context.params.clone()),
            execution: if nested {
                self.execution_state().map(|state| serialize_flow_execution_state(&state))
            } else {
                None
            },
        })
    }

    /// Encode the session as a URL-safe token
    pub fn to_url_hash(&self) -> CoreResult<String> {
        let result = self.snapshot().and_then(|state| encode_token(&state));
        match &result {
            Ok(token) => debug!(agent_id = %self.id, length = token.len(), "Session serialized"),
            Err(err) => {
                error!(agent_id = %self.id, error = %err, "Failed to serialize session");
                self.report_error(err, ErrorOperation::Serialize, None);
            }
        }
        result
    }

    /// Rebuild an agent from a token.
    ///
    /// The agent has no flows: register the same definitions again, then
    /// position it with [`set_state`](Self::set_state) or
    /// [`restore_state`](Self::restore_state) using [`restore_point`](Self::restore_point).
    pub fn from_url_hash(token: &str, options: AgentOptions) -> CoreResult<Self> {
        let decoded = decode_token(token).and_then(|state| {
            let execution = state
                .execution
                .clone()
                .map(deserialize_flow_execution_state)
                .transpose()
                .map_err(|e| CoreError::DeserializationError(e.to_string()))?;
            Ok((state, execution))
        });

        let (state, execution) = match decoded {
            Ok(decoded) => decoded,
            Err(err) => {
                error!(error = %err, "Failed to restore session");
                if let Some(handler) = &options.on_error {
                    let context = ErrorContext {
                        agent: options.id.clone().unwrap_or_default(),
                        machine: None,
                        state: None,
                        operation: ErrorOperation::Deserialize,
                        input: None,
                        context: options.context.clone(),
                    };
                    handler.on_error(&err, &context);
                }
                return Err(err);
            }
        };

        let mut agent = Self::new(AgentOptions {
            id: Some(state.agent_id),
            context: state.context,
            ..options
        });
        agent.context.flow = state.flow.unwrap_or_default();
        agent.context.params = state.params.unwrap_or_default();
        if let Some(execution) = execution {
            agent.flow_stack = execution.flow_stack;
            agent.pending_result = execution.pending_result;
        }

        info!(
            agent_id = %agent.id,
            machine = %state.machine,
            state = %state.state,
            depth = agent.flow_stack.len(),
            "Session restored"
        );
        agent.restore_point = Some((state.machine, state.state));
        Ok(agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use csm_definition::{ContextOperation, MultiFlowMachine, ReturnType, StateDefinition};
    use mockall::mock;
    use mockall::predicate::function;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    mock! {
        pub Handler {}

        #[async_trait]
        impl StateChangeHandler for Handler {
            async fn on_state_change(&self, event: StateChangeEvent) -> anyhow::Result<()>;
        }
    }

    fn ctx(value: Value) -> Context {
        value.as_object().cloned().unwrap()
    }

    fn greeting() -> FlowDefinition {
        FlowDefinition::new("Greeting", "Start")
            .with_state(
                "Start",
                StateDefinition::new()
                    .with_transition(
                        TransitionDefinition::to("Named")
                            .on("I am *")
                            .with_context(ctx(json!({ "greeted": true }))),
                    )
                    .with_transition(TransitionDefinition::to("machine:Help").on("help"))
                    .with_transition(TransitionDefinition::to("machine:Nowhere").on("lost")),
            )
            .with_state("Named", StateDefinition::new())
    }

    fn help() -> FlowDefinition {
        FlowDefinition::new("Help", "Topics")
            .with_state("Topics", StateDefinition::new().with_transition(TransitionDefinition::to("Shown").on("billing")))
            .with_state("Shown", StateDefinition::new())
    }

    fn shop() -> MultiFlowMachine {
        let order = FlowInvocation::new("Size")
            .with_parameters(ctx(json!({ "menu": "coffee" })))
            .on(
                TerminationReason::End,
                ResultHandler::new("Menu").with_operation(ContextOperation::Append {
                    to: "orders".to_string(),
                    value: json!("$result"),
                }),
            )
            .on(TerminationReason::Cancel, ResultHandler::new("Menu"));

        let main = FlowDefinition::new("Main", "Menu")
            .with_state(
                "Menu",
                StateDefinition::new()
                    .with_transition(TransitionDefinition::invoke(order).on("order"))
                    .with_transition(TransitionDefinition::to(":end").on("bye")),
            );

        let size = FlowDefinition::new("Size", "Ask")
            .with_state(
                "Ask",
                StateDefinition::new()
                    .with_transition(
                        TransitionDefinition::to("Confirm")
                            .on("large")
                            .with_context(ctx(json!({ "size": "large", "scratch": 1 }))),
                    )
                    .with_transition(TransitionDefinition::to(":cancel").on("stop")),
            )
            .with_state(
                "Confirm",
                StateDefinition::new().with_transition(TransitionDefinition::to(":end").on("yes")),
            )
            .with_return_type(ReturnType::new("Order", &["size", "menu"]));

        MultiFlowMachine::new("Shop", "Main").with_flow(main).with_flow(size)
    }

    async fn shop_agent(options: AgentOptions) -> ConversationalAgent {
        let mut agent = ConversationalAgent::new(options);
        agent.add_machine(shop().into()).await.unwrap();
        agent
    }

    #[tokio::test]
    async fn test_first_flow_becomes_active_and_emits_init_once() {
        let mut handler = MockHandler::new();
        handler
            .expect_on_state_change()
            .with(function(|event: &StateChangeEvent| event.trigger == StateChangeTrigger::Init))
            .times(1)
            .returning(|_| Ok(()));

        let mut agent = ConversationalAgent::new(AgentOptions::new().with_state_change_handler(Arc::new(handler)));
        agent.add_flow(greeting()).await.unwrap();
        agent.add_flow(help()).await.unwrap();

        assert_eq!(agent.current_machine(), Some("Greeting"));
        assert_eq!(agent.current_state(), Some("Start"));
        assert_eq!(agent.flow_ids(), vec!["Greeting", "Help"]);
    }

    #[tokio::test]
    async fn test_input_step_updates_conversation_tier() {
        let mut agent = ConversationalAgent::new(AgentOptions::new().with_id("agent-1"));
        agent.add_flow(greeting()).await.unwrap();

        let result = agent.process_input("I am Ada").await.unwrap();
        assert_eq!(result.state, "Named");
        assert_eq!(result.machine, "Greeting");
        assert!(result.transitioned);
        assert_eq!(result.transition.unwrap().target, "Named");
        assert_eq!(result.context, ctx(json!({ "greeted": true })));
        assert_eq!(agent.context()["greeted"], json!(true));
    }

    #[tokio::test]
    async fn test_unmatched_input_is_not_a_transition() {
        let mut handler = MockHandler::new();
        handler.expect_on_state_change().times(1).returning(|_| Ok(()));

        let mut agent = ConversationalAgent::new(AgentOptions::new().with_state_change_handler(Arc::new(handler)));
        agent.add_flow(greeting()).await.unwrap();

        let result = agent.process_input("what?").await.unwrap();
        assert!(!result.transitioned);
        assert_eq!(result.state, "Start");
        assert!(result.transition.is_none());
    }

    #[tokio::test]
    async fn test_machine_jump_keeps_target_position() {
        let mut handler = MockHandler::new();
        handler.expect_on_state_change().times(2).returning(|event| {
            if event.trigger == StateChangeTrigger::Machine {
                assert_eq!(event.previous_machine.as_deref(), Some("Greeting"));
                assert_eq!(event.machine, "Help");
                assert_eq!(event.state, "Shown");
            }
            Ok(())
        });

        let mut agent = ConversationalAgent::new(AgentOptions::new().with_state_change_handler(Arc::new(handler)));
        agent.add_flow(greeting()).await.unwrap();
        agent.add_flow(help()).await.unwrap();
        agent.set_state("Help", "Shown").unwrap();
        agent.set_state("Greeting", "Start").unwrap();

        let result = agent.process_input("help").await.unwrap();
        assert_eq!(result.machine, "Help");
        assert_eq!(result.state, "Shown");
    }

    #[tokio::test]
    async fn test_invocation_and_return() {
        let mut agent = shop_agent(AgentOptions::new()).await;
        assert_eq!(agent.current_machine(), Some("Main"));

        agent.process_input("order").await.unwrap();
        assert_eq!(agent.current_machine(), Some("Size"));
        assert_eq!(agent.current_state(), Some("Ask"));
        assert_eq!(agent.depth(), 1);
        assert_eq!(agent.scoped_context().params, ctx(json!({ "menu": "coffee" })));

        agent.process_input("large").await.unwrap();
        assert_eq!(agent.scoped_context().flow, ctx(json!({ "size": "large", "scratch": 1 })));
        assert!(agent.context().get("size").is_none());

        let result = agent.process_input("yes").await.unwrap();
        assert_eq!(result.machine, "Main");
        assert_eq!(result.state, "Menu");
        assert_eq!(agent.depth(), 0);
        assert_eq!(result.context["orders"], json!([{ "size": "large", "menu": "coffee" }]));
        assert!(agent.scoped_context().flow.is_empty());
        assert!(agent.scoped_context().params.is_empty());
        assert_eq!(
            agent.pending_result(),
            Some(&FlowResult::Success(json!({ "size": "large", "menu": "coffee" })))
        );

        agent.process_input("nothing matches").await.unwrap();
        assert!(agent.pending_result().is_none());
    }

    #[tokio::test]
    async fn test_cancel_returns_without_changes() {
        let mut agent = shop_agent(AgentOptions::new()).await;
        agent.process_input("order").await.unwrap();
        let result = agent.process_input("stop").await.unwrap();

        assert_eq!(result.machine, "Main");
        assert_eq!(result.state, "Menu");
        assert!(result.context.get("orders").is_none());
        match agent.pending_result() {
            Some(FlowResult::Failure(error)) => assert_eq!(error.reason, TerminationReason::Cancel),
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    /// Outer -> Middle -> Inner, each level returning into a different tier variable
    fn nested() -> MultiFlowMachine {
        let append = |to: &str| ContextOperation::Append {
            to: to.to_string(),
            value: json!("$result"),
        };

        let call_middle = FlowInvocation::new("Middle")
            .with_parameters(ctx(json!({ "lvl": 1 })))
            .on(TerminationReason::End, ResultHandler::new("Done").with_operation(append("outer")));
        let outer = FlowDefinition::new("Outer", "Start")
            .with_state("Start", StateDefinition::new().with_transition(TransitionDefinition::invoke(call_middle).on("go")))
            .with_state("Done", StateDefinition::new());

        let call_inner = FlowInvocation::new("Inner")
            .with_parameters(ctx(json!({ "lvl": 2 })))
            .on(TerminationReason::End, ResultHandler::new("Back").with_operation(append("inner")));
        let middle = FlowDefinition::new("Middle", "Ask")
            .with_state("Ask", StateDefinition::new().with_transition(TransitionDefinition::invoke(call_inner).on("deeper")))
            .with_state(
                "Back",
                StateDefinition::new().with_transition(
                    TransitionDefinition::to(":end")
                        .on("finish")
                        .with_context(ctx(json!({ "b": "x" }))),
                ),
            );

        let inner = FlowDefinition::new("Inner", "Pick").with_state(
            "Pick",
            StateDefinition::new()
                .with_transition(TransitionDefinition::to(":end").on("y").with_context(ctx(json!({ "c": "y" })))),
        );

        MultiFlowMachine::new("Nested", "Outer")
            .with_flow(outer)
            .with_flow(middle)
            .with_flow(inner)
    }

    #[tokio::test]
    async fn test_two_level_nesting_unwinds_in_order() {
        let mut agent = ConversationalAgent::new(AgentOptions::new());
        agent.add_machine(nested().into()).await.unwrap();

        agent.process_input("go").await.unwrap();
        assert_eq!((agent.current_machine(), agent.current_state()), (Some("Middle"), Some("Ask")));
        assert_eq!(agent.depth(), 1);
        assert_eq!(agent.scoped_context().params, ctx(json!({ "lvl": 1 })));

        agent.process_input("deeper").await.unwrap();
        assert_eq!((agent.current_machine(), agent.current_state()), (Some("Inner"), Some("Pick")));
        assert_eq!(agent.depth(), 2);
        assert_eq!(agent.scoped_context().params, ctx(json!({ "lvl": 2 })));
        agent.update_context(ctx(json!({ "note": "kept" })));

        let result = agent.process_input("y").await.unwrap();
        assert_eq!((result.machine.as_str(), result.state.as_str()), ("Middle", "Back"));
        assert_eq!(agent.depth(), 1);
        assert_eq!(agent.scoped_context().params, ctx(json!({ "lvl": 1 })));
        assert!(agent.scoped_context().flow.is_empty());
        assert_eq!(result.context, ctx(json!({ "note": "kept", "inner": [{ "c": "y" }] })));

        let result = agent.process_input("finish").await.unwrap();
        assert_eq!((result.machine.as_str(), result.state.as_str()), ("Outer", "Done"));
        assert_eq!(agent.depth(), 0);
        assert!(agent.scoped_context().params.is_empty());
        assert_eq!(
            result.context,
            ctx(json!({ "note": "kept", "inner": [{ "c": "y" }], "outer": [{ "b": "x" }] }))
        );
        assert_eq!(agent.flows["Middle"].current_state(), "Back");
    }

    #[tokio::test]
    async fn test_flows_waiting_on_the_stack_cannot_be_removed() {
        let mut agent = ConversationalAgent::new(AgentOptions::new());
        agent.add_machine(nested().into()).await.unwrap();
        agent.process_input("go").await.unwrap();
        agent.process_input("deeper").await.unwrap();

        for waiting in ["Outer", "Middle"] {
            assert_eq!(
                agent.remove_flow(waiting).unwrap_err(),
                CoreError::PendingFlowRemoval(waiting.to_string())
            );
        }
        assert_eq!(agent.remove_flow("Inner").unwrap_err(), CoreError::ActiveFlowRemoval);

        agent.process_input("y").await.unwrap();
        agent.process_input("finish").await.unwrap();
        agent.remove_flow("Middle").unwrap();
        assert_eq!(agent.flow_ids(), vec!["Inner", "Outer"]);
    }

    #[tokio::test]
    async fn test_root_termination_policies() {
        let mut agent = shop_agent(AgentOptions::new()).await;
        assert_eq!(
            agent.process_input("bye").await.unwrap_err(),
            CoreError::RootFlowTermination {
                flow: "Main".to_string(),
                reason: TerminationReason::End
            }
        );

        let config = AgentConfig::default().with_root_termination(RootTerminationPolicy::Ignore);
        let mut agent = shop_agent(AgentOptions::new().with_config(config)).await;
        let result = agent.process_input("bye").await.unwrap();
        assert!(!result.transitioned);
        assert_eq!(result.state, "Menu");
    }

    #[tokio::test]
    async fn test_transient_chain_is_drained() {
        let flow = FlowDefinition::new("Chain", "A")
            .with_state("A", StateDefinition::new().with_transition(TransitionDefinition::to("B").on("go")))
            .with_state(
                "B",
                StateDefinition::new()
                    .with_transition(TransitionDefinition::to("C").with_context(ctx(json!({ "passed": "B" })))),
            )
            .with_state("C", StateDefinition::new().with_transition(TransitionDefinition::to("D")))
            .with_state("D", StateDefinition::new());

        let mut handler = MockHandler::new();
        let mut sequence = mockall::Sequence::new();
        for trigger in [
            StateChangeTrigger::Init,
            StateChangeTrigger::Input,
            StateChangeTrigger::Transient,
            StateChangeTrigger::Transient,
        ] {
            handler
                .expect_on_state_change()
                .with(function(move |event: &StateChangeEvent| event.trigger == trigger))
                .times(1)
                .in_sequence(&mut sequence)
                .returning(|_| Ok(()));
        }

        let mut agent = ConversationalAgent::new(AgentOptions::new().with_state_change_handler(Arc::new(handler)));
        agent.add_flow(flow).await.unwrap();
        let result = agent.process_input("go").await.unwrap();

        assert_eq!(result.state, "D");
        assert_eq!(result.transition.unwrap().target, "B");
        assert_eq!(result.context["passed"], json!("B"));
    }

    #[tokio::test]
    async fn test_transient_limit() {
        let flow = FlowDefinition::new("Loop", "A")
            .with_state("A", StateDefinition::new().with_transition(TransitionDefinition::to("B").on("go")))
            .with_state("B", StateDefinition::new().with_transition(TransitionDefinition::to("B")));

        let config = AgentConfig::default().with_max_transient_steps(5);
        let mut agent = ConversationalAgent::new(AgentOptions::new().with_config(config));
        agent.add_flow(flow).await.unwrap();

        assert_eq!(
            agent.process_input("go").await.unwrap_err(),
            CoreError::TransientLimitExceeded(5)
        );
    }

    #[tokio::test]
    async fn test_default_drain_is_unbounded() {
        let mut flow = FlowDefinition::new("Long", "Start")
            .with_state("Start", StateDefinition::new().with_transition(TransitionDefinition::to("S0").on("go")))
            .with_state("End", StateDefinition::new());
        for step in 0..150 {
            let next = if step == 149 { "End".to_string() } else { format!("S{}", step + 1) };
            flow = flow.with_state(format!("S{}", step), StateDefinition::new().with_transition(TransitionDefinition::to(next)));
        }

        let mut agent = ConversationalAgent::new(AgentOptions::new());
        agent.add_flow(flow).await.unwrap();
        assert_eq!(agent.config().max_transient_steps, 0);
        assert_eq!(agent.process_input("go").await.unwrap().state, "End");
    }

    #[tokio::test]
    async fn test_no_active_machine() {
        let mut agent = ConversationalAgent::new(AgentOptions::new());
        assert_eq!(agent.process_input("hi").await.unwrap_err(), CoreError::NoActiveMachine);
        assert_eq!(agent.to_url_hash().unwrap_err(), CoreError::NoActiveMachine);
        assert!(agent.execution_state().is_none());
    }

    #[tokio::test]
    async fn test_set_state_errors() {
        let mut agent = ConversationalAgent::new(AgentOptions::new());
        agent.add_flow(greeting()).await.unwrap();

        assert_eq!(
            agent.set_state("Other", "Start").unwrap_err(),
            CoreError::MachineNotFound("Other".to_string())
        );
        assert!(matches!(
            agent.set_state("Greeting", "Missing"),
            Err(CoreError::StateNotFound { .. })
        ));
        assert_eq!(agent.current_state(), Some("Start"));
    }

    #[tokio::test]
    async fn test_nested_session_round_trip() {
        let mut agent = shop_agent(AgentOptions::new().with_id("session-7")).await;
        agent.update_context(ctx(json!({ "name": "Ada" })));
        agent.process_input("order").await.unwrap();
        agent.process_input("large").await.unwrap();
        let token = agent.to_url_hash().unwrap();

        let mut restored = ConversationalAgent::from_url_hash(&token, AgentOptions::new()).unwrap();
        assert_eq!(restored.id(), "session-7");
        assert_eq!(restored.restore_point(), Some(("Size", "Confirm")));
        restored.add_machine(shop().into()).await.unwrap();
        restored.set_state("Size", "Confirm").unwrap();

        assert_eq!(restored.scoped_context(), agent.scoped_context());
        assert_eq!(restored.execution_state(), agent.execution_state());

        let result = restored.process_input("yes").await.unwrap();
        assert_eq!(result.machine, "Main");
        assert_eq!(result.context["name"], json!("Ada"));
        assert_eq!(result.context["orders"], json!([{ "size": "large", "menu": "coffee" }]));
    }

    #[tokio::test]
    async fn test_strict_targets() {
        let broken = FlowDefinition::new("Broken", "A")
            .with_state("A", StateDefinition::new().with_transition(TransitionDefinition::to("Missing").on("x")));

        let mut lenient = ConversationalAgent::new(AgentOptions::new());
        lenient.add_machine(broken.clone().into()).await.unwrap();

        let config = AgentConfig::default().with_strict_targets(true);
        let mut strict = ConversationalAgent::new(AgentOptions::new().with_config(config));
        assert!(matches!(
            strict.add_machine(broken.into()).await,
            Err(CoreError::DefinitionError(_))
        ));
        assert!(strict.flow_ids().is_empty());
    }

    #[tokio::test]
    async fn test_add_machine_json_validates() {
        let mut agent = ConversationalAgent::new(AgentOptions::new());
        let err = agent.add_machine_json(r#"{ "id": "X", "initial": "A" }"#).await.unwrap_err();
        assert!(matches!(err, CoreError::DefinitionError(_)));

        agent
            .add_machine_json(r#"{ "id": "X", "initial": "A", "states": { "A": { "transitions": [] } } }"#)
            .await
            .unwrap();
        assert_eq!(agent.current_machine(), Some("X"));
    }
}
