//! Hooks that record what the agent reports.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use csm_core::{CoreError, ErrorContext, ErrorHandler, ErrorOperation, StateChangeEvent, StateChangeHandler, StateChangeTrigger};
use parking_lot::Mutex;

/// Keeps every state change event in commit order
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<StateChangeEvent>>,
}

impl RecordingEventHandler {
    /// Shared, empty recorder
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Recorded events
    pub fn events(&self) -> Vec<StateChangeEvent> {
        self.events.lock().clone()
    }

    /// Triggers of the recorded events
    pub fn triggers(&self) -> Vec<StateChangeTrigger> {
        self.events.lock().iter().map(|event| event.trigger).collect()
    }

    /// `(machine, state)` after each recorded event
    pub fn positions(&self) -> Vec<(String, String)> {
        self.events
            .lock()
            .iter()
            .map(|event| (event.machine.clone(), event.state.clone()))
            .collect()
    }

    /// Number of recorded events
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// No events recorded
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Forget recorded events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl StateChangeHandler for RecordingEventHandler {
    async fn on_state_change(&self, event: StateChangeEvent) -> anyhow::Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Fails every event with a fixed message
#[derive(Debug)]
pub struct FailingEventHandler {
    message: String,
    calls: AtomicUsize,
}

impl FailingEventHandler {
    /// Shared handler failing with `message`
    pub fn new(message: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            message: message.into(),
            calls: AtomicUsize::new(0),
        })
    }

    /// How many events were delivered
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateChangeHandler for FailingEventHandler {
    async fn on_state_change(&self, _event: StateChangeEvent) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(anyhow::anyhow!("{}", self.message))
    }
}

/// Keeps every reported error with its context
#[derive(Debug, Default)]
pub struct RecordingErrorHandler {
    errors: Mutex<Vec<(CoreError, ErrorContext)>>,
}

impl RecordingErrorHandler {
    /// Shared, empty recorder
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Recorded errors
    pub fn errors(&self) -> Vec<(CoreError, ErrorContext)> {
        self.errors.lock().clone()
    }

    /// Operations of the recorded errors
    pub fn operations(&self) -> Vec<ErrorOperation> {
        self.errors.lock().iter().map(|(_, context)| context.operation).collect()
    }

    /// Number of recorded errors
    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    /// No errors recorded
    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }
}

impl ErrorHandler for RecordingErrorHandler {
    fn on_error(&self, error: &CoreError, context: &ErrorContext) {
        self.errors.lock().push((error.clone(), context.clone()));
    }
}
