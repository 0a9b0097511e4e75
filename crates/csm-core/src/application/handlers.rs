use async_trait::async_trait;

use crate::domain::events::{ErrorContext, StateChangeEvent};
use crate::error::CoreError;

/// Receives one event per committed step, awaited in commit order
#[async_trait]
pub trait StateChangeHandler: Send + Sync {
    /// Handle a state change.
    ///
    /// Failures are logged and reported to the error hook; they never roll
    /// back the step.
    async fn on_state_change(&self, event: StateChangeEvent) -> anyhow::Result<()>;
}

/// Handler that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStateChangeHandler;

#[async_trait]
impl StateChangeHandler for NoopStateChangeHandler {
    async fn on_state_change(&self, _event: StateChangeEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Observes errors before they are returned to the caller
pub trait ErrorHandler: Send + Sync {
    /// Called with the error and where it happened
    fn on_error(&self, error: &CoreError, context: &ErrorContext);
}

impl<F> ErrorHandler for F
where
    F: Fn(&CoreError, &ErrorContext) + Send + Sync,
{
    fn on_error(&self, error: &CoreError, context: &ErrorContext) {
        self(error, context)
    }
}
