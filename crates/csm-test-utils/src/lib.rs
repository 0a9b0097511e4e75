//! Testing utilities for the CSM conversation runtime.
//!
//! Recording and failing hooks, fixture machine definitions and assertion
//! helpers shared by the integration test suites.

pub mod assertions;
pub mod fixtures;
pub mod recording;

pub use assertions::*;
pub use fixtures::*;
pub use recording::{FailingEventHandler, RecordingErrorHandler, RecordingEventHandler};

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize test tracing.
///
/// Honors `RUST_LOG`, defaulting to debug output for the runtime crates.
/// Safe to call from every test.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("csm_core=debug,csm_definition=debug"));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_test_writer()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
