//! Assertion utilities for validating agent state.
//!
//! Helpers return `Result` so tests can `?` or `unwrap` them and get a
//! readable message either way.

mod agent_state;

pub use agent_state::*;
