//! Session token codec.
//!
//! A token is the compact JSON form of [`SerializedAgentState`], encoded as
//! unpadded base64url so it can travel in a URL fragment. Definitions are
//! never part of a token.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::domain::scoped_context::SerializableFlowExecutionState;
use crate::error::{CoreError, CoreResult};
use crate::types::Context;

/// Token schema version
pub const SCHEMA_VERSION: u32 = 1;

/// Persisted agent state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedAgentState {
    /// Agent id
    #[serde(rename = "a")]
    pub agent_id: String,

    /// Active machine (flow) id
    #[serde(rename = "m")]
    pub machine: String,

    /// Active state id
    #[serde(rename = "s")]
    pub state: String,

    /// Conversation context
    #[serde(rename = "c")]
    pub context: Context,

    /// Schema version
    #[serde(rename = "v")]
    pub version: u32,

    /// Flow tier, only while nested
    #[serde(rename = "f", default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<Context>,

    /// Params tier, only while nested
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Context>,

    /// Execution stack, only while nested
    #[serde(rename = "x", default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<SerializableFlowExecutionState>,
}

/// Encode a state as a URL-safe token
pub fn encode_token(state: &SerializedAgentState) -> CoreResult<String> {
    let json = serde_json::to_vec(state)?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

/// Decode a token produced by [`encode_token`].
///
/// A leading `#` and trailing padding are tolerated.
pub fn decode_token(token: &str) -> CoreResult<SerializedAgentState> {
    let token = token.trim().trim_start_matches('#').trim_end_matches('=');
    if token.is_empty() {
        return Err(CoreError::DeserializationError("empty token".to_string()));
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|e| CoreError::DeserializationError(format!("invalid base64: {}", e)))?;
    let state: SerializedAgentState = serde_json::from_slice(&bytes)
        .map_err(|e| CoreError::DeserializationError(format!("invalid payload: {}", e)))?;

    if state.version != SCHEMA_VERSION {
        return Err(CoreError::DeserializationError(format!(
            "unsupported token version {}",
            state.version
        )));
    }
    if state.agent_id.is_empty() || state.machine.is_empty() || state.state.is_empty() {
        return Err(CoreError::DeserializationError(
            "token is missing the agent, machine or state".to_string(),
        ));
    }

    Ok(state)
}
