//! The WebSocket control protocol.
//!
//! All frames are JSON text messages with a `type` discriminant. Frames
//! that fail to parse, or whose `type` is unknown, are not protocol
//! traffic: the instance hands them to the user's `on_message` handler.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames a peer sends to an agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum IncomingFrame {
    /// Replace the agent state and broadcast it to the other peers.
    #[serde(rename = "cf_agent_state")]
    State { state: Value },

    /// Invoke a callable method.
    #[serde(rename = "rpc")]
    Rpc {
        id: String,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Deliver an HTTP-shaped request to the chat handler.
    #[serde(rename = "cf_agent_use_chat_request")]
    ChatRequest { id: String, init: Value },

    /// Abort the in-flight chat request with the given id.
    #[serde(rename = "cf_agent_chat_request_cancel")]
    ChatCancel { id: String },

    /// Full sync of the chat message array.
    #[serde(rename = "cf_agent_chat_messages")]
    ChatMessages { messages: Vec<Value> },

    /// Clear the chat message history.
    #[serde(rename = "cf_agent_chat_clear")]
    ChatClear,
}

/// Frames an agent sends to a peer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutgoingFrame {
    /// Notification of new agent state.
    #[serde(rename = "cf_agent_state")]
    State { state: Value },

    /// RPC result, streaming chunk, or failure, correlated by `id`.
    #[serde(rename = "rpc")]
    Rpc {
        id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        done: Option<bool>,
    },

    /// Chunked chat response body.
    #[serde(rename = "cf_agent_use_chat_response")]
    ChatResponse { id: String, body: String, done: bool },

    /// Full sync of the chat message array.
    #[serde(rename = "cf_agent_chat_messages")]
    ChatMessages { messages: Vec<Value> },

    /// The history was cleared.
    #[serde(rename = "cf_agent_chat_clear")]
    ChatClear,
}

impl OutgoingFrame {
    /// A one-shot RPC success (`done` omitted).
    pub fn rpc_result(id: impl Into<String>, result: Value) -> Self {
        OutgoingFrame::Rpc {
            id: id.into(),
            success: true,
            result: Some(result),
            error: None,
            done: None,
        }
    }

    /// A streaming chunk (`done: false`) or final value (`done: true`).
    pub fn rpc_chunk(id: impl Into<String>, chunk: Value, done: bool) -> Self {
        OutgoingFrame::Rpc {
            id: id.into(),
            success: true,
            result: Some(chunk),
            error: None,
            done: Some(done),
        }
    }

    /// An RPC failure.
    pub fn rpc_error(id: impl Into<String>, error: impl Into<String>) -> Self {
        OutgoingFrame::Rpc {
            id: id.into(),
            success: false,
            result: None,
            error: Some(error.into()),
            done: None,
        }
    }

    /// Serialize for the wire.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Parse an inbound text message as a protocol frame.
///
/// Returns `None` for invalid JSON and unknown `type` values.
pub fn parse_frame(text: &str) -> Option<IncomingFrame> {
    serde_json::from_str(text).ok()
}
