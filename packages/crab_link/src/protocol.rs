//! Wire Protocol Types
//!
//! Inbound frames are JSON objects tagged by `type`. Each variant carries the
//! session it belongs to; sync snapshots may be session-agnostic. Payload
//! fields are passed through untouched: this crate routes messages, it does
//! not interpret chat or diff content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Messages sent FROM the server TO the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    ChatOutput(ChatOutput),
    SessionState(SessionStateChange),
    PromptRequest(PromptRequest),
    Error(ServerError),
    Sync(SyncSnapshot),
}

/// Routing tag of an [`InboundMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ChatOutput,
    SessionState,
    PromptRequest,
    Error,
    Sync,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatOutput => "chat_output",
            Self::SessionState => "session_state",
            Self::PromptRequest => "prompt_request",
            Self::Error => "error",
            Self::Sync => "sync",
        }
    }
}

impl InboundMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::ChatOutput(_) => MessageKind::ChatOutput,
            Self::SessionState(_) => MessageKind::SessionState,
            Self::PromptRequest(_) => MessageKind::PromptRequest,
            Self::Error(_) => MessageKind::Error,
            Self::Sync(_) => MessageKind::Sync,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::ChatOutput(m) => m.session_id(),
            Self::SessionState(m) => m.session_id(),
            Self::PromptRequest(m) => m.session_id(),
            Self::Error(m) => m.session_id(),
            Self::Sync(m) => m.session_id(),
        }
    }
}

/// Anything that can be filtered by session identifier.
pub trait SessionScoped {
    fn session_id(&self) -> Option<&str>;

    fn matches_session(&self, session_id: &str) -> bool {
        self.session_id() == Some(session_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    #[default]
    Text,
    ToolUse,
    ToolResult,
    Terminal,
}

/// A chunk of assistant or tool output for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatOutput {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub kind: OutputKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStateChange {
    pub session_id: String,
    /// Server-defined state name (e.g. "idle", "thinking", "waiting_for_input").
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// The session is blocked until the user answers this prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRequest {
    pub session_id: String,
    pub prompt_id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    pub session_id: String,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Full-state snapshot. Without a `session_id` it applies to every session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl SessionScoped for ChatOutput {
    fn session_id(&self) -> Option<&str> {
        Some(&self.session_id)
    }
}

impl SessionScoped for SessionStateChange {
    fn session_id(&self) -> Option<&str> {
        Some(&self.session_id)
    }
}

impl SessionScoped for PromptRequest {
    fn session_id(&self) -> Option<&str> {
        Some(&self.session_id)
    }
}

impl SessionScoped for ServerError {
    fn session_id(&self) -> Option<&str> {
        Some(&self.session_id)
    }
}

impl SessionScoped for SyncSnapshot {
    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn matches_session(&self, session_id: &str) -> bool {
        match &self.session_id {
            Some(id) => id == session_id,
            None => true,
        }
    }
}

/// Messages sent FROM the client TO the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Text typed into a session.
    Input { session_id: String, text: String },
    /// Answer to a [`PromptRequest`].
    PromptResponse {
        session_id: String,
        prompt_id: String,
        response: String,
    },
    /// Ask the server for a [`SyncSnapshot`], for one session or all of them.
    RequestSync {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Interrupt { session_id: String },
}

/// Decode one text or binary frame.
pub fn decode_frame(bytes: &[u8]) -> Result<InboundMessage, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Encode an outbound value as a single text frame body. `chrono` dates are
/// written as ISO-8601 strings.
pub fn encode_frame<M: Serialize + ?Sized>(message: &M) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}
