//! Crate-level error type.
//!
//! Every fallible operation in the library returns [`ChatError`]. The variants
//! follow the failure taxonomy of the pipelines: configuration problems are
//! caught before any network I/O, transport failures finalize the affected
//! message or panel, decode failures are skipped by the stream decoder, and
//! cancellation is a terminal state rather than a user-visible error.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChatError {
    /// Missing or invalid settings detected before a pipeline starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Network failure or non-success HTTP status from a completion endpoint.
    #[error("{}", transport_text(.status, .message))]
    Transport { status: Option<u16>, message: String },

    /// A stream event payload that could not be parsed.
    #[error("decode error: {0}")]
    Decode(String),

    /// The operation was superseded or aborted.
    #[error("operation cancelled")]
    Cancelled,

    /// The persistence port rejected a read or write.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A chat or message id that does not exist in the active partition.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
}

fn transport_text(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(code) => format!("API Error: {code} - {message}"),
        None => message.to_string(),
    }
}

impl ChatError {
    pub fn chat_not_found(id: impl Into<String>) -> Self {
        ChatError::NotFound { kind: "chat", id: id.into() }
    }

    pub fn message_not_found(id: impl Into<String>) -> Self {
        ChatError::NotFound { kind: "message", id: id.into() }
    }

    /// Cancellation is a normal terminal state and is never shown as an error.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, ChatError::Cancelled)
    }

    /// Text placed into an error-kind assistant message or comparison panel.
    pub fn display_message(&self) -> String {
        format!("⚠️ Error: {self}. Check console/settings.")
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        ChatError::Transport {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Decode(e.to_string())
    }
}

impl From<rusqlite::Error> for ChatError {
    fn from(e: rusqlite::Error) -> Self {
        ChatError::Persistence(e.to_string())
    }
}

impl From<toml::de::Error> for ChatError {
    fn from(e: toml::de::Error) -> Self {
        ChatError::Configuration(e.to_string())
    }
}
