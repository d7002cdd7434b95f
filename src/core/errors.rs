//! Error types for the chat engine.

use thiserror::Error;

use crate::core::ids::MessageId;

/// Structural errors raised by message tree operations.
///
/// A tree operation that returns one of these has not modified the history.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    /// The requested parent is not part of the history.
    #[error("parent message not found: {0}")]
    ParentNotFound(MessageId),
    /// The requested message is not part of the history.
    #[error("message not found: {0}")]
    MessageNotFound(MessageId),
    /// Parent/child links are inconsistent or cyclic.
    #[error("corrupt message tree: {0}")]
    CorruptTree(String),
}

/// Convenience result alias for tree operations.
pub type TreeResult<T> = Result<T, TreeError>;

/// Engine-level error type.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Connecting to or reading from a backend failed.
    #[error("network error: {0}")]
    Network(String),
    /// A backend did not answer within the configured bound.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    /// The backend answered with a structured error payload.
    #[error("backend error: {0}")]
    Backend(String),
    /// A stream record or document could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),
    /// A message tree operation failed.
    #[error(transparent)]
    Tree(#[from] TreeError),
    /// Invalid configuration or unsupported values.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// No model with this id is configured.
    #[error("unknown model: {0}")]
    UnknownModel(String),
    /// No chat with this id is loaded.
    #[error("chat not found: {0}")]
    ChatNotFound(String),
    /// Invalid request from the caller.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// URL parse error.
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
    /// Regex compilation error.
    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether the failure happened below the provider protocol (connect, read, timeout).
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            Self::Timeout("backend response")
        } else {
            Self::Network(value.to_string())
        }
    }
}

/// Convenience result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Generic text used when an error payload carries no usable message.
pub const GENERIC_ERROR_TEXT: &str = "Something went wrong while generating a response.";

/// Extract a user-facing message from a backend error payload.
///
/// Precedence: `detail`, then `error.message`, then `error` as a string,
/// then a top-level `message`. Returns `None` when none of them is present.
#[must_use]
pub fn error_text_from_payload(payload: &serde_json::Value) -> Option<String> {
    if let Some(detail) = error_field(payload, "detail") {
        return Some(value_to_text(detail));
    }
    if let Some(error) = error_field(payload, "error") {
        if let Some(message) = error.get("message").and_then(serde_json::Value::as_str) {
            return Some(message.to_string());
        }
        return Some(value_to_text(error));
    }
    payload
        .get("message")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
}

/// Whether a record reports a failure through a non-empty `detail` or `error`.
#[must_use]
pub fn carries_error(payload: &serde_json::Value) -> bool {
    error_field(payload, "detail").is_some() || error_field(payload, "error").is_some()
}

fn error_field<'a>(payload: &'a serde_json::Value, key: &str) -> Option<&'a serde_json::Value> {
    payload.get(key).filter(|value| match value {
        serde_json::Value::Null | serde_json::Value::Bool(false) => false,
        serde_json::Value::String(text) => !text.is_empty(),
        _ => true,
    })
}

fn value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
