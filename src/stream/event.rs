//! Decoded stream events.

use serde_json::Value;

use crate::tree::message::GenerationInfo;

/// One event decoded from a backend stream, consumed once by a session.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Text to append verbatim to the response content.
    ContentDelta(String),
    /// Citations sent on the side channel.
    Sources(Vec<Value>),
    /// End of generation with the final metadata.
    Done(GenerationInfo),
    /// Backend-reported error; always the last event of a stream.
    Error(String),
    /// Dialect-specific extras that do not touch the content.
    ProviderSpecific(ProviderEvent),
}

/// Extras only some dialects send.
#[derive(Clone, Debug, PartialEq)]
pub enum ProviderEvent {
    /// Arena mode: the underlying model that answered.
    SelectedModel(String),
    /// Token usage block.
    Usage(Value),
}

impl StreamEvent {
    /// Whether no further event follows this one.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Error(_))
    }
}

/// Normalise a `sources` payload into a list.
pub(crate) fn sources_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}
