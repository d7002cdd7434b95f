//! Incremental decoding of backend completion streams.
//!
//! Both dialects share the same contract: bytes go in as they arrive from the
//! network, complete records come out as [`StreamEvent`]s, and a partial
//! trailing record stays buffered until the next chunk completes it.

pub mod event;
pub mod ndjson;
pub mod sentences;
pub mod sse;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::core::errors::{GENERIC_ERROR_TEXT, carries_error, error_text_from_payload};
use crate::tree::message::GenerationInfo;

pub use event::{ProviderEvent, StreamEvent};
pub use ndjson::NdjsonDecoder;
pub use sentences::{SentenceSplitter, SentenceTracker, SplitPolicy};
pub use sse::{SseDecoder, SseRecord};

/// Turns raw stream chunks into events.
pub trait StreamDecoder: Send {
    /// Decode one network chunk.
    ///
    /// Returns the events of every record the chunk completed, in stream order.
    /// After a terminal event the decoder ignores further input.
    fn decode(&mut self, chunk: &[u8]) -> Vec<StreamEvent>;

    /// Flush a trailing record that was not newline terminated.
    fn finish(&mut self) -> Vec<StreamEvent>;

    /// Whether a terminal event has been produced.
    fn is_terminated(&self) -> bool;
}

/// Wire format spoken by a backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// One JSON object per line (Ollama).
    Ndjson,
    /// `data:` records (OpenAI compatible).
    Sse,
}

impl Dialect {
    /// Build a fresh decoder.
    #[must_use]
    pub fn decoder(self) -> Box<dyn StreamDecoder> {
        match self {
            Self::Ndjson => Box::new(NdjsonDecoder::new()),
            Self::Sse => Box::new(SseDecoder::new()),
        }
    }
}

/// Events for a complete, non-streamed response body.
#[must_use]
pub fn complete_response(dialect: Dialect, body: &[u8]) -> Vec<StreamEvent> {
    let payload: Value = match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "unreadable non-streamed response");
            return vec![StreamEvent::Error(GENERIC_ERROR_TEXT.to_string())];
        }
    };
    if carries_error(&payload) {
        let text =
            error_text_from_payload(&payload).unwrap_or_else(|| GENERIC_ERROR_TEXT.to_string());
        return vec![StreamEvent::Error(text)];
    }

    let (content, info) = match dialect {
        Dialect::Ndjson => (
            payload.pointer("/message/content"),
            serde_json::from_value::<GenerationInfo>(payload.clone()).unwrap_or_default(),
        ),
        Dialect::Sse => (
            payload.pointer("/choices/0/message/content"),
            GenerationInfo {
                usage: payload.get("usage").filter(|usage| !usage.is_null()).cloned(),
                openai: true,
                ..GenerationInfo::default()
            },
        ),
    };
    let mut events = Vec::new();
    if let Some(content) = content.and_then(Value::as_str).filter(|c| !c.is_empty()) {
        events.push(StreamEvent::ContentDelta(content.to_string()));
    }
    events.push(StreamEvent::Done(info));
    events
}

/// Newline-delimited record buffer shared by both dialects.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append `chunk` and drain every complete line.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&line[..line.len() - 1]));
        }
        lines
    }

    /// Take whatever is left without a terminating newline.
    pub(crate) fn take_rest(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(decode_line(&rest))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Delta event for `delta`, or `None` when it is empty.
pub(crate) fn delta_event(delta: &str) -> Option<StreamEvent> {
    (!delta.is_empty()).then(|| StreamEvent::ContentDelta(delta.to_string()))
}

/// Whether `delta` may be appended to `content`: a lone newline is dropped
/// while the message is still empty.
#[must_use]
pub fn admits_delta(content: &str, delta: &str) -> bool {
    !delta.is_empty() && !(content.is_empty() && delta == "\n")
}
