//! Server-sent-events dialect (OpenAI compatible `/chat/completions`).

use serde_json::Value;
use tracing::{debug, warn};

use crate::core::errors::{GENERIC_ERROR_TEXT, carries_error, error_text_from_payload};
use crate::stream::event::{ProviderEvent, StreamEvent, sources_list};
use crate::stream::{LineBuffer, StreamDecoder, delta_event};
use crate::tree::message::GenerationInfo;

const DONE_MARKER: &str = "[DONE]";

/// One update record extracted from a `data:` line.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SseRecord {
    /// Content delta.
    pub value: String,
    /// End of stream.
    pub done: bool,
    /// Citations.
    pub sources: Option<Vec<Value>>,
    /// Arena selection.
    pub selected_model_id: Option<String>,
    /// Token usage.
    pub usage: Option<Value>,
    /// Backend error text.
    pub error: Option<String>,
}

impl SseRecord {
    /// Parse the payload of one `data:` line.
    ///
    /// # Errors
    /// Returns the JSON error when the payload is neither JSON nor the done marker.
    pub fn parse(data: &str) -> Result<Self, serde_json::Error> {
        let data = data.trim();
        if data == DONE_MARKER {
            return Ok(Self {
                done: true,
                ..Self::default()
            });
        }
        let payload: Value = serde_json::from_str(data)?;
        let error = carries_error(&payload)
            .then(|| error_text_from_payload(&payload).unwrap_or_else(|| GENERIC_ERROR_TEXT.into()));
        let value = payload
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(Self {
            value,
            done: false,
            sources: payload.get("sources").map(sources_list),
            selected_model_id: payload
                .get("selected_model_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            usage: payload.get("usage").filter(|usage| !usage.is_null()).cloned(),
            error,
        })
    }
}

/// Decoder for `data:` framed records.
#[derive(Debug, Default)]
pub struct SseDecoder {
    lines: LineBuffer,
    usage: Option<Value>,
    terminated: bool,
}

impl SseDecoder {
    /// Decoder for an empty response.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events for a record delivered already split by an upstream adapter.
    pub fn record_events(&mut self, record: SseRecord) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.terminated {
            return out;
        }
        if let Some(error) = record.error {
            self.terminated = true;
            out.push(StreamEvent::Error(error));
            return out;
        }
        if let Some(sources) = record.sources {
            out.push(StreamEvent::Sources(sources));
        }
        if let Some(model) = record.selected_model_id {
            out.push(StreamEvent::ProviderSpecific(ProviderEvent::SelectedModel(model)));
        }
        if let Some(usage) = record.usage {
            self.usage = Some(usage.clone());
            out.push(StreamEvent::ProviderSpecific(ProviderEvent::Usage(usage)));
        }
        out.extend(delta_event(&record.value));
        if record.done {
            self.terminated = true;
            out.push(StreamEvent::Done(GenerationInfo {
                usage: self.usage.take(),
                openai: true,
                ..GenerationInfo::default()
            }));
        }
        out
    }

    fn line_events(&mut self, line: &str, out: &mut Vec<StreamEvent>) {
        let Some(data) = line.strip_prefix("data:") else {
            if !line.trim().is_empty() && !line.starts_with(':') {
                debug!(line, "ignoring non-data stream line");
            }
            return;
        };
        match SseRecord::parse(data) {
            Ok(record) => out.extend(self.record_events(record)),
            Err(err) => warn!(error = %err, "skipping malformed stream record"),
        }
    }
}

impl StreamDecoder for SseDecoder {
    fn decode(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for line in self.lines.push(chunk) {
            if self.terminated {
                break;
            }
            self.line_events(&line, &mut events);
        }
        events
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if let Some(rest) = self.lines.take_rest() {
            if !self.terminated {
                self.line_events(&rest, &mut events);
            }
        }
        events
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn data_line(payload: &Value) -> String {
        format!("data: {payload}\n\n")
    }

    fn delta(text: &str) -> String {
        data_line(&json!({"choices": [{"delta": {"content": text}}]}))
    }

    #[test]
    fn deltas_then_done_marker() {
        let mut decoder = SseDecoder::new();
        let mut events = decoder.decode(delta("Hel").as_bytes());
        events.extend(decoder.decode(delta("lo").as_bytes()));
        events.extend(decoder.decode(b"data: [DONE]\n\n"));

        assert_eq!(events[0], StreamEvent::ContentDelta("Hel".into()));
        assert_eq!(events[1], StreamEvent::ContentDelta("lo".into()));
        match &events[2] {
            StreamEvent::Done(info) => assert!(info.openai),
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[test]
    fn usage_is_reported_and_carried_into_done() {
        let mut decoder = SseDecoder::new();
        let usage = json!({"prompt_tokens": 3, "completion_tokens": 7});
        let mut events = decoder.decode(data_line(&json!({"choices": [], "usage": usage})).as_bytes());
        events.extend(decoder.decode(b"data: [DONE]\n"));

        assert_eq!(
            events[0],
            StreamEvent::ProviderSpecific(ProviderEvent::Usage(usage.clone()))
        );
        match &events[1] {
            StreamEvent::Done(info) => assert_eq!(info.usage.as_ref(), Some(&usage)),
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[test]
    fn arena_selection_and_sources() {
        let mut decoder = SseDecoder::new();
        let events = decoder.decode(
            data_line(&json!({"selected_model_id": "llama3", "sources": [{"id": 1}]})).as_bytes(),
        );
        assert_eq!(
            events,
            vec![
                StreamEvent::Sources(vec![json!({"id": 1})]),
                StreamEvent::ProviderSpecific(ProviderEvent::SelectedModel("llama3".into())),
            ]
        );
    }

    #[test]
    fn error_record_terminates() {
        let mut decoder = SseDecoder::new();
        let mut chunk = data_line(&json!({"error": {"message": "quota exceeded"}}));
        chunk.push_str(&delta("late"));
        let events = decoder.decode(chunk.as_bytes());
        assert_eq!(events, vec![StreamEvent::Error("quota exceeded".into())]);
        assert!(decoder.is_terminated());
    }

    #[test]
    fn null_error_field_keeps_streaming() {
        let mut decoder = SseDecoder::new();
        let events = decoder.decode(
            data_line(&json!({"choices": [{"delta": {"content": "Hi"}}], "error": null})).as_bytes(),
        );
        assert_eq!(events, vec![StreamEvent::ContentDelta("Hi".into())]);
        assert!(!decoder.is_terminated());
    }

    #[test]
    fn malformed_record_and_comments_are_skipped() {
        let mut decoder = SseDecoder::new();
        let mut chunk = String::from(": keep-alive\ndata: {broken\n");
        chunk.push_str(&delta("ok"));
        let events = decoder.decode(chunk.as_bytes());
        assert_eq!(events, vec![StreamEvent::ContentDelta("ok".into())]);
    }

    #[test]
    fn record_split_across_chunks() {
        let line = delta("split");
        let (head, tail) = line.as_bytes().split_at(12);
        let mut decoder = SseDecoder::new();
        assert!(decoder.decode(head).is_empty());
        assert_eq!(
            decoder.decode(tail),
            vec![StreamEvent::ContentDelta("split".into())]
        );
    }

    #[test]
    fn pre_split_records_skip_framing() {
        let mut decoder = SseDecoder::new();
        let events = decoder.record_events(SseRecord::default());
        assert!(events.is_empty());
        let events = decoder.record_events(SseRecord {
            value: "Hi".into(),
            done: true,
            ..SseRecord::default()
        });
        assert_eq!(events.len(), 2);
        assert!(events[1].is_terminal());
    }
}
