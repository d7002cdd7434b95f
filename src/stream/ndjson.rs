//! Line-delimited JSON dialect (Ollama `/api/chat`).

use serde_json::Value;
use tracing::{debug, warn};

use crate::core::errors::{GENERIC_ERROR_TEXT, carries_error, error_text_from_payload};
use crate::stream::event::{StreamEvent, sources_list};
use crate::stream::{LineBuffer, StreamDecoder, delta_event};
use crate::tree::message::GenerationInfo;

/// Decoder for one JSON object per line.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    lines: LineBuffer,
    terminated: bool,
}

impl NdjsonDecoder {
    /// Decoder for an empty response.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn line_events(&mut self, line: &str, out: &mut Vec<StreamEvent>) {
        if self.terminated {
            return;
        }
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let record: Value = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(err) => {
                warn!(error = %err, "skipping malformed stream line");
                return;
            }
        };

        if let Some(sources) = record.get("sources") {
            out.push(StreamEvent::Sources(sources_list(sources)));
            return;
        }

        if carries_error(&record) {
            let text = error_text_from_payload(&record)
                .unwrap_or_else(|| GENERIC_ERROR_TEXT.to_string());
            self.terminated = true;
            out.push(StreamEvent::Error(text));
            return;
        }

        if record.get("done").and_then(Value::as_bool) == Some(true) {
            let info = serde_json::from_value::<GenerationInfo>(record).unwrap_or_else(|err| {
                debug!(error = %err, "final stream record carried unexpected metadata");
                GenerationInfo::default()
            });
            self.terminated = true;
            out.push(StreamEvent::Done(info));
            return;
        }

        match record
            .get("message")
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
        {
            Some(delta) => out.extend(delta_event(delta)),
            None => debug!("stream line without content"),
        }
    }
}

impl StreamDecoder for NdjsonDecoder {
    fn decode(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for line in self.lines.push(chunk) {
            self.line_events(&line, &mut events);
        }
        events
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if let Some(rest) = self.lines.take_rest() {
            self.line_events(&rest, &mut events);
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

    fn content(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::ContentDelta(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn deltas_then_done_with_metadata() {
        let mut decoder = NdjsonDecoder::new();
        let mut events = decoder.decode(b"{\"message\":{\"content\":\"Hel\"},\"done\":false}\n");
        events.extend(decoder.decode(b"{\"message\":{\"content\":\"lo\"},\"done\":false}\n"));
        events.extend(decoder.decode(b"{\"done\":true,\"eval_count\":5}\n"));

        assert_eq!(events[0], StreamEvent::ContentDelta("Hel".into()));
        assert_eq!(events[1], StreamEvent::ContentDelta("lo".into()));
        match &events[2] {
            StreamEvent::Done(info) => assert_eq!(info.eval_count, Some(5)),
            other => panic!("expected done, got {other:?}"),
        }
        assert_eq!(content(&events), "Hello");
        assert!(decoder.is_terminated());
    }

    #[test]
    fn newline_and_empty_deltas() {
        let mut decoder = NdjsonDecoder::new();
        let events = decoder.decode(
            b"{\"message\":{\"content\":\"\"},\"done\":false}\n{\"message\":{\"content\":\"\\n\"},\"done\":false}\n",
        );
        assert_eq!(events, vec![StreamEvent::ContentDelta("\n".into())]);
    }

    #[test]
    fn record_split_across_chunks() {
        let mut decoder = NdjsonDecoder::new();
        assert!(decoder.decode(b"{\"message\":{\"cont").is_empty());
        let events = decoder.decode(b"ent\":\"Hi\"},\"done\":false}\n{\"mess");
        assert_eq!(events, vec![StreamEvent::ContentDelta("Hi".into())]);
        let events = decoder.decode(b"age\":{\"content\":\"!\"},\"done\":false}\n");
        assert_eq!(events, vec![StreamEvent::ContentDelta("!".into())]);
    }

    #[test]
    fn malformed_line_is_skipped() {
        let mut decoder = NdjsonDecoder::new();
        let events = decoder.decode(
            b"not json\n{\"message\":{\"content\":\"ok\"},\"done\":false}\n",
        );
        assert_eq!(events, vec![StreamEvent::ContentDelta("ok".into())]);
        assert!(!decoder.is_terminated());
    }

    #[test]
    fn sources_are_side_channel() {
        let mut decoder = NdjsonDecoder::new();
        let line = format!("{}\n", json!({"sources": [{"name": "doc"}]}));
        let events = decoder.decode(line.as_bytes());
        assert_eq!(events, vec![StreamEvent::Sources(vec![json!({"name": "doc"})])]);
    }

    #[test]
    fn detail_terminates_stream() {
        let mut decoder = NdjsonDecoder::new();
        let events = decoder.decode(
            b"{\"detail\":\"model not found\"}\n{\"message\":{\"content\":\"late\"},\"done\":false}\n",
        );
        assert_eq!(events, vec![StreamEvent::Error("model not found".into())]);
        assert!(decoder.is_terminated());
        assert!(decoder.decode(b"{\"done\":true}\n").is_empty());
    }

    #[test]
    fn null_error_field_is_not_a_failure() {
        let mut decoder = NdjsonDecoder::new();
        let events =
            decoder.decode(b"{\"message\":{\"content\":\"Hi\"},\"error\":null,\"done\":false}\n");
        assert_eq!(events, vec![StreamEvent::ContentDelta("Hi".into())]);
        assert!(!decoder.is_terminated());
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut decoder = NdjsonDecoder::new();
        assert!(decoder.decode(b"{\"done\":true,\"eval_count\":2}").is_empty());
        let events = decoder.finish();
        assert!(matches!(events.as_slice(), [StreamEvent::Done(_)]));
    }
}
