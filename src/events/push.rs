//! Out-of-band events pushed by the server while a response is generated.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::core::errors::{EngineError, EngineResult};
use crate::core::ids::{ChatId, MessageId};
use crate::tree::message::{CodeExecution, StatusEntry};

/// Source payload type that carries a code execution record.
const CODE_EXECUTION_TYPE: &str = "code_execution";

/// Text shown by a confirmation or input prompt.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptPayload {
    /// Dialog title.
    pub title: String,
    /// Dialog body.
    pub message: String,
    /// Input placeholder.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    /// Pre-filled input value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// What a push event asks for.
#[derive(Clone, Debug, PartialEq)]
pub enum PushKind {
    /// Append a status entry.
    Status(StatusEntry),
    /// Append a citation.
    Source(Value),
    /// Insert or replace a code execution record.
    CodeExecution(CodeExecution),
    /// Append text to the content.
    AppendContent(String),
    /// Overwrite the content.
    ReplaceContent(String),
    /// Invoke the continue control.
    Continue,
    /// Yes/no question for the user.
    Confirmation(PromptPayload),
    /// Free-text question for the user.
    Input(PromptPayload),
}

/// A decoded push event.
#[derive(Clone, Debug, PartialEq)]
pub struct PushEvent {
    /// Target chat.
    pub chat_id: ChatId,
    /// Target message.
    pub message_id: MessageId,
    /// Requested effect.
    pub kind: PushKind,
}

#[derive(Deserialize)]
struct Envelope {
    chat_id: ChatId,
    message_id: MessageId,
    data: TaggedData,
}

#[derive(Deserialize)]
struct TaggedData {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct ContentPayload {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct ActionPayload {
    action: String,
}

fn payload<T: serde::de::DeserializeOwned>(kind: &str, data: Value) -> EngineResult<T> {
    serde_json::from_value(data).map_err(|err| EngineError::Parse(format!("{kind} event: {err}")))
}

impl PushEvent {
    /// Decode a `{chat_id, message_id, data: {type, data}}` record.
    ///
    /// Unknown event types and actions decode to `Ok(None)` and are logged.
    ///
    /// # Errors
    /// Returns `Parse` when the envelope or a known payload is malformed.
    pub fn from_value(value: Value) -> EngineResult<Option<Self>> {
        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|err| EngineError::Parse(format!("push event: {err}")))?;
        let TaggedData { kind, data } = envelope.data;

        let kind = match kind.as_str() {
            "status" => PushKind::Status(payload(&kind, data)?),
            "source" | "citation" => source_kind(data)?,
            "message" => PushKind::AppendContent(payload::<ContentPayload>(&kind, data)?.content),
            "replace" => PushKind::ReplaceContent(payload::<ContentPayload>(&kind, data)?.content),
            "action" => {
                let action: ActionPayload = payload(&kind, data)?;
                if action.action != "continue" {
                    warn!(action = %action.action, "ignoring unknown push action");
                    return Ok(None);
                }
                PushKind::Continue
            }
            "confirmation" => PushKind::Confirmation(payload(&kind, data)?),
            "input" => PushKind::Input(payload(&kind, data)?),
            other => {
                warn!(chat_id = %envelope.chat_id, kind = other, "ignoring unknown push event type");
                return Ok(None);
            }
        };

        Ok(Some(Self {
            chat_id: envelope.chat_id,
            message_id: envelope.message_id,
            kind,
        }))
    }
}

fn source_kind(payload: Value) -> EngineResult<PushKind> {
    if payload.get("type").and_then(Value::as_str) == Some(CODE_EXECUTION_TYPE) {
        let execution = serde_json::from_value(payload)
            .map_err(|err| EngineError::Parse(format!("code execution: {err}")))?;
        return Ok(PushKind::CodeExecution(execution));
    }
    Ok(PushKind::Source(payload))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn envelope(kind: &str, data: Value) -> Value {
        json!({
            "chat_id": ChatId::new(),
            "message_id": MessageId::new(),
            "data": {"type": kind, "data": data},
        })
    }

    fn kind(kind: &str, data: Value) -> Option<PushKind> {
        PushEvent::from_value(envelope(kind, data))
            .unwrap()
            .map(|event| event.kind)
    }

    #[test]
    fn status_and_sources() {
        assert!(matches!(
            kind("status", json!({"action": "web_search", "description": "Searching", "done": false})),
            Some(PushKind::Status(entry)) if entry.action.as_deref() == Some("web_search")
        ));
        assert_eq!(
            kind("citation", json!({"source": {"name": "doc"}})),
            Some(PushKind::Source(json!({"source": {"name": "doc"}})))
        );
    }

    #[test]
    fn code_execution_sources_are_typed() {
        let parsed = kind(
            "source",
            json!({"type": "code_execution", "id": "run-1", "code": "print(2)"}),
        );
        assert!(matches!(parsed, Some(PushKind::CodeExecution(exec)) if exec.id == "run-1"));
    }

    #[test]
    fn content_and_actions() {
        assert_eq!(
            kind("message", json!({"content": "more"})),
            Some(PushKind::AppendContent("more".into()))
        );
        assert_eq!(
            kind("replace", json!({"content": "all new"})),
            Some(PushKind::ReplaceContent("all new".into()))
        );
        assert_eq!(kind("action", json!({"action": "continue"})), Some(PushKind::Continue));
        assert_eq!(kind("action", json!({"action": "dance"})), None);
    }

    #[test]
    fn prompts_carry_their_text() {
        let parsed = kind(
            "input",
            json!({"title": "Name", "message": "Who?", "placeholder": "Ada"}),
        );
        match parsed {
            Some(PushKind::Input(payload)) => {
                assert_eq!(payload.title, "Name");
                assert_eq!(payload.placeholder.as_deref(), Some("Ada"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_a_no_op() {
        assert_eq!(kind("telemetry", json!({"x": 1})), None);
    }

    #[test]
    fn malformed_envelope_is_an_error() {
        let err = PushEvent::from_value(json!({"chat_id": "nope"})).unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }
}
