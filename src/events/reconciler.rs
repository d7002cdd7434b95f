//! Applies push events to the displayed chat and tracks open prompts.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::errors::{EngineError, EngineResult};
use crate::core::ids::{ChatId, MessageId};
use crate::events::push::{PromptPayload, PushEvent, PushKind};
use crate::fanout::chat::ChatRegistry;
use crate::session::notify::{EngineNotice, Notifier};

/// Kind of a user prompt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    /// Yes/no.
    Confirmation,
    /// Free text.
    Input,
}

impl PromptKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Confirmation => "confirmation",
            Self::Input => "input",
        }
    }
}

/// The user's answer to a prompt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PromptAnswer {
    /// Confirmation accepted or declined.
    Confirmed(bool),
    /// Text entered in an input prompt.
    Input(String),
    /// Dialog dismissed.
    Dismissed,
}

/// Open prompt as listed to a presentation layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PromptView {
    /// Key to resolve with.
    pub prompt_id: String,
    /// Chat.
    pub chat_id: ChatId,
    /// Message the prompt belongs to.
    pub message_id: MessageId,
    /// Prompt kind.
    pub kind: PromptKind,
    /// Dialog text.
    pub payload: PromptPayload,
}

struct PendingPrompt {
    view: PromptView,
    reply: oneshot::Sender<PromptAnswer>,
}

/// What applying an event did.
#[derive(Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "prompt_id", rename_all = "snake_case")]
pub enum Reconciled {
    /// The message was updated.
    Applied,
    /// The event targets a chat that is not displayed.
    Ignored,
    /// The continue control was requested.
    ContinueRequested,
    /// A prompt is waiting for [`EventReconciler::resolve_prompt`].
    PromptOpened(String),
}

/// Routes push events into the message tree of the active chat.
#[derive(Clone)]
pub struct EventReconciler {
    registry: ChatRegistry,
    notifier: Notifier,
    prompts: Arc<DashMap<String, PendingPrompt>>,
}

impl std::fmt::Debug for EventReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventReconciler")
            .field("open_prompts", &self.prompts.len())
            .finish_non_exhaustive()
    }
}

impl EventReconciler {
    /// Reconciler over the loaded chats.
    #[must_use]
    pub fn new(registry: ChatRegistry, notifier: Notifier) -> Self {
        Self {
            registry,
            notifier,
            prompts: Arc::new(DashMap::new()),
        }
    }

    /// Apply `event`. Prompt events need `reply`, which receives the answer.
    ///
    /// # Errors
    /// Returns `ChatNotFound` or a tree error when the target is gone, and
    /// `InvalidRequest` for a prompt without a reply channel.
    pub fn apply(
        &self,
        event: PushEvent,
        reply: Option<oneshot::Sender<PromptAnswer>>,
    ) -> EngineResult<Reconciled> {
        if !self.notifier.is_active(event.chat_id) {
            debug!(chat_id = %event.chat_id, "push event for inactive chat ignored");
            return Ok(Reconciled::Ignored);
        }

        let chat = self.registry.require(event.chat_id)?;
        let history = chat.history();
        let message_id = event.message_id;

        match event.kind {
            PushKind::Status(entry) => {
                history.update_message(message_id, |m| m.status_history.push(entry))?;
            }
            PushKind::Source(source) => {
                history.update_message(message_id, |m| m.sources.push(source))?;
            }
            PushKind::CodeExecution(execution) => {
                history.update_message(message_id, |m| m.upsert_code_execution(execution))?;
            }
            PushKind::AppendContent(content) => {
                history.update_message(message_id, |m| m.content.push_str(&content))?;
            }
            PushKind::ReplaceContent(content) => {
                history.update_message(message_id, |m| m.content = content)?;
            }
            PushKind::Continue => {
                history.update_message(message_id, |_| ())?;
                self.notifier.emit(EngineNotice::ContinueRequested {
                    chat_id: event.chat_id,
                    message_id,
                });
                return Ok(Reconciled::ContinueRequested);
            }
            PushKind::Confirmation(payload) => {
                return self.open_prompt(event.chat_id, message_id, PromptKind::Confirmation, payload, reply);
            }
            PushKind::Input(payload) => {
                return self.open_prompt(event.chat_id, message_id, PromptKind::Input, payload, reply);
            }
        }
        Ok(Reconciled::Applied)
    }

    fn open_prompt(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        kind: PromptKind,
        mut payload: PromptPayload,
        reply: Option<oneshot::Sender<PromptAnswer>>,
    ) -> EngineResult<Reconciled> {
        let reply = reply.ok_or_else(|| {
            EngineError::InvalidRequest(format!("{} prompt needs a reply channel", kind.as_str()))
        })?;
        if kind == PromptKind::Input && payload.value.is_none() {
            payload.value = Some(String::new());
        }

        let prompt_id = Uuid::new_v4().to_string();
        let notice_payload = serde_json::to_value(&payload)?;
        let view = PromptView {
            prompt_id: prompt_id.clone(),
            chat_id,
            message_id,
            kind,
            payload,
        };
        self.prune_abandoned();
        self.prompts
            .insert(prompt_id.clone(), PendingPrompt { view, reply });

        info!(chat_id = %chat_id, prompt_id = %prompt_id, kind = kind.as_str(), "prompt opened");
        self.notifier.emit(EngineNotice::PromptRequested {
            chat_id,
            message_id,
            prompt_id: prompt_id.clone(),
            kind: kind.as_str().to_string(),
            payload: notice_payload,
        });
        Ok(Reconciled::PromptOpened(prompt_id))
    }

    /// Deliver the user's answer to a waiting prompt.
    ///
    /// # Errors
    /// Returns `InvalidRequest` if no such prompt is open.
    pub fn resolve_prompt(&self, prompt_id: &str, answer: PromptAnswer) -> EngineResult<()> {
        let (_, pending) = self
            .prompts
            .remove(prompt_id)
            .ok_or_else(|| EngineError::InvalidRequest(format!("no open prompt {prompt_id}")))?;
        if pending.reply.send(answer).is_err() {
            warn!(prompt_id, "prompt requester went away before the answer");
        }
        Ok(())
    }

    /// Open prompts of `chat_id`.
    #[must_use]
    pub fn pending_prompts(&self, chat_id: ChatId) -> Vec<PromptView> {
        self.prune_abandoned();
        self.prompts
            .iter()
            .filter(|entry| entry.view.chat_id == chat_id)
            .map(|entry| entry.view.clone())
            .collect()
    }

    /// Drop prompts whose requester stopped waiting for an answer.
    fn prune_abandoned(&self) {
        self.prompts.retain(|prompt_id, pending| {
            let open = !pending.reply.is_closed();
            if !open {
                debug!(prompt_id = %prompt_id, chat_id = %pending.view.chat_id, "dropping abandoned prompt");
            }
            open
        });
    }

    /// Decode and apply a raw push record. Unknown types are a no-op.
    ///
    /// # Errors
    /// See [`PushEvent::from_value`] and [`Self::apply`].
    pub fn apply_value(
        &self,
        value: Value,
        reply: Option<oneshot::Sender<PromptAnswer>>,
    ) -> EngineResult<Reconciled> {
        match PushEvent::from_value(value)? {
            Some(event) => self.apply(event, reply),
            None => Ok(Reconciled::Ignored),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::fanout::chat::ChatSession;

    struct Fixture {
        reconciler: EventReconciler,
        notifier: Notifier,
        chat_id: ChatId,
        response: MessageId,
        registry: ChatRegistry,
    }

    fn fixture() -> Fixture {
        let registry = ChatRegistry::new();
        let notifier = Notifier::new(16);
        let chat_id = ChatId::new();
        let chat = registry.insert(ChatSession::new(chat_id, vec!["m".into()]));
        let response = chat
            .history()
            .write(|h| {
                let user = h.append_user_message(None, "hi")?;
                h.append_response_placeholder(Some(user), "m")
            })
            .unwrap();
        notifier.set_active(Some(chat_id));
        Fixture {
            reconciler: EventReconciler::new(registry.clone(), notifier.clone()),
            notifier,
            chat_id,
            response,
            registry,
        }
    }

    fn event(f: &Fixture, kind: &str, data: Value) -> Value {
        json!({
            "chat_id": f.chat_id,
            "message_id": f.response,
            "data": {"type": kind, "data": data},
        })
    }

    fn response(f: &Fixture) -> crate::tree::message::Message {
        f.registry
            .require(f.chat_id)
            .unwrap()
            .history()
            .message(f.response)
            .unwrap()
    }

    #[test]
    fn content_events_edit_the_message() {
        let f = fixture();
        f.reconciler
            .apply_value(event(&f, "message", json!({"content": "Hel"})), None)
            .unwrap();
        f.reconciler
            .apply_value(event(&f, "message", json!({"content": "lo"})), None)
            .unwrap();
        assert_eq!(response(&f).content, "Hello");

        f.reconciler
            .apply_value(event(&f, "replace", json!({"content": "Bye"})), None)
            .unwrap();
        assert_eq!(response(&f).content, "Bye");
    }

    #[test]
    fn status_sources_and_code_executions() {
        let f = fixture();
        f.reconciler
            .apply_value(event(&f, "status", json!({"action": "web_search", "done": false})), None)
            .unwrap();
        f.reconciler
            .apply_value(event(&f, "citation", json!({"source": {"name": "a"}})), None)
            .unwrap();
        for code in ["print(1)", "print(2)"] {
            f.reconciler
                .apply_value(
                    event(&f, "source", json!({"type": "code_execution", "id": "run", "code": code})),
                    None,
                )
                .unwrap();
        }

        let message = response(&f);
        assert_eq!(message.status_history.len(), 1);
        assert_eq!(message.sources.len(), 1);
        assert_eq!(message.code_executions.len(), 1);
        assert_eq!(message.code_executions[0].fields["code"], "print(2)");
    }

    #[test]
    fn inactive_chat_is_ignored() {
        let f = fixture();
        f.notifier.set_active(None);
        let outcome = f
            .reconciler
            .apply_value(event(&f, "message", json!({"content": "x"})), None)
            .unwrap();
        assert_eq!(outcome, Reconciled::Ignored);
        assert_eq!(response(&f).content, "");
    }

    #[test]
    fn unknown_type_does_nothing() {
        let f = fixture();
        let outcome = f
            .reconciler
            .apply_value(event(&f, "mystery", json!({})), None)
            .unwrap();
        assert_eq!(outcome, Reconciled::Ignored);
    }

    #[tokio::test]
    async fn continue_action_is_signalled() {
        let f = fixture();
        let mut notices = f.notifier.subscribe();
        let outcome = f
            .reconciler
            .apply_value(event(&f, "action", json!({"action": "continue"})), None)
            .unwrap();
        assert_eq!(outcome, Reconciled::ContinueRequested);
        assert!(matches!(
            notices.recv().await.unwrap(),
            EngineNotice::ContinueRequested { message_id, .. } if message_id == f.response
        ));
    }

    #[tokio::test]
    async fn prompts_wait_for_the_answer() {
        let f = fixture();
        let (tx, rx) = oneshot::channel();
        let outcome = f
            .reconciler
            .apply_value(event(&f, "input", json!({"title": "Name", "message": "?"})), Some(tx))
            .unwrap();
        let Reconciled::PromptOpened(prompt_id) = outcome else {
            panic!("expected a prompt");
        };

        let open = f.reconciler.pending_prompts(f.chat_id);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].payload.value.as_deref(), Some(""));

        f.reconciler
            .resolve_prompt(&prompt_id, PromptAnswer::Input("Ada".into()))
            .unwrap();
        assert_eq!(rx.await.unwrap(), PromptAnswer::Input("Ada".into()));
        assert!(f.reconciler.pending_prompts(f.chat_id).is_empty());
        assert!(f
            .reconciler
            .resolve_prompt(&prompt_id, PromptAnswer::Dismissed)
            .is_err());
    }

    #[test]
    fn abandoned_prompts_are_dropped() {
        let f = fixture();
        let (tx, rx) = oneshot::channel();
        let outcome = f
            .reconciler
            .apply_value(event(&f, "confirmation", json!({"title": "Sure?"})), Some(tx))
            .unwrap();
        let Reconciled::PromptOpened(prompt_id) = outcome else {
            panic!("expected a prompt");
        };
        assert_eq!(f.reconciler.pending_prompts(f.chat_id).len(), 1);

        drop(rx);
        assert!(f.reconciler.pending_prompts(f.chat_id).is_empty());
        assert!(f
            .reconciler
            .resolve_prompt(&prompt_id, PromptAnswer::Confirmed(true))
            .is_err());
    }

    #[test]
    fn prompt_without_reply_is_rejected() {
        let f = fixture();
        let err = f
            .reconciler
            .apply_value(event(&f, "confirmation", json!({"title": "Sure?"})), None)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }

    #[test]
    fn missing_message_is_an_error() {
        let f = fixture();
        let mut value = event(&f, "message", json!({"content": "x"}));
        value["message_id"] = json!(MessageId::new());
        assert!(matches!(
            f.reconciler.apply_value(value, None),
            Err(EngineError::Tree(_))
        ));
    }
}
