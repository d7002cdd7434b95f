//! Presentation notices for the active chat.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::trace;

use crate::core::ids::{ChatId, MessageId};

/// Notices a presentation layer can follow.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum EngineNotice {
    /// A response started streaming.
    #[serde(rename = "chat:start")]
    ChatStart {
        /// Chat.
        chat_id: ChatId,
        /// Response message.
        message_id: MessageId,
    },
    /// A new complete sentence is available.
    #[serde(rename = "chat")]
    Sentence {
        /// Chat.
        chat_id: ChatId,
        /// Response message.
        message_id: MessageId,
        /// Sentence text.
        content: String,
    },
    /// A response reached a terminal state.
    #[serde(rename = "chat:finish")]
    ChatFinish {
        /// Chat.
        chat_id: ChatId,
        /// Response message.
        message_id: MessageId,
        /// Final content.
        content: String,
    },
    /// The server asked for the continue control to be invoked.
    #[serde(rename = "chat:continue")]
    ContinueRequested {
        /// Chat.
        chat_id: ChatId,
        /// Message to continue.
        message_id: MessageId,
    },
    /// A confirmation or input prompt is waiting for the user.
    #[serde(rename = "chat:prompt")]
    PromptRequested {
        /// Chat.
        chat_id: ChatId,
        /// Message the prompt belongs to.
        message_id: MessageId,
        /// Key to resolve the prompt with.
        prompt_id: String,
        /// `confirmation` or `input`.
        kind: String,
        /// Prompt payload (title, message, placeholder...).
        payload: Value,
    },
}

impl EngineNotice {
    /// Chat the notice belongs to.
    #[must_use]
    pub const fn chat_id(&self) -> ChatId {
        match self {
            Self::ChatStart { chat_id, .. }
            | Self::Sentence { chat_id, .. }
            | Self::ChatFinish { chat_id, .. }
            | Self::ContinueRequested { chat_id, .. }
            | Self::PromptRequested { chat_id, .. } => *chat_id,
        }
    }
}

/// Broadcasts notices, dropping those of chats that are not displayed.
#[derive(Clone, Debug)]
pub struct Notifier {
    tx: broadcast::Sender<EngineNotice>,
    active: Arc<watch::Sender<Option<ChatId>>>,
}

impl Notifier {
    /// Notifier with a bounded backlog per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        let (active, _rx) = watch::channel(None);
        Self {
            tx,
            active: Arc::new(active),
        }
    }

    /// Follow notices.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineNotice> {
        self.tx.subscribe()
    }

    /// Change the displayed chat.
    pub fn set_active(&self, chat_id: Option<ChatId>) {
        self.active.send_replace(chat_id);
    }

    /// Displayed chat.
    #[must_use]
    pub fn active(&self) -> Option<ChatId> {
        *self.active.borrow()
    }

    /// Whether `chat_id` is displayed.
    #[must_use]
    pub fn is_active(&self, chat_id: ChatId) -> bool {
        self.active() == Some(chat_id)
    }

    /// Send `notice` if its chat is displayed. Returns whether it was sent.
    pub fn emit(&self, notice: EngineNotice) -> bool {
        if !self.is_active(notice.chat_id()) {
            trace!(chat_id = %notice.chat_id(), "notice suppressed for inactive chat");
            return false;
        }
        // no subscribers is fine
        self.tx.send(notice).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inactive_chat_notices_are_dropped() {
        let notifier = Notifier::new(8);
        let mut rx = notifier.subscribe();
        let shown = ChatId::new();
        let hidden = ChatId::new();
        notifier.set_active(Some(shown));

        let message_id = MessageId::new();
        assert!(!notifier.emit(EngineNotice::ChatStart {
            chat_id: hidden,
            message_id
        }));
        assert!(notifier.emit(EngineNotice::ChatStart {
            chat_id: shown,
            message_id
        }));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.chat_id(), shown);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn notices_serialize_with_event_names() {
        let notice = EngineNotice::Sentence {
            chat_id: ChatId::new(),
            message_id: MessageId::new(),
            content: "Hi.".into(),
        };
        let value = serde_json::to_value(&notice).unwrap();
        assert_eq!(value["type"], "chat");
        assert_eq!(value["content"], "Hi.");
    }
}
