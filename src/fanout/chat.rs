//! Chat aggregate and registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::backend::request::ChatParams;
use crate::core::errors::{EngineError, EngineResult, TreeResult};
use crate::core::ids::ChatId;
use crate::session::cancel::CancellationFlag;
use crate::session::shared::SharedHistory;
use crate::tree::history::History;
use crate::tree::persisted::PersistedChat;

/// Title given to chats before one is generated.
pub const DEFAULT_TITLE: &str = "New Chat";

/// Chat settings persisted next to the history.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatMeta {
    /// Title.
    pub title: String,
    /// Selected model ids, in display order.
    pub models: Vec<String>,
    /// Generation parameters.
    pub params: ChatParams,
    /// Chat-level files.
    pub files: Vec<Value>,
    /// Tags.
    pub tags: Vec<String>,
}

impl ChatMeta {
    fn new(models: Vec<String>) -> Self {
        Self {
            title: DEFAULT_TITLE.to_string(),
            models,
            params: ChatParams::default(),
            files: Vec::new(),
            tags: Vec::new(),
        }
    }
}

/// Everything one chat's operations need, passed explicitly.
#[derive(Debug)]
pub struct ChatSession {
    id: ChatId,
    history: SharedHistory,
    runs: Mutex<HashMap<u64, CancellationFlag>>,
    next_run: AtomicU64,
    meta: Mutex<ChatMeta>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl ChatSession {
    /// Empty chat with the given model selection.
    #[must_use]
    pub fn new(id: ChatId, models: Vec<String>) -> Self {
        Self::with_parts(id, History::new(), ChatMeta::new(models))
    }

    /// Restore a stored chat.
    ///
    /// # Errors
    /// Returns an error if the stored tree is inconsistent.
    pub fn from_persisted(id: ChatId, stored: PersistedChat) -> TreeResult<Self> {
        let history = stored.to_history()?;
        let meta = ChatMeta {
            title: stored.title,
            models: stored.models,
            params: stored.params,
            files: stored.files,
            tags: stored.tags,
        };
        Ok(Self::with_parts(id, history, meta))
    }

    fn with_parts(id: ChatId, history: History, meta: ChatMeta) -> Self {
        Self {
            id,
            history: SharedHistory::new(history),
            runs: Mutex::new(HashMap::new()),
            next_run: AtomicU64::new(0),
            meta: Mutex::new(meta),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Chat id.
    #[must_use]
    pub const fn id(&self) -> ChatId {
        self.id
    }

    /// Shared history handle.
    #[must_use]
    pub const fn history(&self) -> &SharedHistory {
        &self.history
    }

    fn lock_runs(&self) -> MutexGuard<'_, HashMap<u64, CancellationFlag>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a run with its own stop flag.
    pub(crate) fn begin_run(&self) -> (u64, CancellationFlag) {
        let run = self.next_run.fetch_add(1, Ordering::Relaxed);
        let flag = CancellationFlag::new();
        self.lock_runs().insert(run, flag.clone());
        (run, flag)
    }

    /// Forget a run that reached its terminal state.
    pub(crate) fn end_run(&self, run: u64) {
        self.lock_runs().remove(&run);
    }

    /// Raise the stop flag of every run in flight. Returns how many were stopped.
    pub fn stop_runs(&self) -> usize {
        let runs = self.lock_runs();
        for flag in runs.values() {
            flag.raise();
        }
        runs.len()
    }

    /// Number of runs still in flight.
    #[must_use]
    pub fn runs_in_flight(&self) -> usize {
        self.lock_runs().len()
    }

    fn lock_meta(&self) -> MutexGuard<'_, ChatMeta> {
        self.meta.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the settings.
    #[must_use]
    pub fn meta(&self) -> ChatMeta {
        self.lock_meta().clone()
    }

    /// Edit the settings.
    pub fn update_meta<R>(&self, f: impl FnOnce(&mut ChatMeta) -> R) -> R {
        f(&mut self.lock_meta())
    }

    /// Serialises writes of this chat's document.
    pub(crate) async fn persist_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.persist_lock.lock().await
    }

    /// Persisted form of the current state.
    ///
    /// # Errors
    /// Returns an error if the current branch cannot be walked.
    pub fn snapshot(&self) -> TreeResult<PersistedChat> {
        let meta = self.meta();
        self.history.read(|history| {
            PersistedChat::snapshot(
                &meta.title,
                &meta.models,
                history,
                &meta.params,
                &meta.files,
                &meta.tags,
            )
        })
    }
}

/// Loaded chats by id.
#[derive(Clone, Debug, Default)]
pub struct ChatRegistry {
    chats: Arc<DashMap<ChatId, Arc<ChatSession>>>,
}

impl ChatRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `chat`, replacing any chat with the same id.
    pub fn insert(&self, chat: ChatSession) -> Arc<ChatSession> {
        let chat = Arc::new(chat);
        debug!(chat_id = %chat.id(), "chat registered");
        self.chats.insert(chat.id(), Arc::clone(&chat));
        chat
    }

    /// Loaded chat, if any.
    #[must_use]
    pub fn get(&self, chat_id: ChatId) -> Option<Arc<ChatSession>> {
        self.chats.get(&chat_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Loaded chat or `ChatNotFound`.
    ///
    /// # Errors
    /// Returns `ChatNotFound` if the chat is not loaded.
    pub fn require(&self, chat_id: ChatId) -> EngineResult<Arc<ChatSession>> {
        self.get(chat_id)
            .ok_or_else(|| EngineError::ChatNotFound(chat_id.to_string()))
    }

    /// Unload a chat.
    pub fn remove(&self, chat_id: ChatId) -> Option<Arc<ChatSession>> {
        self.chats.remove(&chat_id).map(|(_, chat)| chat)
    }

    /// Number of loaded chats.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chats.len()
    }

    /// Whether no chat is loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_and_restore_keep_meta_and_tree() {
        let chat = ChatSession::new(ChatId::new(), vec!["a".into(), "b".into()]);
        let user = chat
            .history()
            .write(|h| h.append_user_message(None, "hello"))
            .unwrap();
        chat.history()
            .write(|h| h.append_response_placeholder(Some(user), "a"))
            .unwrap();
        chat.update_meta(|meta| meta.tags.push("greeting".into()));

        let stored = chat.snapshot().unwrap();
        assert_eq!(stored.title, DEFAULT_TITLE);
        assert_eq!(stored.models, vec!["a".to_string(), "b".to_string()]);

        let restored = ChatSession::from_persisted(chat.id(), stored).unwrap();
        assert_eq!(restored.meta(), chat.meta());
        assert_eq!(restored.history().snapshot().len(), 2);
    }

    #[test]
    fn stop_reaches_every_run_and_spares_later_ones() {
        let chat = ChatSession::new(ChatId::new(), Vec::new());
        let (first, first_flag) = chat.begin_run();
        let (_, second_flag) = chat.begin_run();
        assert_eq!(chat.stop_runs(), 2);
        assert!(first_flag.is_raised() && second_flag.is_raised());

        chat.end_run(first);
        let (_, third_flag) = chat.begin_run();
        assert!(!third_flag.is_raised());
        assert!(first_flag.is_raised());
        assert_eq!(chat.runs_in_flight(), 2);
    }

    #[test]
    fn registry_lookup() {
        let registry = ChatRegistry::new();
        let id = ChatId::new();
        assert!(matches!(registry.require(id), Err(EngineError::ChatNotFound(_))));
        registry.insert(ChatSession::new(id, Vec::new()));
        assert_eq!(registry.require(id).unwrap().id(), id);
        assert_eq!(registry.len(), 1);
        registry.remove(id);
        assert!(registry.is_empty());
    }
}
