//! Application state shared across all request handlers.

use std::sync::Arc;

use tracing::info;

use crate::backend::transport::{CompletionTransport, HttpTransport};
use crate::core::config::EngineConfig;
use crate::core::errors::{EngineError, EngineResult};
use crate::core::ids::ChatId;
use crate::events::reconciler::EventReconciler;
use crate::fanout::chat::{ChatRegistry, ChatSession};
use crate::fanout::coordinator::FanoutCoordinator;
use crate::fanout::services::{
    BackendTitleGenerator, ChatPersistence, InMemoryChatStore, JsonFileChatStore, TitleGenerator,
};
use crate::session::completion::SessionRuntime;
use crate::session::notify::Notifier;
use crate::stream::sentences::SentenceSplitter;

/// Shared application state.
#[derive(Debug)]
pub struct AppState {
    /// Loaded configuration.
    pub config: Arc<EngineConfig>,
    /// Loaded chats.
    pub registry: ChatRegistry,
    /// Runs completions.
    pub coordinator: FanoutCoordinator,
    /// Applies server-pushed events.
    pub reconciler: EventReconciler,
    /// Notice channel of the displayed chat.
    pub notifier: Notifier,
}

impl AppState {
    /// Build the state with the HTTP transport and the configured storage.
    ///
    /// # Errors
    /// Returns an error if the HTTP client or sentence splitter cannot be built.
    pub fn new(config: EngineConfig) -> EngineResult<Arc<Self>> {
        let transport: Arc<dyn CompletionTransport> = Arc::new(HttpTransport::new(
            config.backends.clone(),
            &config.timeouts,
        )?);
        let persistence: Arc<dyn ChatPersistence> = match &config.storage.chats_dir {
            Some(dir) => {
                info!(dir = %dir.display(), "storing chats as JSON files");
                Arc::new(JsonFileChatStore::new(dir.clone()))
            }
            None => {
                info!("storing chats in memory");
                Arc::new(InMemoryChatStore::new())
            }
        };
        let titles: Arc<dyn TitleGenerator> = Arc::new(BackendTitleGenerator::new(
            Arc::clone(&transport),
            config.timeouts.clone(),
        ));
        Self::with_services(config, transport, persistence, titles)
    }

    /// Build the state around explicit collaborators.
    ///
    /// # Errors
    /// Returns an error if the sentence splitter cannot be built.
    pub fn with_services(
        config: EngineConfig,
        transport: Arc<dyn CompletionTransport>,
        persistence: Arc<dyn ChatPersistence>,
        titles: Arc<dyn TitleGenerator>,
    ) -> EngineResult<Arc<Self>> {
        let notifier = Notifier::new(config.generation.notice_capacity);
        let runtime = SessionRuntime {
            transport,
            notifier: notifier.clone(),
            splitter: Arc::new(SentenceSplitter::new(config.generation.split_on)?),
            timeouts: config.timeouts.clone(),
        };
        let config = Arc::new(config);
        let registry = ChatRegistry::new();
        let coordinator =
            FanoutCoordinator::new(Arc::clone(&config), runtime, persistence, titles);
        let reconciler = EventReconciler::new(registry.clone(), notifier.clone());

        Ok(Arc::new(Self {
            config,
            registry,
            coordinator,
            reconciler,
            notifier,
        }))
    }

    /// Loaded chat, reading it from storage when needed.
    ///
    /// # Errors
    /// Returns `ChatNotFound` if the chat is neither loaded nor stored.
    pub async fn chat(&self, chat_id: ChatId) -> EngineResult<Arc<ChatSession>> {
        if let Some(chat) = self.registry.get(chat_id) {
            return Ok(chat);
        }
        let stored = self
            .coordinator
            .persistence()
            .load_chat(chat_id)
            .await?
            .ok_or_else(|| EngineError::ChatNotFound(chat_id.to_string()))?;
        let chat = ChatSession::from_persisted(chat_id, stored)?;
        info!(chat_id = %chat_id, "chat loaded from storage");
        Ok(self.registry.insert(chat))
    }

    /// Create and register an empty chat.
    ///
    /// # Errors
    /// Returns `UnknownModel` if a selected model is not configured.
    pub fn create_chat(&self, models: Vec<String>) -> EngineResult<Arc<ChatSession>> {
        if let Some(unknown) = models.iter().find(|id| self.config.model(id).is_none()) {
            return Err(EngineError::UnknownModel(unknown.clone()));
        }
        let chat = self.registry.insert(ChatSession::new(ChatId::new(), models));
        info!(chat_id = %chat.id(), "chat created");
        Ok(chat)
    }
}
