//! Outbound services: chat persistence and title/tag generation.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::backend::models::ModelInfo;
use crate::backend::request::{ChatParams, CompletionRequest, RequestMessage};
use crate::backend::transport::CompletionTransport;
use crate::core::config::TimeoutConfig;
use crate::core::errors::{EngineError, EngineResult};
use crate::core::ids::{ChatId, MessageId};
use crate::stream::{StreamEvent, complete_response};
use crate::tree::message::Role;
use crate::tree::persisted::PersistedChat;

/// Boxed future type used by service traits.
pub type ServiceFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Stores chat documents.
pub trait ChatPersistence: Send + Sync {
    /// Replace the stored document of `chat_id`.
    ///
    /// # Errors
    /// Returns an error if the document cannot be written.
    fn update_chat<'a>(
        &'a self,
        chat_id: ChatId,
        chat: &'a PersistedChat,
    ) -> ServiceFuture<'a, EngineResult<()>>;

    /// Load a stored document.
    ///
    /// # Errors
    /// Returns an error if the document exists but cannot be read.
    fn load_chat(&self, chat_id: ChatId) -> ServiceFuture<'_, EngineResult<Option<PersistedChat>>>;

    /// Update only the title.
    ///
    /// # Errors
    /// Returns `ChatNotFound` if nothing is stored for `chat_id`.
    fn set_title<'a>(&'a self, chat_id: ChatId, title: &'a str) -> ServiceFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            let mut chat = self
                .load_chat(chat_id)
                .await?
                .ok_or_else(|| EngineError::ChatNotFound(chat_id.to_string()))?;
            chat.title = title.to_string();
            self.update_chat(chat_id, &chat).await
        })
    }

    /// Update only the tags.
    ///
    /// # Errors
    /// Returns `ChatNotFound` if nothing is stored for `chat_id`.
    fn set_tags<'a>(&'a self, chat_id: ChatId, tags: &'a [String]) -> ServiceFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            let mut chat = self
                .load_chat(chat_id)
                .await?
                .ok_or_else(|| EngineError::ChatNotFound(chat_id.to_string()))?;
            chat.tags = tags.to_vec();
            self.update_chat(chat_id, &chat).await
        })
    }
}

/// Chat documents kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryChatStore {
    chats: DashMap<ChatId, PersistedChat>,
    updates: AtomicUsize,
}

impl InMemoryChatStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `update_chat` calls so far.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Stored document, if any.
    #[must_use]
    pub fn get(&self, chat_id: ChatId) -> Option<PersistedChat> {
        self.chats.get(&chat_id).map(|entry| entry.value().clone())
    }
}

impl ChatPersistence for InMemoryChatStore {
    fn update_chat<'a>(
        &'a self,
        chat_id: ChatId,
        chat: &'a PersistedChat,
    ) -> ServiceFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            self.updates.fetch_add(1, Ordering::SeqCst);
            self.chats.insert(chat_id, chat.clone());
            Ok(())
        })
    }

    fn load_chat(&self, chat_id: ChatId) -> ServiceFuture<'_, EngineResult<Option<PersistedChat>>> {
        Box::pin(async move { Ok(self.get(chat_id)) })
    }
}

/// One pretty-printed JSON document per chat.
#[derive(Clone, Debug)]
pub struct JsonFileChatStore {
    dir: PathBuf,
}

impl JsonFileChatStore {
    /// Store under `dir`, created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Storage directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, chat_id: ChatId) -> PathBuf {
        self.dir.join(format!("{chat_id}.json"))
    }
}

impl ChatPersistence for JsonFileChatStore {
    fn update_chat<'a>(
        &'a self,
        chat_id: ChatId,
        chat: &'a PersistedChat,
    ) -> ServiceFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&self.dir).await?;
            let path = self.path(chat_id);
            let tmp = path.with_extension("json.tmp");
            let bytes = serde_json::to_vec_pretty(chat)?;
            tokio::fs::write(&tmp, bytes).await?;
            tokio::fs::rename(&tmp, &path).await?;
            debug!(chat_id = %chat_id, path = %path.display(), "chat saved");
            Ok(())
        })
    }

    fn load_chat(&self, chat_id: ChatId) -> ServiceFuture<'_, EngineResult<Option<PersistedChat>>> {
        Box::pin(async move {
            match tokio::fs::read(self.path(chat_id)).await {
                Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err.into()),
            }
        })
    }
}

/// Generates chat titles and tags.
pub trait TitleGenerator: Send + Sync {
    /// Short title for the conversation.
    ///
    /// # Errors
    /// Returns an error if the backend call fails.
    fn generate_title<'a>(
        &'a self,
        chat_id: ChatId,
        model: &'a ModelInfo,
        messages: &'a [RequestMessage],
    ) -> ServiceFuture<'a, EngineResult<String>>;

    /// A few broad tags for the conversation.
    ///
    /// # Errors
    /// Returns an error if the backend call fails.
    fn generate_tags<'a>(
        &'a self,
        chat_id: ChatId,
        model: &'a ModelInfo,
        messages: &'a [RequestMessage],
    ) -> ServiceFuture<'a, EngineResult<Vec<String>>>;
}

const TITLE_PROMPT: &str = "Create a concise, 3-5 word title for the chat history above. \
Respond only with the title, without quotes or extra text.";

const TAGS_PROMPT: &str = "Generate 1-3 broad tags categorizing the main themes of the chat \
history above. Respond only with JSON in the format {\"tags\": [\"tag1\", \"tag2\"]}.";

/// Runs title/tag prompts as collected, non-streamed completions.
#[derive(Clone)]
pub struct BackendTitleGenerator {
    transport: Arc<dyn CompletionTransport>,
    timeouts: TimeoutConfig,
}

impl BackendTitleGenerator {
    /// Use `transport` with the given bounds.
    #[must_use]
    pub fn new(transport: Arc<dyn CompletionTransport>, timeouts: TimeoutConfig) -> Self {
        Self {
            transport,
            timeouts,
        }
    }

    async fn collect(
        &self,
        chat_id: ChatId,
        model: &ModelInfo,
        messages: &[RequestMessage],
        instruction: &str,
    ) -> EngineResult<String> {
        let mut context = messages.to_vec();
        context.push(RequestMessage {
            role: Role::User,
            content: instruction.to_string(),
            images: None,
        });
        let request = CompletionRequest {
            model: model.clone(),
            messages: context,
            params: ChatParams {
                stream_response: Some(false),
                ..ChatParams::default()
            },
            files: Vec::new(),
            tool_ids: Vec::new(),
            web_search: false,
            chat_id,
            message_id: MessageId::new(),
        };

        let mut handle = timeout(self.timeouts.response_headers(), self.transport.open(&request))
            .await
            .map_err(|_| EngineError::Timeout("response headers"))??;
        let mut body = Vec::new();
        loop {
            match timeout(self.timeouts.chunk(), handle.next_chunk()).await {
                Err(_) => return Err(EngineError::Timeout("stream chunk")),
                Ok(None) => break,
                Ok(Some(chunk)) => body.extend_from_slice(&chunk?),
            }
        }
        handle.release();

        let mut text = String::new();
        for event in complete_response(model.provider.dialect(), &body) {
            match event {
                StreamEvent::ContentDelta(delta) => text.push_str(&delta),
                StreamEvent::Error(err) => return Err(EngineError::Backend(err)),
                _ => {}
            }
        }
        Ok(text)
    }
}

impl TitleGenerator for BackendTitleGenerator {
    fn generate_title<'a>(
        &'a self,
        chat_id: ChatId,
        model: &'a ModelInfo,
        messages: &'a [RequestMessage],
    ) -> ServiceFuture<'a, EngineResult<String>> {
        Box::pin(async move {
            let raw = self.collect(chat_id, model, messages, TITLE_PROMPT).await?;
            clean_title(&raw).ok_or_else(|| EngineError::Parse("empty title".into()))
        })
    }

    fn generate_tags<'a>(
        &'a self,
        chat_id: ChatId,
        model: &'a ModelInfo,
        messages: &'a [RequestMessage],
    ) -> ServiceFuture<'a, EngineResult<Vec<String>>> {
        Box::pin(async move {
            let raw = self.collect(chat_id, model, messages, TAGS_PROMPT).await?;
            Ok(parse_tags(&raw))
        })
    }
}

/// First non-empty line, without surrounding quotes.
fn clean_title(raw: &str) -> Option<String> {
    raw.lines()
        .map(|line| line.trim().trim_matches(|c| c == '"' || c == '\'').trim())
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Tags from a `{"tags": [...]}` object anywhere in `raw`.
fn parse_tags(raw: &str) -> Vec<String> {
    let parsed = raw
        .find('{')
        .zip(raw.rfind('}'))
        .filter(|(start, end)| start < end)
        .and_then(|(start, end)| serde_json::from_str::<Value>(&raw[start..=end]).ok());
    let Some(tags) = parsed.as_ref().and_then(|v| v.get("tags")).and_then(Value::as_array) else {
        warn!("tag response without a tags list");
        return Vec::new();
    };
    let mut out: Vec<String> = Vec::new();
    for tag in tags.iter().filter_map(Value::as_str).map(str::trim) {
        if !tag.is_empty() && !out.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
            out.push(tag.to_string());
        }
    }
    out
}
