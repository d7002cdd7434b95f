//! Runs one completion session per selected model and finishes the run.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backend::models::ModelInfo;
use crate::backend::request::{RequestMessage, build_context};
use crate::core::config::EngineConfig;
use crate::core::errors::{EngineError, EngineResult, TreeError};
use crate::core::ids::{ChatId, MessageId};
use crate::fanout::chat::{ChatSession, DEFAULT_TITLE};
use crate::fanout::services::{ChatPersistence, TitleGenerator};
use crate::session::completion::{
    CompletionSession, SessionInput, SessionOutcome, SessionRuntime, SessionState,
};
use crate::tree::message::{Message, Role};

/// A user prompt with its attachments.
#[derive(Clone, Debug, Default)]
pub struct Prompt {
    /// Prompt text.
    pub content: String,
    /// Files attached to the prompt.
    pub files: Vec<Value>,
    /// Tools enabled for this prompt.
    pub tool_ids: Vec<String>,
    /// Web search requested.
    pub web_search: bool,
}

impl Prompt {
    /// Plain text prompt.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

/// Response slots allocated by a run, plus the task finishing it.
#[derive(Debug)]
pub struct FanoutRun {
    /// User message of the run, when one was created.
    pub user_message_id: Option<MessageId>,
    /// `(model id, response message id)` per session.
    pub responses: Vec<(String, MessageId)>,
    /// Resolves once every session is terminal and the chat is persisted.
    pub handle: JoinHandle<RunReport>,
}

/// Result of a finished run.
#[derive(Debug)]
pub struct RunReport {
    /// Outcome per session, in model order.
    pub outcomes: Vec<SessionOutcome>,
    /// Whether the chat document was written.
    pub persisted: bool,
    /// Title/tag generation, when this was the first exchange.
    pub followup: Option<JoinHandle<()>>,
}

/// Starts sessions concurrently and runs the post-completion actions.
#[derive(Clone)]
pub struct FanoutCoordinator {
    config: Arc<EngineConfig>,
    runtime: SessionRuntime,
    persistence: Arc<dyn ChatPersistence>,
    titles: Arc<dyn TitleGenerator>,
}

impl std::fmt::Debug for FanoutCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutCoordinator")
            .field("models", &self.config.models.len())
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}

impl FanoutCoordinator {
    /// Build a coordinator.
    #[must_use]
    pub fn new(
        config: Arc<EngineConfig>,
        runtime: SessionRuntime,
        persistence: Arc<dyn ChatPersistence>,
        titles: Arc<dyn TitleGenerator>,
    ) -> Self {
        Self {
            config,
            runtime,
            persistence,
            titles,
        }
    }

    /// Session collaborators.
    #[must_use]
    pub const fn runtime(&self) -> &SessionRuntime {
        &self.runtime
    }

    /// Persistence service.
    #[must_use]
    pub const fn persistence(&self) -> &Arc<dyn ChatPersistence> {
        &self.persistence
    }

    fn model(&self, id: &str) -> EngineResult<ModelInfo> {
        self.config
            .model(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownModel(id.to_string()))
    }

    fn input(&self, chat: &ChatSession, prompt: Option<&Prompt>) -> SessionInput {
        let meta = chat.meta();
        SessionInput {
            system: meta
                .params
                .system
                .clone()
                .or_else(|| self.config.generation.system.clone()),
            params: meta.params,
            chat_files: meta.files,
            tool_ids: prompt.map(|p| p.tool_ids.clone()).unwrap_or_default(),
            web_search: prompt.is_some_and(|p| p.web_search),
        }
    }

    /// Append the prompt under the current tip and answer it with every selected model.
    ///
    /// # Errors
    /// Returns `InvalidRequest` for an empty prompt or selection and
    /// `UnknownModel` for an unconfigured model; the history is not modified.
    pub fn submit(&self, chat: Arc<ChatSession>, prompt: Prompt) -> EngineResult<FanoutRun> {
        if prompt.content.trim().is_empty() && prompt.files.is_empty() {
            return Err(EngineError::InvalidRequest("prompt is empty".into()));
        }
        let selected = chat.meta().models;
        if selected.is_empty() {
            return Err(EngineError::InvalidRequest("no model selected".into()));
        }
        let models = selected
            .iter()
            .map(|id| self.model(id))
            .collect::<EngineResult<Vec<_>>>()?;

        let (user_id, targets) = chat.history().write(|history| {
            let mut user = Message::user(prompt.content.clone());
            user.files = prompt.files.clone();
            let user_id = history.attach(history.current_id(), user)?;
            let mut targets = Vec::with_capacity(models.len());
            for (idx, model) in models.into_iter().enumerate() {
                let mut placeholder = Message::assistant_placeholder(model.id.clone());
                placeholder.model_name = Some(model.display_name().to_string());
                placeholder.model_idx = Some(idx);
                let response_id = history.attach(Some(user_id), placeholder)?;
                targets.push((model, response_id));
            }
            Ok::<_, EngineError>((user_id, targets))
        })?;

        info!(chat_id = %chat.id(), user_message_id = %user_id, models = targets.len(), "prompt submitted");
        let input = self.input(&chat, Some(&prompt));
        self.launch(chat, Some(user_id), targets, &input)
    }

    /// Answer the prompt of `response_id` again, as a sibling from the same model.
    ///
    /// # Errors
    /// Returns `InvalidRequest` if `response_id` is not a model response.
    pub fn regenerate(&self, chat: Arc<ChatSession>, response_id: MessageId) -> EngineResult<FanoutRun> {
        let (model_id, model_idx, user_id) = chat.history().read(|history| {
            let response = history
                .get(response_id)
                .ok_or(TreeError::MessageNotFound(response_id))?;
            let (Role::Assistant, Some(model_id), Some(user_id)) =
                (response.role, response.model.clone(), response.parent_id())
            else {
                return Err(EngineError::InvalidRequest(
                    "only model responses can be regenerated".into(),
                ));
            };
            Ok::<_, EngineError>((model_id, response.model_idx, user_id))
        })?;
        let model = self.model(&model_id)?;

        let mut placeholder = Message::assistant_placeholder(model.id.clone());
        placeholder.model_name = Some(model.display_name().to_string());
        placeholder.model_idx = model_idx;
        let new_id = chat
            .history()
            .write(|history| history.attach(Some(user_id), placeholder))?;

        info!(chat_id = %chat.id(), message_id = %new_id, model = %model.id, "regenerating response");
        let input = self.input(&chat, None);
        self.launch(chat, None, vec![(model, new_id)], &input)
    }

    /// Keep generating into an existing response.
    ///
    /// # Errors
    /// Returns `InvalidRequest` if `response_id` is not a model response.
    pub fn continue_response(
        &self,
        chat: Arc<ChatSession>,
        response_id: MessageId,
    ) -> EngineResult<FanoutRun> {
        let model_id = chat.history().write(|history| {
            let response = history
                .get(response_id)
                .ok_or(TreeError::MessageNotFound(response_id))?;
            let (Role::Assistant, Some(model_id)) = (response.role, response.model.clone()) else {
                return Err(EngineError::InvalidRequest(
                    "only model responses can be continued".into(),
                ));
            };
            history.set_current_id(Some(response_id))?;
            Ok::<_, EngineError>(model_id)
        })?;
        let model = self.model(&model_id)?;

        info!(chat_id = %chat.id(), message_id = %response_id, model = %model.id, "continuing response");
        let input = self.input(&chat, None);
        self.launch(chat, None, vec![(model, response_id)], &input)
    }

    /// Delete `message_id` with its descendants and persist the chat.
    ///
    /// # Errors
    /// Returns a tree error if the message is missing, or a persistence error.
    pub async fn delete_message(
        &self,
        chat: &ChatSession,
        message_id: MessageId,
    ) -> EngineResult<Vec<MessageId>> {
        let removed = chat
            .history()
            .write(|history| history.delete_subtree(message_id))?;
        info!(chat_id = %chat.id(), message_id = %message_id, removed = removed.len(), "messages deleted");
        self.persist(chat).await?;
        Ok(removed)
    }

    /// Stop every run of the chat that is still in flight.
    pub fn stop(&self, chat: &ChatSession) {
        let stopped = chat.stop_runs();
        info!(chat_id = %chat.id(), runs = stopped, "stop requested");
    }

    /// Change the displayed chat; notices of other chats are dropped.
    pub fn set_active(&self, chat_id: Option<ChatId>) {
        self.runtime.notifier.set_active(chat_id);
    }

    fn launch(
        &self,
        chat: Arc<ChatSession>,
        user_message_id: Option<MessageId>,
        targets: Vec<(ModelInfo, MessageId)>,
        input: &SessionInput,
    ) -> EngineResult<FanoutRun> {
        let (run, cancel) = chat.begin_run();
        let responses = targets
            .iter()
            .map(|(model, id)| (model.id.clone(), *id))
            .collect();

        let mut sessions = Vec::with_capacity(targets.len());
        for (model, response_id) in targets {
            let prepared = CompletionSession::prepare(
                chat.id(),
                response_id,
                model,
                input,
                chat.history().clone(),
                cancel.clone(),
                self.runtime.clone(),
            );
            match prepared {
                Ok(session) => sessions.push(session),
                Err(err) => {
                    chat.end_run(run);
                    return Err(err);
                }
            }
        }

        let this = self.clone();
        let handle = tokio::spawn(async move { this.complete(chat, run, sessions).await });
        Ok(FanoutRun {
            user_message_id,
            responses,
            handle,
        })
    }

    async fn complete(
        self,
        chat: Arc<ChatSession>,
        run: u64,
        sessions: Vec<CompletionSession>,
    ) -> RunReport {
        let tasks: Vec<_> = sessions
            .into_iter()
            .map(|session| tokio::spawn(session.run()))
            .collect();

        let mut outcomes = Vec::with_capacity(tasks.len());
        for joined in join_all(tasks).await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => error!(chat_id = %chat.id(), error = %err, "completion task failed"),
            }
        }
        chat.end_run(run);

        let persisted = match self.persist(&chat).await {
            Ok(()) => true,
            Err(err) => {
                error!(chat_id = %chat.id(), error = %err, "failed to persist chat");
                false
            }
        };

        let followup = self.first_exchange(&chat, &outcomes).map(|(model, messages)| {
            let this = self.clone();
            let chat = Arc::clone(&chat);
            tokio::spawn(async move { this.generate_followups(chat, model, messages).await })
        });

        RunReport {
            outcomes,
            persisted,
            followup,
        }
    }

    async fn persist(&self, chat: &ChatSession) -> EngineResult<()> {
        let _guard = chat.persist_guard().await;
        let document = chat.snapshot()?;
        self.persistence.update_chat(chat.id(), &document).await
    }

    /// The finalized pair when this run answered the chat's first prompt with
    /// its first selected model.
    fn first_exchange(
        &self,
        chat: &ChatSession,
        outcomes: &[SessionOutcome],
    ) -> Option<(ModelInfo, Vec<RequestMessage>)> {
        let generation = &self.config.generation;
        if !generation.auto_title && !generation.auto_tags {
            return None;
        }
        let first_model = chat.meta().models.into_iter().next()?;
        let outcome = outcomes
            .iter()
            .find(|o| o.model_id == first_model && o.state != SessionState::Errored)?;
        let messages = chat.history().read(|history| {
            let depth = history.path_to_root(outcome.message_id).ok()?.len();
            (depth == 2).then(|| build_context(history, outcome.message_id, None).ok())?
        })?;
        let model = self.config.model(&first_model)?.clone();
        Some((model, messages))
    }

    async fn generate_followups(
        &self,
        chat: Arc<ChatSession>,
        model: ModelInfo,
        messages: Vec<RequestMessage>,
    ) {
        let chat_id = chat.id();
        if self.config.generation.auto_title {
            let title = match self.titles.generate_title(chat_id, &model, &messages).await {
                Ok(title) => title,
                Err(err) => {
                    warn!(chat_id = %chat_id, error = %err, "title generation failed");
                    fallback_title(&messages)
                }
            };
            chat.update_meta(|meta| meta.title = title.clone());
            let _guard = chat.persist_guard().await;
            if let Err(err) = self.persistence.set_title(chat_id, &title).await {
                warn!(chat_id = %chat_id, error = %err, "failed to store title");
            }
            info!(chat_id = %chat_id, title = %title, "chat titled");
        }
        if self.config.generation.auto_tags {
            match self.titles.generate_tags(chat_id, &model, &messages).await {
                Ok(tags) if !tags.is_empty() => {
                    chat.update_meta(|meta| meta.tags = tags.clone());
                    let _guard = chat.persist_guard().await;
                    if let Err(err) = self.persistence.set_tags(chat_id, &tags).await {
                        warn!(chat_id = %chat_id, error = %err, "failed to store tags");
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(chat_id = %chat_id, error = %err, "tag generation failed"),
            }
        }
    }
}

/// The prompt itself, when no title could be generated.
fn fallback_title(messages: &[RequestMessage]) -> String {
    messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.trim().chars().take(60).collect::<String>())
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| DEFAULT_TITLE.to_string())
}
