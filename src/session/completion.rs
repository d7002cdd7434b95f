//! One model's streamed response: `Pending -> Streaming -> {Done, Cancelled, Errored}`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::backend::models::ModelInfo;
use crate::backend::request::{
    ChatParams, CompletionRequest, build_context, check_vision, collect_files,
};
use crate::backend::transport::{CompletionTransport, StreamHandle};
use crate::core::config::TimeoutConfig;
use crate::core::errors::{EngineError, EngineResult, GENERIC_ERROR_TEXT, TreeError};
use crate::core::ids::{ChatId, MessageId};
use crate::session::cancel::CancellationFlag;
use crate::session::notify::{EngineNotice, Notifier};
use crate::session::shared::SharedHistory;
use crate::stream::{
    ProviderEvent, SentenceSplitter, SentenceTracker, StreamEvent, admits_delta, complete_response,
};
use crate::tree::message::{GenerationInfo, MessageError, MessageStatus, StatusEntry};

/// Error text for a response that finished without any content.
pub const NO_CONTENT_TEXT: &str = "No content was generated.";

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// Request not accepted yet.
    Pending,
    /// Body is being decoded.
    Streaming,
    /// Finished normally (possibly with a "no content" annotation).
    Done,
    /// Stopped by the user; partial content kept.
    Cancelled,
    /// Finished with an error annotation.
    Errored,
}

impl SessionState {
    /// Whether the state is final.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Errored)
    }
}

/// Shared collaborators of every session.
#[derive(Clone)]
pub struct SessionRuntime {
    /// Backend transport.
    pub transport: Arc<dyn CompletionTransport>,
    /// Notice channel.
    pub notifier: Notifier,
    /// Sentence splitter for notices.
    pub splitter: Arc<SentenceSplitter>,
    /// Network bounds.
    pub timeouts: TimeoutConfig,
}

impl std::fmt::Debug for SessionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRuntime")
            .field("splitter", &self.splitter.policy())
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

/// Inputs a session reads from its chat.
#[derive(Clone, Debug, Default)]
pub struct SessionInput {
    /// System prompt, if any.
    pub system: Option<String>,
    /// Generation parameters.
    pub params: ChatParams,
    /// Chat-level files.
    pub chat_files: Vec<Value>,
    /// Tools enabled for the prompt.
    pub tool_ids: Vec<String>,
    /// Web search requested for the prompt.
    pub web_search: bool,
}

/// What a finished session reports to its coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionOutcome {
    /// Response message.
    pub message_id: MessageId,
    /// Model that answered.
    pub model_id: String,
    /// Terminal state.
    pub state: SessionState,
    /// Final content.
    pub content: String,
    /// Error annotation, if any.
    pub error: Option<String>,
}

enum Ending {
    Completed,
    Cancelled,
}

enum Pulled {
    Chunk(Vec<u8>),
    End,
    Cancelled,
}

/// Drives one response message from request to terminal state.
pub struct CompletionSession {
    chat_id: ChatId,
    model: ModelInfo,
    request: CompletionRequest,
    history: SharedHistory,
    cancel: CancellationFlag,
    runtime: SessionRuntime,
    handle: Option<StreamHandle>,
    tracker: SentenceTracker,
    state: SessionState,
}

impl CompletionSession {
    /// Build the request for `response_id` and seed its status.
    ///
    /// The response message must already exist, either as a fresh placeholder
    /// or as an assistant message being continued.
    ///
    /// # Errors
    /// Returns a tree error if the response or its branch is missing.
    pub fn prepare(
        chat_id: ChatId,
        response_id: MessageId,
        model: ModelInfo,
        input: &SessionInput,
        history: SharedHistory,
        cancel: CancellationFlag,
        runtime: SessionRuntime,
    ) -> EngineResult<Self> {
        let (messages, files, user_prompt, last_sentence) = history.read(|h| {
            let response = h
                .get(response_id)
                .ok_or(TreeError::MessageNotFound(response_id))?;
            let user = response.parent_id().and_then(|id| h.get(id));
            let messages = build_context(h, response_id, input.system.as_deref())?;
            let files = collect_files(&input.chat_files, user, Some(response));
            Ok::<_, EngineError>((
                messages,
                files,
                user.map(|m| m.content.clone()).unwrap_or_default(),
                response.last_sentence.clone(),
            ))
        })?;
        check_vision(&model, &messages);

        history.update_message(response_id, |m| {
            m.status = MessageStatus::Thinking;
            m.done = false;
            m.error = None;
            if model.knowledge {
                m.status_history = vec![StatusEntry::knowledge_search(&user_prompt)];
            }
        })?;

        let request = CompletionRequest {
            model: model.clone(),
            messages,
            params: input.params.clone(),
            files,
            tool_ids: input.tool_ids.clone(),
            web_search: input.web_search,
            chat_id,
            message_id: response_id,
        };

        Ok(Self {
            chat_id,
            model,
            request,
            history,
            cancel,
            runtime,
            handle: None,
            tracker: SentenceTracker::with_last(last_sentence),
            state: SessionState::Pending,
        })
    }

    /// Response message id.
    #[must_use]
    pub const fn message_id(&self) -> MessageId {
        self.request.message_id
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Run to a terminal state.
    pub async fn run(mut self) -> SessionOutcome {
        self.runtime.notifier.emit(EngineNotice::ChatStart {
            chat_id: self.chat_id,
            message_id: self.message_id(),
        });
        let result = self.drive().await;
        self.finish(result)
    }

    async fn drive(&mut self) -> EngineResult<Ending> {
        if self.cancel.is_raised() {
            return Ok(Ending::Cancelled);
        }

        let opened = tokio::select! {
            biased;
            () = self.cancel.raised() => return Ok(Ending::Cancelled),
            opened = timeout(
                self.runtime.timeouts.response_headers(),
                self.runtime.transport.open(&self.request),
            ) => opened,
        };
        let handle = opened.map_err(|_| EngineError::Timeout("response headers"))??;
        self.state = SessionState::Streaming;
        debug!(message_id = %self.message_id(), model = %self.model.id, "stream accepted");
        let handle = self.handle.insert(handle);

        let dialect = self.model.provider.dialect();
        let chunk_limit = self.runtime.timeouts.chunk();

        if !self.request.params.stream() {
            let mut body = Vec::new();
            loop {
                match pull(handle, &self.cancel, chunk_limit).await? {
                    Pulled::Chunk(chunk) => body.extend_from_slice(&chunk),
                    Pulled::End => break,
                    Pulled::Cancelled => return Ok(Ending::Cancelled),
                }
            }
            let cancel = self.cancel.clone();
            return apply_all(self.writer(), complete_response(dialect, &body), &cancel)
                .map(|ending| ending.unwrap_or(Ending::Completed));
        }

        let mut decoder = dialect.decoder();
        loop {
            let events = match pull(handle, &self.cancel, chunk_limit).await? {
                Pulled::Chunk(chunk) => decoder.decode(&chunk),
                Pulled::End => break,
                Pulled::Cancelled => return Ok(Ending::Cancelled),
            };
            let writer = Writer {
                chat_id: self.chat_id,
                message_id: self.request.message_id,
                history: &self.history,
                runtime: &self.runtime,
                tracker: &mut self.tracker,
            };
            if let Some(ending) = apply_all(writer, events, &self.cancel)? {
                return Ok(ending);
            }
        }

        // end of body without an explicit final record
        let tail = decoder.finish();
        let cancel = self.cancel.clone();
        apply_all(self.writer(), tail, &cancel).map(|ending| ending.unwrap_or(Ending::Completed))
    }

    fn writer(&mut self) -> Writer<'_> {
        Writer {
            chat_id: self.chat_id,
            message_id: self.request.message_id,
            history: &self.history,
            runtime: &self.runtime,
            tracker: &mut self.tracker,
        }
    }

    fn finish(mut self, result: EngineResult<Ending>) -> SessionOutcome {
        if let Some(mut handle) = self.handle.take() {
            handle.release();
        }

        let (state, error) = match result {
            Ok(Ending::Completed) => (SessionState::Done, None),
            Ok(Ending::Cancelled) => (SessionState::Cancelled, None),
            Err(err) => {
                warn!(
                    chat_id = %self.chat_id,
                    message_id = %self.message_id(),
                    model = %self.model.id,
                    error = %err,
                    "completion failed"
                );
                (SessionState::Errored, Some(self.error_text(&err)))
            }
        };
        self.state = state;

        let message_id = self.message_id();
        let splitter = Arc::clone(&self.runtime.splitter);
        let tracker = &mut self.tracker;
        let finalized = self.history.update_message(message_id, |m| {
            m.prune_pending_lookups();
            let mut error = error.clone();
            if state == SessionState::Done && m.content.is_empty() {
                error = Some(NO_CONTENT_TEXT.to_string());
            }
            if let Some(text) = &error {
                m.error = Some(MessageError::new(text.clone()));
            }
            m.status = MessageStatus::Done;
            m.done = true;
            let sentence = if state == SessionState::Errored {
                None
            } else {
                tracker.finish(&splitter, &m.content)
            };
            if let Some(sentence) = &sentence {
                m.last_sentence = Some(sentence.clone());
            }
            (m.content.clone(), error, sentence)
        });

        let (content, error) = match finalized {
            Ok((content, error, sentence)) => {
                if let Some(content) = sentence {
                    self.runtime.notifier.emit(EngineNotice::Sentence {
                        chat_id: self.chat_id,
                        message_id,
                        content,
                    });
                }
                (content, error)
            }
            Err(err) => {
                warn!(message_id = %message_id, error = %err, "response removed before it finished");
                (String::new(), error)
            }
        };

        self.runtime.notifier.emit(EngineNotice::ChatFinish {
            chat_id: self.chat_id,
            message_id,
            content: content.clone(),
        });
        info!(
            chat_id = %self.chat_id,
            message_id = %message_id,
            model = %self.model.id,
            state = ?state,
            chars = content.len(),
            "completion finished"
        );

        SessionOutcome {
            message_id,
            model_id: self.model.id.clone(),
            state,
            content,
            error,
        }
    }

    fn error_text(&self, err: &EngineError) -> String {
        match err {
            err if err.is_transport() => self.model.connection_error_text(),
            EngineError::Backend(text) => text.clone(),
            _ => GENERIC_ERROR_TEXT.to_string(),
        }
    }
}

/// Next chunk, racing the stop signal and the per-chunk bound.
async fn pull(
    handle: &mut StreamHandle,
    cancel: &CancellationFlag,
    limit: Duration,
) -> EngineResult<Pulled> {
    tokio::select! {
        biased;
        () = cancel.raised() => Ok(Pulled::Cancelled),
        next = timeout(limit, handle.next_chunk()) => match next {
            Err(_) => Err(EngineError::Timeout("stream chunk")),
            Ok(None) => Ok(Pulled::End),
            Ok(Some(chunk)) => chunk.map(Pulled::Chunk),
        },
    }
}

/// Applies decoded events to the response message.
struct Writer<'a> {
    chat_id: ChatId,
    message_id: MessageId,
    history: &'a SharedHistory,
    runtime: &'a SessionRuntime,
    tracker: &'a mut SentenceTracker,
}

fn apply_all(
    mut writer: Writer<'_>,
    events: Vec<StreamEvent>,
    cancel: &CancellationFlag,
) -> EngineResult<Option<Ending>> {
    for event in events {
        if cancel.is_raised() {
            return Ok(Some(Ending::Cancelled));
        }
        if let Some(ending) = writer.apply(event)? {
            return Ok(Some(ending));
        }
    }
    Ok(None)
}

impl Writer<'_> {
    fn apply(&mut self, event: StreamEvent) -> EngineResult<Option<Ending>> {
        match event {
            StreamEvent::ContentDelta(delta) => {
                let splitter = &self.runtime.splitter;
                let tracker = &mut *self.tracker;
                let sentence = self.history.update_message(self.message_id, |m| {
                    if !admits_delta(&m.content, &delta) {
                        return None;
                    }
                    m.content.push_str(&delta);
                    m.status = MessageStatus::Streaming;
                    let sentence = tracker.observe(splitter, &m.content);
                    if let Some(sentence) = &sentence {
                        m.last_sentence = Some(sentence.clone());
                    }
                    sentence
                })?;
                if let Some(content) = sentence {
                    self.runtime.notifier.emit(EngineNotice::Sentence {
                        chat_id: self.chat_id,
                        message_id: self.message_id,
                        content,
                    });
                }
                Ok(None)
            }
            StreamEvent::Sources(sources) => {
                self.history.update_message(self.message_id, |m| {
                    m.sources.extend(sources);
                    m.prune_pending_lookups();
                })?;
                Ok(None)
            }
            StreamEvent::ProviderSpecific(ProviderEvent::SelectedModel(model)) => {
                self.history.update_message(self.message_id, |m| {
                    m.selected_model_id = Some(model);
                    m.arena = true;
                })?;
                Ok(None)
            }
            StreamEvent::ProviderSpecific(ProviderEvent::Usage(usage)) => {
                self.history.update_message(self.message_id, |m| {
                    let info = m.info.get_or_insert_with(GenerationInfo::default);
                    info.usage = Some(usage);
                    info.openai = true;
                })?;
                Ok(None)
            }
            StreamEvent::Done(mut info) => {
                self.history.update_message(self.message_id, |m| {
                    if info.usage.is_none() {
                        info.usage = m.info.as_ref().and_then(|old| old.usage.clone());
                    }
                    m.info = Some(info);
                })?;
                Ok(Some(Ending::Completed))
            }
            StreamEvent::Error(text) => Err(EngineError::Backend(text)),
        }
    }
}
