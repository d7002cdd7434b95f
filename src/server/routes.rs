//! HTTP route handlers for the chat engine API.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use crate::backend::request::ChatParams;
use crate::core::errors::{EngineError, TreeError};
use crate::core::ids::{ChatId, MessageId};
use crate::events::push::{PushEvent, PushKind};
use crate::events::reconciler::{PromptAnswer, PromptView, Reconciled};
use crate::fanout::coordinator::{FanoutRun, Prompt};
use crate::tree::persisted::PersistedChat;

use super::state::AppState;

type ApiError = (StatusCode, String);
type ApiResult<T> = Result<Json<T>, ApiError>;

/// Create the API router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/chats", post(create_chat))
        .route("/api/chats/{chat_id}", get(get_chat))
        .route("/api/chats/{chat_id}/messages", post(submit_prompt))
        .route("/api/chats/{chat_id}/messages/{message_id}", delete(delete_message))
        .route(
            "/api/chats/{chat_id}/messages/{message_id}/regenerate",
            post(regenerate),
        )
        .route(
            "/api/chats/{chat_id}/messages/{message_id}/continue",
            post(continue_response),
        )
        .route("/api/chats/{chat_id}/stop", post(stop))
        .route("/api/chats/{chat_id}/activate", post(activate))
        .route("/api/chats/{chat_id}/prompts", get(pending_prompts))
        .route("/api/active", delete(deactivate))
        .route("/api/events", post(push_event))
        .route("/api/prompts/{prompt_id}", post(resolve_prompt))
        .route("/api/notices", get(notices))
        .with_state(state)
}

fn api_error(err: EngineError) -> ApiError {
    let status = match &err {
        EngineError::ChatNotFound(_)
        | EngineError::Tree(TreeError::MessageNotFound(_) | TreeError::ParentNotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        EngineError::InvalidRequest(_)
        | EngineError::UnknownModel(_)
        | EngineError::Parse(_)
        | EngineError::Serialization(_) => StatusCode::BAD_REQUEST,
        EngineError::Network(_) | EngineError::Timeout(_) | EngineError::Backend(_) => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    debug!(status = status.as_u16(), error = %err, "request failed");
    (status, err.to_string())
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "chat-engine",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// New chat request.
#[derive(Debug, Deserialize)]
pub struct CreateChatRequest {
    /// Selected model ids, in display order.
    pub models: Vec<String>,
    /// Generation parameters.
    #[serde(default)]
    pub params: Option<ChatParams>,
    /// Chat-level files.
    #[serde(default)]
    pub files: Vec<Value>,
}

/// A chat with its stored form.
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    /// Chat id.
    pub id: ChatId,
    /// Document as it would be persisted.
    #[serde(flatten)]
    pub chat: PersistedChat,
}

async fn create_chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateChatRequest>,
) -> ApiResult<ChatResponse> {
    let chat = state.create_chat(request.models).map_err(api_error)?;
    chat.update_meta(|meta| {
        if let Some(params) = request.params {
            meta.params = params;
        }
        meta.files = request.files;
    });
    let document = chat.snapshot().map_err(|err| api_error(err.into()))?;
    Ok(Json(ChatResponse {
        id: chat.id(),
        chat: document,
    }))
}

async fn get_chat(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<ChatId>,
) -> ApiResult<ChatResponse> {
    let chat = state.chat(chat_id).await.map_err(api_error)?;
    let document = chat.snapshot().map_err(|err| api_error(err.into()))?;
    Ok(Json(ChatResponse {
        id: chat_id,
        chat: document,
    }))
}

/// Prompt submission.
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    /// Prompt text.
    pub content: String,
    /// Attached files.
    #[serde(default)]
    pub files: Vec<Value>,
    /// Enabled tools.
    #[serde(default)]
    pub tool_ids: Vec<String>,
    /// Web search requested.
    #[serde(default)]
    pub web_search: bool,
}

/// One response slot of a run.
#[derive(Debug, Serialize)]
pub struct ResponseSlot {
    /// Model answering.
    pub model: String,
    /// Message receiving the answer.
    pub message_id: MessageId,
}

/// Slots allocated by a run; generation continues in the background.
#[derive(Debug, Serialize)]
pub struct RunResponse {
    /// User message, for submissions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_message_id: Option<MessageId>,
    /// Response slots.
    pub responses: Vec<ResponseSlot>,
}

impl From<FanoutRun> for RunResponse {
    fn from(run: FanoutRun) -> Self {
        Self {
            user_message_id: run.user_message_id,
            responses: run
                .responses
                .into_iter()
                .map(|(model, message_id)| ResponseSlot { model, message_id })
                .collect(),
        }
    }
}

async fn submit_prompt(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<ChatId>,
    Json(request): Json<SubmitRequest>,
) -> ApiResult<RunResponse> {
    let chat = state.chat(chat_id).await.map_err(api_error)?;
    let prompt = Prompt {
        content: request.content,
        files: request.files,
        tool_ids: request.tool_ids,
        web_search: request.web_search,
    };
    let run = state.coordinator.submit(chat, prompt).map_err(api_error)?;
    Ok(Json(run.into()))
}

async fn regenerate(
    State(state): State<Arc<AppState>>,
    Path((chat_id, message_id)): Path<(ChatId, MessageId)>,
) -> ApiResult<RunResponse> {
    let chat = state.chat(chat_id).await.map_err(api_error)?;
    let run = state
        .coordinator
        .regenerate(chat, message_id)
        .map_err(api_error)?;
    Ok(Json(run.into()))
}

async fn continue_response(
    State(state): State<Arc<AppState>>,
    Path((chat_id, message_id)): Path<(ChatId, MessageId)>,
) -> ApiResult<RunResponse> {
    let chat = state.chat(chat_id).await.map_err(api_error)?;
    let run = state
        .coordinator
        .continue_response(chat, message_id)
        .map_err(api_error)?;
    Ok(Json(run.into()))
}

/// Ids removed by a delete.
#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    /// Removed message ids.
    pub removed: Vec<MessageId>,
}

async fn delete_message(
    State(state): State<Arc<AppState>>,
    Path((chat_id, message_id)): Path<(ChatId, MessageId)>,
) -> ApiResult<DeleteResponse> {
    let chat = state.chat(chat_id).await.map_err(api_error)?;
    let removed = state
        .coordinator
        .delete_message(&chat, message_id)
        .await
        .map_err(api_error)?;
    Ok(Json(DeleteResponse { removed }))
}

async fn stop(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<ChatId>,
) -> Result<StatusCode, ApiError> {
    let chat = state.registry.require(chat_id).map_err(api_error)?;
    state.coordinator.stop(&chat);
    Ok(StatusCode::NO_CONTENT)
}

async fn activate(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<ChatId>,
) -> Result<StatusCode, ApiError> {
    state.chat(chat_id).await.map_err(api_error)?;
    state.coordinator.set_active(Some(chat_id));
    Ok(StatusCode::NO_CONTENT)
}

async fn deactivate(State(state): State<Arc<AppState>>) -> StatusCode {
    state.coordinator.set_active(None);
    StatusCode::NO_CONTENT
}

/// Result of a pushed event.
#[derive(Debug, Serialize)]
pub struct PushResponse {
    /// What the reconciler did.
    #[serde(flatten)]
    pub outcome: Reconciled,
    /// The user's answer, for confirmation and input prompts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<PromptAnswer>,
}

/// Apply a pushed event. Prompt events answer once the user resolved them.
async fn push_event(
    State(state): State<Arc<AppState>>,
    Json(value): Json<Value>,
) -> ApiResult<PushResponse> {
    let Some(event) = PushEvent::from_value(value).map_err(api_error)? else {
        return Ok(Json(PushResponse {
            outcome: Reconciled::Ignored,
            answer: None,
        }));
    };

    if !matches!(event.kind, PushKind::Confirmation(_) | PushKind::Input(_)) {
        let outcome = state.reconciler.apply(event, None).map_err(api_error)?;
        return Ok(Json(PushResponse {
            outcome,
            answer: None,
        }));
    }

    let (tx, rx) = oneshot::channel();
    let outcome = state.reconciler.apply(event, Some(tx)).map_err(api_error)?;
    let answer = match outcome {
        Reconciled::PromptOpened(_) => Some(rx.await.map_err(|_| {
            (StatusCode::GONE, "prompt was dropped before an answer".to_string())
        })?),
        _ => None,
    };
    Ok(Json(PushResponse { outcome, answer }))
}

async fn pending_prompts(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<ChatId>,
) -> Json<Vec<PromptView>> {
    Json(state.reconciler.pending_prompts(chat_id))
}

async fn resolve_prompt(
    State(state): State<Arc<AppState>>,
    Path(prompt_id): Path<String>,
    Json(answer): Json<PromptAnswer>,
) -> Result<StatusCode, ApiError> {
    state
        .reconciler
        .resolve_prompt(&prompt_id, answer)
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Notices of the active chat as server-sent events.
async fn notices(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let rx = state.notifier.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(notice) => return Some((Event::default().json_data(&notice), rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "notice subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
