//! Provider request shapes and request-context assembly.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use crate::backend::models::{ModelInfo, Provider};
use crate::core::errors::TreeResult;
use crate::core::ids::{ChatId, MessageId};
use crate::tree::history::History;
use crate::tree::message::{Message, Role};

/// Per-chat generation parameters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatParams {
    /// System prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Nucleus sampling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Sampling seed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Comma separated stop sequences; JSON escapes such as `\n` are honoured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<String>,
    /// Maximum generated tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Repetition penalty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    /// Stream the response (default true).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_response: Option<bool>,
    /// How long Ollama keeps the model loaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<String>,
    /// Ollama structured output format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<Value>,
}

impl ChatParams {
    /// Whether the backend should stream.
    #[must_use]
    pub fn stream(&self) -> bool {
        self.stream_response.unwrap_or(true)
    }

    /// Parsed stop sequences.
    #[must_use]
    pub fn stop_sequences(&self) -> Option<Vec<String>> {
        let raw = self.stop.as_deref()?;
        let tokens: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(unescape_token)
            .collect();
        (!tokens.is_empty()).then_some(tokens)
    }
}

fn unescape_token(token: &str) -> String {
    let quoted = format!("\"{}\"", token.replace('"', "\\\""));
    serde_json::from_str(&quoted).unwrap_or_else(|_| token.to_string())
}

/// One message of the request context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Author role.
    pub role: Role,
    /// Message text.
    pub content: String,
    /// Base64 image payloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

/// A provider-neutral completion request.
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    /// Target model.
    pub model: ModelInfo,
    /// Context, oldest first.
    pub messages: Vec<RequestMessage>,
    /// Generation parameters.
    pub params: ChatParams,
    /// Files forwarded to the backend.
    pub files: Vec<Value>,
    /// Tools enabled for this prompt.
    pub tool_ids: Vec<String>,
    /// Web search requested for this prompt.
    pub web_search: bool,
    /// Owning chat, echoed back by server-side push events.
    pub chat_id: ChatId,
    /// Response message being generated.
    pub message_id: MessageId,
}

impl CompletionRequest {
    /// Serialise the request for the model's provider.
    ///
    /// # Errors
    /// Returns an error if the body cannot be serialised.
    pub fn body(&self) -> Result<Value, serde_json::Error> {
        match self.model.provider {
            Provider::Ollama => serde_json::to_value(OllamaChatRequest::from(self)),
            Provider::OpenAi => serde_json::to_value(OpenAiChatRequest::from(self)),
        }
    }
}

/// Ollama `/api/chat` body.
#[derive(Debug, Serialize)]
pub struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [RequestMessage],
    stream: bool,
    options: OllamaOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_ids: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<&'a [Value]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    features: Option<Value>,
    chat_id: ChatId,
    id: MessageId,
}

#[derive(Debug, Default, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repeat_penalty: Option<f64>,
}

impl<'a> From<&'a CompletionRequest> for OllamaChatRequest<'a> {
    fn from(request: &'a CompletionRequest) -> Self {
        let params = &request.params;
        Self {
            model: &request.model.id,
            messages: &request.messages,
            stream: params.stream(),
            options: OllamaOptions {
                temperature: params.temperature,
                top_p: params.top_p,
                seed: params.seed,
                stop: params.stop_sequences(),
                num_predict: params.max_tokens,
                repeat_penalty: params.frequency_penalty,
            },
            format: params.format.as_ref(),
            keep_alive: params.keep_alive.as_deref(),
            tool_ids: non_empty(&request.tool_ids),
            files: non_empty(&request.files),
            features: features(request.web_search),
            chat_id: request.chat_id,
            id: request.message_id,
        }
    }
}

/// OpenAI-compatible `/chat/completions` body.
#[derive(Debug, Serialize)]
pub struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: &'a [RequestMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_ids: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<&'a [Value]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    features: Option<Value>,
    chat_id: ChatId,
    id: MessageId,
}

impl<'a> From<&'a CompletionRequest> for OpenAiChatRequest<'a> {
    fn from(request: &'a CompletionRequest) -> Self {
        let params = &request.params;
        let stream = params.stream();
        Self {
            model: &request.model.id,
            messages: &request.messages,
            stream,
            stream_options: (stream && request.model.usage).then(|| json!({"include_usage": true})),
            seed: params.seed,
            stop: params.stop_sequences(),
            temperature: params.temperature,
            top_p: params.top_p,
            frequency_penalty: params.frequency_penalty,
            max_tokens: params.max_tokens,
            tool_ids: non_empty(&request.tool_ids),
            files: non_empty(&request.files),
            features: features(request.web_search),
            chat_id: request.chat_id,
            id: request.message_id,
        }
    }
}

fn non_empty<T>(items: &[T]) -> Option<&[T]> {
    (!items.is_empty()).then_some(items)
}

fn features(web_search: bool) -> Option<Value> {
    web_search.then(|| json!({"web_search": true}))
}

/// Build the request context for `response_id`.
///
/// The optional system prompt comes first, followed by the branch from the
/// root down to the response. Messages with blank content are dropped, and
/// images are only kept on the last user message that carries any.
///
/// # Errors
/// Returns an error if the branch cannot be walked.
pub fn build_context(
    history: &History,
    response_id: MessageId,
    system: Option<&str>,
) -> TreeResult<Vec<RequestMessage>> {
    let system = system
        .filter(|prompt| !prompt.trim().is_empty())
        .map(|prompt| RequestMessage {
            role: Role::System,
            content: prompt.to_string(),
            images: None,
        });

    let mut messages: Vec<RequestMessage> = system
        .into_iter()
        .chain(
            history
                .path_to_root(response_id)?
                .into_iter()
                .filter(|message| !message.content.trim().is_empty())
                .map(request_message),
        )
        .collect();

    let last_with_images = messages.iter().rposition(|m| m.images.is_some());
    for (index, message) in messages.iter_mut().enumerate() {
        if Some(index) != last_with_images {
            message.images = None;
        }
    }
    Ok(messages)
}

fn request_message(message: &Message) -> RequestMessage {
    let images: Vec<String> = if message.role == Role::User {
        message
            .files
            .iter()
            .filter(|file| file_type(file) == Some("image"))
            .filter_map(|file| file.get("url").and_then(Value::as_str))
            .map(|url| url.split_once(',').map_or(url, |(_, data)| data).to_string())
            .collect()
    } else {
        Vec::new()
    };
    RequestMessage {
        role: message.role,
        content: message.content.clone(),
        images: (!images.is_empty()).then_some(images),
    }
}

fn file_type(file: &Value) -> Option<&str> {
    file.get("type").and_then(Value::as_str)
}

/// Files forwarded with a request: chat files, the prompt's document files and
/// the response's web search results, without duplicates.
#[must_use]
pub fn collect_files(chat_files: &[Value], user: Option<&Message>, response: Option<&Message>) -> Vec<Value> {
    let user_files = user
        .map(|m| m.files.as_slice())
        .unwrap_or_default()
        .iter()
        .filter(|file| matches!(file_type(file), Some("doc" | "file" | "collection")));
    let response_files = response
        .map(|m| m.files.as_slice())
        .unwrap_or_default()
        .iter()
        .filter(|file| file_type(file) == Some("web_search_results"));

    let mut seen = HashSet::new();
    chat_files
        .iter()
        .chain(user_files)
        .chain(response_files)
        .filter(|file| seen.insert(file.to_string()))
        .cloned()
        .collect()
}

/// Whether any message of the context carries images.
#[must_use]
pub fn has_images(messages: &[RequestMessage]) -> bool {
    messages.iter().any(|m| m.images.is_some())
}

/// Warn when images are sent to a model that does not accept them.
pub fn check_vision(model: &ModelInfo, messages: &[RequestMessage]) {
    if has_images(messages) && !model.vision {
        warn!(model = %model.id, "model is not vision capable; images may be ignored");
    }
}
