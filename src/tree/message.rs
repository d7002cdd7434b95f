//! Message node model.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::ids::MessageId;

/// Author role of a message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// User prompt.
    User,
    /// Model response.
    Assistant,
    /// System instruction.
    System,
}

impl Role {
    /// Stable string form used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            _ => Err(value.to_string()),
        }
    }
}

/// Progress status of a message.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Waiting for the first token.
    Thinking,
    /// Tokens are arriving.
    Streaming,
    /// A tool/function call is running.
    Function,
    /// Finished (possibly with an error annotation).
    #[default]
    Done,
    /// Legacy failure marker found in older chat documents.
    Error,
}

/// Error annotation attached to a finished message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageError {
    /// Human-readable error text.
    pub content: String,
    /// Optional status-like code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

impl MessageError {
    /// Build an annotation without a code.
    #[must_use]
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            code: None,
        }
    }
}

/// One entry of a message's status history.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    /// Machine-readable action name (e.g. `knowledge_search`, `web_search`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Display text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the step has completed.
    #[serde(default)]
    pub done: bool,
    /// Any additional fields sent by the server.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Status action that marks an in-progress knowledge lookup.
pub const KNOWLEDGE_SEARCH_ACTION: &str = "knowledge_search";

impl StatusEntry {
    /// Seed entry for a pending knowledge lookup.
    #[must_use]
    pub fn knowledge_search(query: &str) -> Self {
        Self {
            action: Some(KNOWLEDGE_SEARCH_ACTION.to_string()),
            description: Some(format!("Searching Knowledge for \"{query}\"")),
            done: false,
            extra: Map::new(),
        }
    }

    /// Whether this entry tracks an in-progress lookup that must not outlive the stream.
    #[must_use]
    pub fn is_knowledge_search(&self) -> bool {
        self.action.as_deref() == Some(KNOWLEDGE_SEARCH_ACTION)
    }
}

/// A code execution record, upserted by its `id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CodeExecution {
    /// Execution identifier.
    pub id: String,
    /// Remaining payload (code, language, result...).
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Final usage/timing metadata reported by a backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationInfo {
    /// Total request duration (ns).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<u64>,
    /// Model load duration (ns).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_duration: Option<u64>,
    /// Sample count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_count: Option<u64>,
    /// Sampling duration (ns).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_duration: Option<u64>,
    /// Prompt token count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<u64>,
    /// Prompt evaluation duration (ns).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_duration: Option<u64>,
    /// Generated token count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<u64>,
    /// Generation duration (ns).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_duration: Option<u64>,
    /// OpenAI-style usage block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
    /// Set when the metadata came from an OpenAI-compatible backend.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub openai: bool,
}

/// A node of the conversation tree.
///
/// Link fields are only mutated through [`crate::tree::History`], which keeps
/// `parent_id` and the parent's `children_ids` consistent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub(crate) id: MessageId,
    #[serde(default)]
    pub(crate) parent_id: Option<MessageId>,
    #[serde(default)]
    pub(crate) children_ids: Vec<MessageId>,
    /// Author role.
    pub role: Role,
    /// Accumulated text.
    #[serde(default)]
    pub content: String,
    /// Progress status.
    #[serde(default)]
    pub status: MessageStatus,
    /// Whether the message is finished.
    #[serde(default)]
    pub done: bool,
    /// Creation time (unix seconds).
    #[serde(default)]
    pub timestamp: i64,
    /// Model id that produced (or will produce) this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Display name of the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    /// Index of the model in the chat's selection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_idx: Option<usize>,
    /// Citations attached to the message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Value>,
    /// Code execution records.
    #[serde(default, rename = "code_executions", skip_serializing_if = "Vec::is_empty")]
    pub code_executions: Vec<CodeExecution>,
    /// Status updates pushed while generating.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status_history: Vec<StatusEntry>,
    /// Error annotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MessageError>,
    /// Final generation metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<GenerationInfo>,
    /// Underlying model chosen by an arena backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_model_id: Option<String>,
    /// Whether the response came from an arena model.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub arena: bool,
    /// Newest complete sentence already dispatched as a notice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sentence: Option<String>,
    /// Files attached to the message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<Value>,
}

impl Message {
    fn detached(role: Role, content: String) -> Self {
        Self {
            id: MessageId::new(),
            parent_id: None,
            children_ids: Vec::new(),
            role,
            content,
            status: MessageStatus::Done,
            done: true,
            timestamp: Utc::now().timestamp(),
            model: None,
            model_name: None,
            model_idx: None,
            sources: Vec::new(),
            code_executions: Vec::new(),
            status_history: Vec::new(),
            error: None,
            info: None,
            selected_model_id: None,
            arena: false,
            last_sentence: None,
            files: Vec::new(),
        }
    }

    /// A finished, unlinked user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::detached(Role::User, content.into())
    }

    /// A finished, unlinked system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::detached(Role::System, content.into())
    }

    /// An unlinked assistant placeholder waiting for its first token.
    #[must_use]
    pub fn assistant_placeholder(model_id: impl Into<String>) -> Self {
        let mut message = Self::detached(Role::Assistant, String::new());
        message.model = Some(model_id.into());
        message.status = MessageStatus::Thinking;
        message.done = false;
        message
    }

    /// Message identifier.
    #[must_use]
    pub const fn id(&self) -> MessageId {
        self.id
    }

    /// Parent identifier (`None` for a root).
    #[must_use]
    pub const fn parent_id(&self) -> Option<MessageId> {
        self.parent_id
    }

    /// Ordered child identifiers.
    #[must_use]
    pub fn children_ids(&self) -> &[MessageId] {
        &self.children_ids
    }

    /// Drop status entries tracking in-progress lookups.
    pub fn prune_pending_lookups(&mut self) {
        self.status_history.retain(|entry| !entry.is_knowledge_search());
    }

    /// Upsert a code execution record by id.
    pub fn upsert_code_execution(&mut self, execution: CodeExecution) {
        if let Some(existing) = self
            .code_executions
            .iter_mut()
            .find(|item| item.id == execution.id)
        {
            *existing = execution;
        } else {
            self.code_executions.push(execution);
        }
    }
}
