//! Model catalogue entries.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::stream::Dialect;

/// Backend family serving a model.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Ollama `/api/chat`.
    Ollama,
    /// OpenAI-compatible `/chat/completions`.
    #[serde(alias = "openai")]
    OpenAi,
}

impl Provider {
    /// Stream dialect spoken by this provider.
    #[must_use]
    pub const fn dialect(self) -> Dialect {
        match self {
            Self::Ollama => Dialect::Ndjson,
            Self::OpenAi => Dialect::Sse,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ollama => write!(f, "Ollama"),
            Self::OpenAi => write!(f, "OpenAI"),
        }
    }
}

/// A selectable model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Identifier sent to the backend.
    pub id: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Serving backend.
    pub provider: Provider,
    /// Attached knowledge collections are searched before answering.
    #[serde(default)]
    pub knowledge: bool,
    /// Backend reports token usage when asked.
    #[serde(default)]
    pub usage: bool,
    /// Accepts image input.
    #[serde(default)]
    pub vision: bool,
}

impl ModelInfo {
    /// Minimal entry with every capability off.
    #[must_use]
    pub fn new(id: impl Into<String>, provider: Provider) -> Self {
        Self {
            id: id.into(),
            name: None,
            provider,
            knowledge: false,
            usage: false,
            vision: false,
        }
    }

    /// Display name, falling back to the id.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Text shown when the backend cannot be reached.
    #[must_use]
    pub fn connection_error_text(&self) -> String {
        let provider = match self.provider {
            Provider::Ollama => Provider::Ollama.to_string(),
            Provider::OpenAi => self.display_name().to_string(),
        };
        format!("Uh-oh! There was an issue connecting to {provider}.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parses_both_spellings() {
        let a: Provider = serde_json::from_str("\"open_ai\"").unwrap();
        let b: Provider = serde_json::from_str("\"openai\"").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.dialect(), Dialect::Sse);
    }

    #[test]
    fn connection_error_names_provider() {
        let ollama = ModelInfo::new("llama3", Provider::Ollama);
        assert_eq!(
            ollama.connection_error_text(),
            "Uh-oh! There was an issue connecting to Ollama."
        );
        let mut gpt = ModelInfo::new("gpt-4o", Provider::OpenAi);
        gpt.name = Some("GPT-4o".into());
        assert!(gpt.connection_error_text().ends_with("GPT-4o."));
    }
}
