//! Configuration for the chat engine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::backend::models::{ModelInfo, Provider};
use crate::core::errors::{EngineError, EngineResult};
use crate::stream::sentences::SplitPolicy;

/// Environment variable pointing to an optional JSON config file.
pub const CONFIG_PATH_ENV: &str = "CHAT_ENGINE_CONFIG";
/// Environment override for the Ollama base URL.
pub const OLLAMA_URL_ENV: &str = "CHAT_ENGINE_OLLAMA_URL";
/// Environment override for the OpenAI-compatible base URL.
pub const OPENAI_URL_ENV: &str = "CHAT_ENGINE_OPENAI_URL";
/// Environment override for the OpenAI-compatible API key.
pub const OPENAI_KEY_ENV: &str = "CHAT_ENGINE_OPENAI_KEY";
/// Environment override for the HTTP port.
pub const PORT_ENV: &str = "CHAT_ENGINE_PORT";
/// Environment override for the chat storage directory.
pub const CHATS_DIR_ENV: &str = "CHAT_ENGINE_CHATS_DIR";

/// Top-level configuration for the engine.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Backend endpoints.
    pub backends: BackendConfig,
    /// Models that can be selected for a chat.
    pub models: Vec<ModelInfo>,
    /// Network timeouts.
    pub timeouts: TimeoutConfig,
    /// Generation and post-completion settings.
    pub generation: GenerationConfig,
    /// Chat persistence settings.
    pub storage: StorageConfig,
    /// HTTP server settings.
    pub server: ServerConfig,
}

impl EngineConfig {
    /// Load configuration from `CHAT_ENGINE_CONFIG` (if set) and apply env overrides.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or validation fails.
    pub fn load() -> EngineResult<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(OLLAMA_URL_ENV) {
            self.backends.ollama_base_url = url;
        }
        if let Ok(url) = std::env::var(OPENAI_URL_ENV) {
            self.backends.openai_base_url = url;
        }
        if let Ok(key) = std::env::var(OPENAI_KEY_ENV) {
            self.backends.openai_api_key = Some(key);
        }
        if let Some(port) = std::env::var(PORT_ENV).ok().and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Ok(dir) = std::env::var(CHATS_DIR_ENV) {
            self.storage.chats_dir = Some(PathBuf::from(dir));
        }
    }

    /// Validate configuration invariants.
    ///
    /// # Errors
    /// Returns an error if any values are out of range or invalid.
    pub fn validate(&self) -> EngineResult<()> {
        Url::parse(&self.backends.ollama_base_url)?;
        Url::parse(&self.backends.openai_base_url)?;

        if self.timeouts.connect_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "timeouts.connect_ms must be > 0".to_string(),
            ));
        }
        if self.timeouts.response_headers_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "timeouts.response_headers_ms must be > 0".to_string(),
            ));
        }
        if self.timeouts.chunk_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "timeouts.chunk_ms must be > 0".to_string(),
            ));
        }
        if self.generation.notice_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "generation.notice_capacity must be > 0".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for model in &self.models {
            if model.id.trim().is_empty() {
                return Err(EngineError::InvalidConfig("model id must not be empty".to_string()));
            }
            if !seen.insert(model.id.as_str()) {
                return Err(EngineError::InvalidConfig(format!(
                    "duplicate model id: {}",
                    model.id
                )));
            }
        }

        Ok(())
    }

    /// Look up a configured model.
    #[must_use]
    pub fn model(&self, id: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|m| m.id == id)
    }
}

/// Backend endpoint settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the Ollama API.
    pub ollama_base_url: String,
    /// Base URL of the OpenAI-compatible API (including `/v1` if needed).
    pub openai_base_url: String,
    /// Optional bearer token for the OpenAI-compatible API.
    pub openai_api_key: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            ollama_base_url: "http://127.0.0.1:11434".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_api_key: None,
        }
    }
}

/// Network timeout settings, in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// TCP/TLS connect timeout.
    pub connect_ms: u64,
    /// Maximum wait for response headers.
    pub response_headers_ms: u64,
    /// Maximum wait between two body chunks.
    pub chunk_ms: u64,
}

impl TimeoutConfig {
    /// Connect timeout as a `Duration`.
    #[must_use]
    pub const fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    /// Response header timeout as a `Duration`.
    #[must_use]
    pub const fn response_headers(&self) -> Duration {
        Duration::from_millis(self.response_headers_ms)
    }

    /// Per-chunk read timeout as a `Duration`.
    #[must_use]
    pub const fn chunk(&self) -> Duration {
        Duration::from_millis(self.chunk_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 5_000,
            response_headers_ms: 60_000,
            chunk_ms: 120_000,
        }
    }
}

/// Generation settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// How streamed content is split into sentence notices.
    pub split_on: SplitPolicy,
    /// Generate a title after the first exchange.
    pub auto_title: bool,
    /// Generate tags after the first exchange.
    pub auto_tags: bool,
    /// Default system prompt when the chat has none.
    pub system: Option<String>,
    /// Capacity of the notice broadcast channel.
    pub notice_capacity: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            split_on: SplitPolicy::Punctuation,
            auto_title: true,
            auto_tags: true,
            system: None,
            notice_capacity: 256,
        }
    }
}

/// Chat persistence settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for JSON chat documents; in-memory storage when `None`.
    pub chats_dir: Option<PathBuf>,
}

/// HTTP server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listening port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 3000 }
    }
}

/// Convenience for tests and small setups: one Ollama model.
#[must_use]
pub fn single_ollama_model(id: &str) -> EngineConfig {
    EngineConfig {
        models: vec![ModelInfo::new(id, Provider::Ollama)],
        ..EngineConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_chunk_timeout_is_rejected() {
        let mut config = EngineConfig::default();
        config.timeouts.chunk_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn duplicate_models_are_rejected() {
        let mut config = single_ollama_model("llama3");
        config.models.push(ModelInfo::new("llama3", Provider::OpenAi));
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_url_is_rejected() {
        let mut config = EngineConfig::default();
        config.backends.ollama_base_url = "not a url".to_string();
        assert!(matches!(config.validate(), Err(EngineError::Url(_))));
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"generation": {"auto_tags": false}}"#).unwrap();
        assert!(!config.generation.auto_tags);
        assert!(config.generation.auto_title);
        assert_eq!(config.timeouts.chunk_ms, 120_000);
    }
}
