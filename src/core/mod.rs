//! Core configuration, error and identifier types.

pub mod config;
pub mod errors;
pub mod ids;

pub use config::{
    BackendConfig, EngineConfig, GenerationConfig, ServerConfig, StorageConfig, TimeoutConfig,
};
pub use errors::{EngineError, EngineResult, TreeError, TreeResult};
pub use ids::{ChatId, MessageId};
