//! Multi-model fan-out: chat aggregate, coordinator and outbound services.

pub mod chat;
pub mod coordinator;
pub mod services;

pub use chat::{ChatMeta, ChatRegistry, ChatSession, DEFAULT_TITLE};
pub use coordinator::{FanoutCoordinator, FanoutRun, Prompt, RunReport};
pub use services::{
    BackendTitleGenerator, ChatPersistence, InMemoryChatStore, JsonFileChatStore, ServiceFuture,
    TitleGenerator,
};
