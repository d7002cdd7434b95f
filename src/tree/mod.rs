//! Conversation tree: message nodes, branching history and persisted form.

pub mod history;
pub mod message;
pub mod persisted;

pub use history::History;
pub use message::{
    CodeExecution, GenerationInfo, Message, MessageError, MessageStatus, Role, StatusEntry,
};
pub use persisted::{PersistedChat, history_from_flat};
