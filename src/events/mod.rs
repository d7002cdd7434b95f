//! Server-pushed events for in-flight responses.

pub mod push;
pub mod reconciler;

pub use push::{PromptPayload, PushEvent, PushKind};
pub use reconciler::{EventReconciler, PromptAnswer, PromptKind, PromptView, Reconciled};
