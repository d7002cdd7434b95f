//! Completion sessions and the state they share.

pub mod cancel;
pub mod completion;
pub mod notify;
pub mod shared;

pub use cancel::CancellationFlag;
pub use completion::{
    CompletionSession, NO_CONTENT_TEXT, SessionInput, SessionOutcome, SessionRuntime, SessionState,
};
pub use notify::{EngineNotice, Notifier};
pub use shared::SharedHistory;
