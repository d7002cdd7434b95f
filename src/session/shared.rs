//! History shared between the sessions and the reconciler of one chat.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::errors::{TreeError, TreeResult};
use crate::core::ids::MessageId;
use crate::tree::history::History;
use crate::tree::message::Message;

/// History behind a lock; every read-modify-write happens in one critical section.
#[derive(Clone, Debug, Default)]
pub struct SharedHistory {
    inner: Arc<Mutex<History>>,
}

impl SharedHistory {
    /// Share `history`.
    #[must_use]
    pub fn new(history: History) -> Self {
        Self {
            inner: Arc::new(Mutex::new(history)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, History> {
        // a panicking writer leaves the last applied edit in place
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with shared access.
    #[must_use]
    pub fn read<R>(&self, f: impl FnOnce(&History) -> R) -> R {
        f(&self.lock())
    }

    /// Run `f` with exclusive access.
    pub fn write<R>(&self, f: impl FnOnce(&mut History) -> R) -> R {
        f(&mut self.lock())
    }

    /// Atomically update one message.
    ///
    /// # Errors
    /// Returns `MessageNotFound` if the message was deleted.
    pub fn update_message<R>(
        &self,
        message_id: MessageId,
        f: impl FnOnce(&mut Message) -> R,
    ) -> TreeResult<R> {
        let mut history = self.lock();
        let message = history
            .get_mut(message_id)
            .ok_or(TreeError::MessageNotFound(message_id))?;
        Ok(f(message))
    }

    /// Copy of one message.
    #[must_use]
    pub fn message(&self, message_id: MessageId) -> Option<Message> {
        self.lock().get(message_id).cloned()
    }

    /// Copy of the whole history.
    #[must_use]
    pub fn snapshot(&self) -> History {
        self.lock().clone()
    }

    /// Replace the whole history.
    pub fn replace(&self, history: History) {
        *self.lock() = history;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_missing_message_fails() {
        let shared = SharedHistory::default();
        let missing = MessageId::new();
        assert_eq!(
            shared.update_message(missing, |_| ()),
            Err(TreeError::MessageNotFound(missing))
        );
    }

    #[test]
    fn concurrent_appends_to_one_message_all_land() {
        let shared = SharedHistory::default();
        let id = shared
            .write(|h| h.append_response_placeholder(None, "m"))
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        shared.update_message(id, |m| m.content.push('x')).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(shared.message(id).unwrap().content.len(), 400);
    }
}
