//! Per-run stop signal.

use std::sync::Arc;

use tokio::sync::watch;

/// A stop flag shared by every session of one fan-out run.
///
/// Raising it wakes all waiters at once; sessions also poll it before each
/// decoded event.
#[derive(Clone, Debug)]
pub struct CancellationFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancellationFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationFlag {
    /// A lowered flag.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Ask every running session to stop.
    pub fn raise(&self) {
        self.tx.send_replace(true);
    }

    /// Current value.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the flag is raised.
    pub async fn raised(&self) {
        let mut rx = self.tx.subscribe();
        if rx.wait_for(|raised| *raised).await.is_err() {
            // sender lives as long as self
            std::future::pending::<()>().await;
        }
    }
}
