//! Cancellation signal shared between the caller, the orchestrator, and launchers
//!
//! Built on a `tokio::sync::watch` channel so every clone observes the same flag
//! and can await it at a suspension point.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable, one-way cancellation flag
#[derive(Debug, Clone)]
pub struct CancellationToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancellationToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Raise the flag; every clone observes it
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the flag has been raised
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the flag is raised
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of the token, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
