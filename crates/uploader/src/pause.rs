//! Cooperative pause control for a running job.
//!
//! The job checks the token only at suspension points (between items and
//! between chunks), never inside a chunk transfer.

use std::sync::Arc;

use tokio::sync::watch;

/// Cloneable pause switch shared between a job and its controller.
#[derive(Debug, Clone)]
pub struct PauseToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for PauseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseToken {
    /// Creates a token in the running (not paused) state.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn pause(&self) {
        self.tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.tx.send_replace(false);
    }

    /// Flips the state and returns true if the job is now paused.
    pub fn toggle(&self) -> bool {
        let mut paused = false;
        self.tx.send_modify(|state| {
            *state = !*state;
            paused = *state;
        });
        paused
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns immediately when running, otherwise waits for `resume`.
    pub async fn wait_until_resumed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close while waiting
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}
