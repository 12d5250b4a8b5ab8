//! Process-wide cancellation token shared by the dispatcher loops

use tokio::sync::watch;

/// Cloneable shutdown signal. Triggering it is idempotent.
#[derive(Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Request shutdown
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Checked by loops at each iteration
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been requested
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // Err means every sender is gone, which can only happen while
        // dropping the token itself
        let _ = rx.wait_for(|stop| *stop).await;
    }
}
