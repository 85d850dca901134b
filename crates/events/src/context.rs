//! Cancellation context passed through every pipeline call.

use tokio::sync::watch;

/// Cooperative cancellation signal.
///
/// Cloning a context shares the same signal. A context created with
/// [`Context::background`] is never cancelled.
#[derive(Debug, Clone)]
pub struct Context {
    cancelled: watch::Receiver<bool>,
}

/// Cancels the [`Context`] it was created with.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl Context {
    pub fn background() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { cancelled: rx }
    }

    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (Self { cancelled: rx }, CancelHandle { tx })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolves once the context is cancelled. Never resolves for a
    /// background context.
    pub async fn cancelled(&self) {
        let mut rx = self.cancelled.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}
