//! Cooperative cancellation tokens
//!
//! Every public asynchronous operation accepts a token with an optional
//! deadline. Cancellation is cooperative: ongoing work observes the token at
//! its next suspension point. In-flight deliveries that observe a cancelled
//! token are marked cancelled, not retried.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
struct Shared {
    cancelled: AtomicBool,
    notify: Notify,
    deadline: Option<Instant>,
}

/// Clonable cancellation handle with an optional deadline
#[derive(Debug, Clone)]
pub struct CancellationToken {
    shared: Arc<Shared>,
}

impl CancellationToken {
    /// A token that never cancels
    #[must_use]
    pub fn never() -> Self {
        Self::with_deadline(None)
    }

    /// A token that cancels after the given duration
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Some(Instant::now() + timeout))
    }

    fn with_deadline(deadline: Option<Instant>) -> Self {
        Self {
            shared: Arc::new(Shared {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                deadline,
            }),
        }
    }

    /// Requests cancellation; observers see it at their next check
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    /// Whether cancellation was requested or the deadline passed
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        if self.shared.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        match self.shared.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Resolves when the token cancels; pending forever on a never-token
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            match self.shared.deadline {
                Some(deadline) => {
                    tokio::select! {
                        () = self.shared.notify.notified() => {}
                        () = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => self.shared.notify.notified().await,
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::never()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn explicit_cancel_is_observed() {
        let token = CancellationToken::never();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        token.cancelled().await;
    }

    #[tokio::test]
    async fn deadline_cancels() {
        let token = CancellationToken::with_timeout(Duration::from_millis(10));
        assert!(!token.is_cancelled());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let token = CancellationToken::never();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
