//! Cooperative cancellation for runs and their stage subprocesses.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// A token for cooperative run cancellation.
///
/// Cancellation is idempotent: only the first reason is kept. The stage
/// runner awaits [`CancelToken::cancelled`] alongside the child process so
/// a cancelled run's subprocess is terminated promptly.
pub struct CancelToken {
    cancelled: AtomicBool,
    reason: RwLock<Option<String>>,
    tx: watch::Sender<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Creates a new, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            cancelled: AtomicBool::new(false),
            reason: RwLock::new(None),
            tx,
        }
    }

    /// Requests cancellation with a reason. First reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.reason.write() = Some(reason.into());
            let _ = self.tx.send(true);
        }
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Waits until cancellation is requested.
    ///
    /// Returns immediately if the token is already cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // Sender lives on self, so the channel only closes when the token
        // is dropped; there is nothing left to wait for then.
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_token_default_not_cancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());
    }

    #[test]
    fn test_cancel_sets_reason() {
        let token = CancelToken::new();
        token.cancel("superseded");
        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some("superseded".to_string()));
    }

    #[test]
    fn test_cancel_idempotent_first_reason_wins() {
        let token = CancelToken::new();
        token.cancel("first");
        token.cancel("second");
        assert_eq!(token.reason(), Some("first".to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel("done");
        // Must not hang.
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = Arc::new(CancelToken::new());
        let waiter = {
            let token = Arc::clone(&token);
            tokio::spawn(async move {
                token.cancelled().await;
                token.reason()
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel("external abort");

        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, Some("external abort".to_string()));
    }
}
