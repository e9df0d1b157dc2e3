//! Cooperative stop flag handed to role bodies.
//!
//! Every role transition of a [`LeaderElection`](crate::election::LeaderElection)
//! stops the previous token and creates a fresh one for the newly started body.
//! Bodies poll [`StatusToken::is_stopping`] between work units and may race
//! blocking waits against [`StatusToken::stopped`].
//!
//! # Example
//!
//! ```rust,no_run
//! use kafka_sync::status::StatusToken;
//!
//! async fn work(status: StatusToken) {
//!     while !status.is_stopping() {
//!         tokio::select! {
//!             _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
//!             _ = status.stopped() => break,
//!         }
//!     }
//! }
//! ```

use std::sync::Arc;

use tokio::sync::watch;

/// One-shot stop flag shared between an election and one role-body invocation.
///
/// Clones observe the same flag. Stopping is idempotent and irreversible.
#[derive(Debug, Clone)]
pub struct StatusToken {
    stopping: Arc<watch::Sender<bool>>,
}

impl Default for StatusToken {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusToken {
    /// Create a token that is not stopping.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            stopping: Arc::new(tx),
        }
    }

    /// Signal the role body to wind down.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn stop(&self) -> bool {
        !self.stopping.send_replace(true)
    }

    /// Check whether the role body should exit.
    #[inline]
    pub fn is_stopping(&self) -> bool {
        *self.stopping.borrow()
    }

    /// Resolve once the token is stopped.
    ///
    /// Resolves immediately if it already is.
    pub async fn stopped(&self) {
        let mut rx = self.stopping.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|stopping| *stopping).await;
    }

    /// Check whether two tokens belong to the same generation.
    pub fn same_generation(&self, other: &StatusToken) -> bool {
        Arc::ptr_eq(&self.stopping, &other.stopping)
    }
}
