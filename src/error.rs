//! Error types for kafka-sync.
//!
//! # Error Handling Patterns
//!
//! Two patterns are used depending on where an error surfaces:
//!
//! ## Propagate
//!
//! Single operations (`Consumer::commit`, `Consumer::current_offset`,
//! `Producer::produce`, `Barrier::wait`) return [`SyncError`] to the caller.
//!
//! ## Log and Retry
//!
//! Long-running loops (the election loop, the consumer fetch loop and the
//! delayer running inside it) never give up. They log the error, sleep a fixed
//! backoff and start over from durable state:
//!
//! ```text
//! loop {
//!     match self.consume(&status).await {
//!         Ok(()) => return,
//!         Err(e) => {
//!             error!(error = %e, "Consumer loop failed, retrying");
//!             tokio::time::sleep(with_jitter(backoff)).await;
//!         }
//!     }
//! }
//! ```
//!
//! ## Distinguished Cases
//!
//! - [`SyncError::NoNode`] on an offset write is healed by creating the path
//!   and writing once more.
//! - [`SyncError::Stopped`] is control flow, not a failure: a handler returns
//!   it when leadership was lost mid-batch and nothing must be committed.

use thiserror::Error;

/// Result type for kafka-sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Boxed error returned by user batch handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while electing, consuming, producing or delaying.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The coordination path does not exist.
    #[error("Node {path} does not exist")]
    NoNode { path: String },

    /// The coordination path already exists.
    #[error("Node {path} already exists")]
    NodeExists { path: String },

    /// The node still has children and cannot be deleted.
    #[error("Node {path} has children")]
    NotEmpty { path: String },

    /// The coordination store session is gone or not yet established.
    #[error("Coordination store disconnected")]
    Disconnected,

    /// Any other coordination store failure.
    #[error("Coordination error: {0}")]
    Coordination(String),

    /// Fetch or produce failure in the log transport.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The user supplied batch handler failed.
    #[error("Handler error: {0}")]
    Handler(#[source] BoxError),

    /// The persisted offset is not a decimal integer.
    #[error("Invalid offset {value:?} at {path}")]
    InvalidOffset { path: String, value: String },

    /// A delay message could not be decoded as an envelope.
    #[error("Invalid delay envelope at offset {offset}: {reason}")]
    InvalidEnvelope { offset: i64, reason: String },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No topic is mapped for a record type.
    #[error("No topic mapped for record type {0}")]
    UnknownTopic(String),

    /// The producer pool was closed.
    #[error("Producer pool closed")]
    PoolClosed,

    /// Leadership changed while work was in progress.
    #[error("Stopped: leadership changed")]
    Stopped,
}

impl SyncError {
    /// Wrap an arbitrary handler error.
    pub fn handler<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        SyncError::Handler(error.into())
    }

    /// Check if this is the "path does not exist" case.
    #[inline]
    pub fn is_no_node(&self) -> bool {
        matches!(self, SyncError::NoNode { .. })
    }

    /// Check if this error signals a leadership change rather than a failure.
    #[inline]
    pub fn is_stopped(&self) -> bool {
        matches!(self, SyncError::Stopped)
    }

    /// Check if this error is retriable (transient infrastructure issue).
    ///
    /// Only bounded backon retries consult this. The long-running loops retry
    /// everything except [`SyncError::Stopped`].
    #[inline]
    pub fn is_retriable(&self) -> bool {
        match self {
            SyncError::Disconnected => true,
            SyncError::Coordination(_) => true,
            SyncError::Transport(_) => true,

            SyncError::NoNode { .. } => false,
            SyncError::NodeExists { .. } => false,
            SyncError::NotEmpty { .. } => false,
            SyncError::Handler(_) => false,
            SyncError::InvalidOffset { .. } => false,
            SyncError::InvalidEnvelope { .. } => false,
            SyncError::Serde(_) => false,
            SyncError::Config(_) => false,
            SyncError::UnknownTopic(_) => false,
            SyncError::PoolClosed => false,
            SyncError::Stopped => false,
        }
    }

    /// Returns a string label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            SyncError::NoNode { .. } => "no_node",
            SyncError::NodeExists { .. } => "node_exists",
            SyncError::NotEmpty { .. } => "not_empty",
            SyncError::Disconnected => "disconnected",
            SyncError::Coordination(_) => "coordination",
            SyncError::Transport(_) => "transport",
            SyncError::Handler(_) => "handler",
            SyncError::InvalidOffset { .. } => "invalid_offset",
            SyncError::InvalidEnvelope { .. } => "invalid_envelope",
            SyncError::Serde(_) => "serde",
            SyncError::Config(_) => "config",
            SyncError::UnknownTopic(_) => "unknown_topic",
            SyncError::PoolClosed => "pool_closed",
            SyncError::Stopped => "stopped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_node_detection() {
        let err = SyncError::NoNode {
            path: "/a/b".to_string(),
        };
        assert!(err.is_no_node());
        assert!(!err.is_retriable());
        assert!(!SyncError::Disconnected.is_no_node());
    }

    #[test]
    fn test_retriable_classification() {
        assert!(SyncError::Disconnected.is_retriable());
        assert!(SyncError::Transport("broker down".into()).is_retriable());
        assert!(SyncError::Coordination("session moved".into()).is_retriable());
        assert!(!SyncError::Stopped.is_retriable());
        assert!(!SyncError::Config("bad".into()).is_retriable());
    }

    #[test]
    fn test_handler_wraps_source() {
        let err = SyncError::handler("index unavailable");
        assert_eq!(err.to_string(), "Handler error: index unavailable");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_stopped_is_not_a_failure_label() {
        assert!(SyncError::Stopped.is_stopped());
        assert_eq!(SyncError::Stopped.as_metric_label(), "stopped");
    }

    #[test]
    fn test_serde_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: SyncError = parse.unwrap_err().into();
        assert!(matches!(err, SyncError::Serde(_)));
    }
}
