//! Retry policies and backoff helpers.
//!
//! Two kinds of retry live in this crate:
//!
//! - **Loop backoff**: the election loop and the consumer loop never give up.
//!   After a failure they sleep a fixed interval, spread by [`with_jitter`] so
//!   a fleet that lost its coordination store does not reconnect in lockstep.
//! - **Bounded retry**: short, idempotent operations (a producer flush, an
//!   offset read) are retried a few times with an exponential `backon` policy
//!   before the error reaches the caller.
//!
//! # Available Policies
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `transport_policy` | 100ms | 2s | 3 | Producer flushes |
//! | `coordination_policy` | 50ms | 1s | 3 | Offset reads in the barrier |
//!
//! # Example
//!
//! ```rust,no_run
//! use kafka_sync::retry;
//! use kafka_sync::SyncError;
//!
//! async fn example() -> kafka_sync::Result<u32> {
//!     retry::with_transport_policy(
//!         || async { Err::<u32, _>(SyncError::Transport("broker down".into())) },
//!         |e: &SyncError| e.is_retriable(),
//!     )
//!     .await
//! }
//! ```

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::metrics;

/// Spread a fixed interval by ±15%.
///
/// A 5 second backoff becomes anywhere from 4.25 to 5.75 seconds.
pub fn with_jitter(base: Duration) -> Duration {
    let factor = 0.85 + fastrand::f64() * 0.30;
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

/// Policy for log transport operations.
pub fn transport_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(3)
        .with_jitter()
}

/// Policy for coordination store reads.
pub fn coordination_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(3)
        .with_jitter()
}

/// Run `operation` under [`transport_policy`], retrying while `condition` holds.
pub async fn with_transport_policy<F, Fut, T, E, C>(operation: F, mut condition: C) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error,
    C: FnMut(&E) -> bool,
{
    operation
        .retry(transport_policy())
        .when(|e| {
            let retry = condition(e);
            if retry {
                record_retry("transport");
            }
            retry
        })
        .await
}

/// Run `operation` under [`coordination_policy`], retrying while `condition` holds.
pub async fn with_coordination_policy<F, Fut, T, E, C>(
    operation: F,
    mut condition: C,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error,
    C: FnMut(&E) -> bool,
{
    operation
        .retry(coordination_policy())
        .when(|e| {
            let retry = condition(e);
            if retry {
                record_retry("coordination");
            }
            retry
        })
        .await
}

fn record_retry(policy: &str) {
    metrics::RETRY_ATTEMPTS.with_label_values(&[policy]).inc();
    tracing::debug!(policy, "Retrying operation");
}
