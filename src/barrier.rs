//! Wait for a consumer to catch up.
//!
//! [`Barrier::wait`] snapshots the newest offset of a topic partition and
//! polls a named consumer's committed offset until it has moved past that
//! snapshot. Useful in tests and deploy scripts that must not continue until
//! everything published so far was processed.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::constants::{DEFAULT_BARRIER_POLL_INTERVAL, DEFAULT_BARRIER_TIMEOUT};
use crate::consumer::{Consumer, ConsumerOptions};
use crate::context::SyncContext;
use crate::error::{Result, SyncError};
use crate::retry;

/// Consumer to wait for, and how long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierOptions {
    pub topic: String,
    pub name: String,
    pub partition: i32,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl BarrierOptions {
    pub fn new(topic: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            name: name.into(),
            partition: 0,
            poll_interval: DEFAULT_BARRIER_POLL_INTERVAL,
            timeout: DEFAULT_BARRIER_TIMEOUT,
        }
    }

    pub fn partition(mut self, partition: i32) -> Self {
        self.partition = partition;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Barrier {
    ctx: SyncContext,
}

impl Barrier {
    pub fn new(ctx: &SyncContext) -> Self {
        Self { ctx: ctx.clone() }
    }

    /// Wait until the consumer committed past the current end of the partition.
    ///
    /// Returns `false` if `timeout` passed first.
    pub async fn wait(&self, options: BarrierOptions) -> Result<bool> {
        let last_offset = retry::with_transport_policy(
            || {
                self.ctx
                    .transport()
                    .last_offset_for(&options.topic, options.partition)
            },
            SyncError::is_retriable,
        )
        .await?;

        let consumer = Consumer::new(
            &self.ctx,
            ConsumerOptions::new(options.topic.clone(), options.name.clone())
                .partition(options.partition),
        );
        let started = Instant::now();

        loop {
            let committed = retry::with_coordination_policy(
                || consumer.current_offset(),
                SyncError::is_retriable,
            )
            .await?;

            if committed.is_some_and(|offset| offset > last_offset) {
                return Ok(true);
            }

            if started.elapsed() > options.timeout {
                debug!(
                    topic = %options.topic,
                    name = %options.name,
                    last_offset,
                    ?committed,
                    "Barrier timed out"
                );
                return Ok(false);
            }

            tokio::time::sleep(options.poll_interval).await;
        }
    }
}
