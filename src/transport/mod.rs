//! Partitioned log transport abstraction.
//!
//! Consumers fetch from the log through [`LogTransport`]; producers append
//! through [`LogProducer`] connections checked out of a
//! [`Producer`](crate::producer::Producer) pool.
//!
//! [`MemoryLog`] implements both sides in process. Production deployments
//! wrap their Kafka client in these traits.

pub mod memory;
mod message;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub use memory::{MemoryLog, MemoryProducer};
pub use message::ConsumedMessage;

/// Where a fetch starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOffset {
    /// The oldest retained message.
    Earliest,
    /// A specific offset.
    At(i64),
}

impl FetchOffset {
    /// Start at the committed offset, or at the beginning if nothing was committed.
    pub fn from_committed(committed: Option<i64>) -> Self {
        committed.map_or(FetchOffset::Earliest, FetchOffset::At)
    }
}

/// Read side of the partitioned log.
#[async_trait]
pub trait LogTransport: Send + Sync {
    /// Fetch up to `max_messages` messages starting at `offset`.
    ///
    /// Waits at most `max_wait` for data and returns an empty batch if none
    /// arrived. Messages come back in log order.
    async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: FetchOffset,
        max_messages: usize,
        max_wait: Duration,
    ) -> Result<Vec<ConsumedMessage>>;

    /// Offset of the newest message, or -1 if the partition is empty.
    async fn last_offset_for(&self, topic: &str, partition: i32) -> Result<i64>;

    /// Open a new producer connection.
    async fn connect_producer(&self) -> Result<Box<dyn LogProducer>>;
}

/// Buffered producer connection.
///
/// Messages are buffered by [`produce`](Self::produce) and sent together by
/// [`deliver`](Self::deliver). A failed delivery keeps the buffer so it can
/// be retried.
#[async_trait]
pub trait LogProducer: Send {
    /// Buffer a message for `topic`/`partition`.
    fn produce(&mut self, value: Bytes, topic: &str, partition: i32);

    /// Number of buffered messages.
    fn buffered(&self) -> usize;

    /// Send all buffered messages and return how many were sent.
    async fn deliver(&mut self) -> Result<usize>;

    /// Drop all buffered messages.
    fn clear(&mut self);
}
