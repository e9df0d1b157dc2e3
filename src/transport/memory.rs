//! In-memory partitioned log.
//!
//! Fetches block (up to their `max_wait`) until new data is appended, which
//! makes the consumer loop behave as it would against a broker. Failures can
//! be injected for fetches and deliveries.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{ConsumedMessage, FetchOffset, LogProducer, LogTransport};
use crate::error::{Result, SyncError};

type PartitionKey = (String, i32);

#[derive(Debug, Clone)]
struct Record {
    key: Option<Bytes>,
    value: Bytes,
}

#[derive(Debug, Default)]
struct LogInner {
    partitions: Mutex<HashMap<PartitionKey, Vec<Record>>>,
    appended: Notify,
    failing_fetches: AtomicUsize,
    failing_deliveries: AtomicUsize,
    connections: AtomicUsize,
}

/// Shared in-memory log. Clones share the same partitions.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    inner: Arc<LogInner>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message directly and return its offset.
    pub fn append(&self, topic: &str, partition: i32, value: impl Into<Bytes>) -> i64 {
        self.append_keyed(topic, partition, None, value)
    }

    /// Append a keyed message directly and return its offset.
    pub fn append_keyed(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Bytes>,
        value: impl Into<Bytes>,
    ) -> i64 {
        let offset = {
            let mut partitions = self.inner.partitions.lock();
            let records = partitions
                .entry((topic.to_string(), partition))
                .or_default();
            records.push(Record {
                key,
                value: value.into(),
            });
            records.len() as i64 - 1
        };
        self.inner.appended.notify_waiters();
        offset
    }

    /// All values of a partition, in log order.
    pub fn values(&self, topic: &str, partition: i32) -> Vec<Bytes> {
        self.inner
            .partitions
            .lock()
            .get(&(topic.to_string(), partition))
            .map(|records| records.iter().map(|r| r.value.clone()).collect())
            .unwrap_or_default()
    }

    /// All values of a partition parsed as JSON. Non-JSON values are skipped.
    pub fn json_values(&self, topic: &str, partition: i32) -> Vec<serde_json::Value> {
        self.values(topic, partition)
            .iter()
            .filter_map(|v| serde_json::from_slice(v).ok())
            .collect()
    }

    /// Number of messages in a partition.
    pub fn len(&self, topic: &str, partition: i32) -> usize {
        self.inner
            .partitions
            .lock()
            .get(&(topic.to_string(), partition))
            .map_or(0, Vec::len)
    }

    /// Returns true if the partition holds no messages.
    pub fn is_empty(&self, topic: &str, partition: i32) -> bool {
        self.len(topic, partition) == 0
    }

    /// Make the next `n` fetches fail with a transport error.
    pub fn fail_next_fetches(&self, n: usize) {
        self.inner.failing_fetches.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` deliveries fail with a transport error.
    pub fn fail_next_deliveries(&self, n: usize) {
        self.inner.failing_deliveries.store(n, Ordering::SeqCst);
    }

    /// Number of producer connections opened so far.
    pub fn producers_connected(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn read(
        &self,
        topic: &str,
        partition: i32,
        start: i64,
        max_messages: usize,
    ) -> Result<Vec<ConsumedMessage>> {
        let partitions = self.inner.partitions.lock();
        let records = partitions
            .get(&(topic.to_string(), partition))
            .map(Vec::as_slice)
            .unwrap_or_default();

        if start < 0 || start > records.len() as i64 {
            return Err(SyncError::Transport(format!(
                "Offset {start} out of range for {topic}/{partition} (0..={})",
                records.len()
            )));
        }

        Ok(records
            .iter()
            .enumerate()
            .skip(start as usize)
            .take(max_messages)
            .map(|(offset, record)| {
                ConsumedMessage::new(
                    topic,
                    partition,
                    offset as i64,
                    record.key.clone(),
                    record.value.clone(),
                )
            })
            .collect())
    }
}

#[async_trait]
impl LogTransport for MemoryLog {
    async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: FetchOffset,
        max_messages: usize,
        max_wait: Duration,
    ) -> Result<Vec<ConsumedMessage>> {
        if Self::take_failure(&self.inner.failing_fetches) {
            return Err(SyncError::Transport(format!(
                "Injected fetch failure for {topic}/{partition}"
            )));
        }

        let start = match offset {
            FetchOffset::Earliest => 0,
            FetchOffset::At(offset) => offset,
        };
        let deadline = Instant::now() + max_wait;

        loop {
            let notified = self.inner.appended.notified();
            tokio::pin!(notified);
            // Register before reading so an append in between is not missed.
            notified.as_mut().enable();

            let batch = self.read(topic, partition, start, max_messages)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn last_offset_for(&self, topic: &str, partition: i32) -> Result<i64> {
        Ok(self.len(topic, partition) as i64 - 1)
    }

    async fn connect_producer(&self) -> Result<Box<dyn LogProducer>> {
        self.inner.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryProducer {
            log: self.clone(),
            buffer: Vec::new(),
        }))
    }
}

/// Producer connection of a [`MemoryLog`].
#[derive(Debug)]
pub struct MemoryProducer {
    log: MemoryLog,
    buffer: Vec<(String, i32, Bytes)>,
}

#[async_trait]
impl LogProducer for MemoryProducer {
    fn produce(&mut self, value: Bytes, topic: &str, partition: i32) {
        self.buffer.push((topic.to_string(), partition, value));
    }

    fn buffered(&self) -> usize {
        self.buffer.len()
    }

    async fn deliver(&mut self) -> Result<usize> {
        if MemoryLog::take_failure(&self.log.inner.failing_deliveries) {
            return Err(SyncError::Transport("Injected delivery failure".to_string()));
        }

        let delivered = self.buffer.len();
        for (topic, partition, value) in self.buffer.drain(..) {
            self.log.append(&topic, partition, value);
        }
        Ok(delivered)
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_from_earliest_and_offset() {
        let log = MemoryLog::new();
        for i in 0..5 {
            log.append("t", 0, format!("m{i}"));
        }

        let all = log
            .fetch("t", 0, FetchOffset::Earliest, 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].offset(), 0);

        let tail = log
            .fetch("t", 0, FetchOffset::At(3), 1, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].offset(), 3);
        assert_eq!(tail[0].value(), &Bytes::from("m3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_times_out_with_empty_batch() {
        let log = MemoryLog::new();

        let started = Instant::now();
        let batch = log
            .fetch("t", 0, FetchOffset::Earliest, 10, Duration::from_secs(8))
            .await
            .unwrap();

        assert!(batch.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_fetch_wakes_on_append() {
        let log = MemoryLog::new();
        let writer = log.clone();

        let fetch = tokio::spawn(async move {
            log.fetch("t", 0, FetchOffset::Earliest, 10, Duration::from_secs(30))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.append("t", 0, "late");

        let batch = tokio::time::timeout(Duration::from_secs(5), fetch)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_out_of_range() {
        let log = MemoryLog::new();
        log.append("t", 0, "a");

        let err = log
            .fetch("t", 0, FetchOffset::At(5), 10, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
    }

    #[tokio::test]
    async fn test_last_offset_for() {
        let log = MemoryLog::new();
        assert_eq!(log.last_offset_for("t", 0).await.unwrap(), -1);

        log.append("t", 0, "a");
        log.append("t", 0, "b");
        assert_eq!(log.last_offset_for("t", 0).await.unwrap(), 1);
        assert_eq!(log.last_offset_for("t", 1).await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_producer_buffers_until_deliver() {
        let log = MemoryLog::new();
        let mut producer = log.connect_producer().await.unwrap();

        producer.produce(Bytes::from("a"), "t", 0);
        producer.produce(Bytes::from("b"), "u", 1);
        assert_eq!(producer.buffered(), 2);
        assert!(log.is_empty("t", 0));

        assert_eq!(producer.deliver().await.unwrap(), 2);
        assert_eq!(producer.buffered(), 0);
        assert_eq!(log.values("t", 0), vec![Bytes::from("a")]);
        assert_eq!(log.values("u", 1), vec![Bytes::from("b")]);
    }

    #[tokio::test]
    async fn test_failed_delivery_keeps_buffer() {
        let log = MemoryLog::new();
        let mut producer = log.connect_producer().await.unwrap();
        log.fail_next_deliveries(1);

        producer.produce(Bytes::from("a"), "t", 0);
        assert!(producer.deliver().await.is_err());
        assert_eq!(producer.buffered(), 1);

        assert_eq!(producer.deliver().await.unwrap(), 1);
        assert_eq!(log.len("t", 0), 1);
    }

    #[tokio::test]
    async fn test_injected_fetch_failures() {
        let log = MemoryLog::new();
        log.fail_next_fetches(2);

        for _ in 0..2 {
            assert!(
                log.fetch("t", 0, FetchOffset::Earliest, 1, Duration::ZERO)
                    .await
                    .is_err()
            );
        }
        assert!(
            log.fetch("t", 0, FetchOffset::Earliest, 1, Duration::ZERO)
                .await
                .is_ok()
        );
    }
}
