//! Publishing application records.
//!
//! A [`Streamer`] turns records implementing [`Streamable`] into log
//! messages. `queue` publishes the record's payload to its topic right away;
//! `delay` publishes a [`DelayEnvelope`] to the topic's delay companion so a
//! [`Delayer`](crate::delayer::Delayer) republishes it later.
//!
//! The usual pattern is to `delay` inside a write transaction and `queue`
//! after commit: if the process dies in between, the delayed copy still gets
//! through.
//!
//! ```rust,no_run
//! use kafka_sync::streamer::{Streamable, Streamer, TopicMap};
//! use serde_json::{Value, json};
//!
//! struct Product {
//!     id: u64,
//! }
//!
//! impl Streamable for Product {
//!     const RECORD_TYPE: &'static str = "Product";
//!
//!     fn stream_payload(&self) -> Value {
//!         json!({ "id": self.id })
//!     }
//! }
//!
//! # async fn example(producer: kafka_sync::producer::Producer) -> kafka_sync::Result<()> {
//! let topics = TopicMap::new().with::<Product>("products");
//! let streamer = Streamer::new(producer, topics, vec![0, 1, 2]);
//!
//! streamer.queue(&Product { id: 1 }).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;

use serde_json::Value;

use crate::constants::STREAMER_BATCH_SIZE;
use crate::delayer::{DelayEnvelope, delay_topic_for};
use crate::error::{Result, SyncError};
use crate::producer::Producer;

/// A record that can be published.
pub trait Streamable {
    /// Key looked up in the [`TopicMap`].
    const RECORD_TYPE: &'static str;

    /// JSON published for this record.
    fn stream_payload(&self) -> Value;
}

/// Record type to topic mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicMap {
    topics: HashMap<String, String>,
}

impl TopicMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `record_type` to `topic`.
    pub fn insert(&mut self, record_type: impl Into<String>, topic: impl Into<String>) {
        self.topics.insert(record_type.into(), topic.into());
    }

    /// Map `T`'s record type to `topic`.
    pub fn with<T: Streamable>(mut self, topic: impl Into<String>) -> Self {
        self.insert(T::RECORD_TYPE, topic);
        self
    }

    pub fn get(&self, record_type: &str) -> Option<&str> {
        self.topics.get(record_type).map(String::as_str)
    }

    /// Topic of `T`, or [`SyncError::UnknownTopic`].
    pub fn topic_for<T: Streamable>(&self) -> Result<&str> {
        self.get(T::RECORD_TYPE)
            .ok_or_else(|| SyncError::UnknownTopic(T::RECORD_TYPE.to_string()))
    }
}

/// Publishes records to their topics and delay topics.
#[derive(Debug, Clone)]
pub struct Streamer {
    producer: Producer,
    topics: TopicMap,
    partitions: Vec<i32>,
}

impl Streamer {
    /// Messages go to a partition picked at random from `partitions`
    /// (partition 0 if empty).
    pub fn new(producer: Producer, topics: TopicMap, partitions: Vec<i32>) -> Self {
        let partitions = if partitions.is_empty() {
            vec![0]
        } else {
            partitions
        };

        Self {
            producer,
            topics,
            partitions,
        }
    }

    /// Publish `record`'s payload to its topic.
    pub async fn queue<T: Streamable>(&self, record: &T) -> Result<()> {
        let topic = self.topics.topic_for::<T>()?;
        let message = serde_json::to_vec(&record.stream_payload())?;
        self.producer
            .produce(message, topic, self.pick_partition())
            .await
    }

    /// Publish a delay envelope for `record` to its topic's delay companion.
    pub async fn delay<T: Streamable>(&self, record: &T) -> Result<()> {
        let topic = delay_topic_for(self.topics.topic_for::<T>()?);
        let message = serde_json::to_vec(&DelayEnvelope::now(record.stream_payload()))?;
        self.producer
            .produce(message, &topic, self.pick_partition())
            .await
    }

    /// [`queue`](Self::queue) many records, batching the deliveries.
    pub async fn bulk_queue<T: Streamable>(&self, records: &[T]) -> Result<()> {
        let topic = self.topics.topic_for::<T>()?;

        for slice in records.chunks(STREAMER_BATCH_SIZE) {
            let mut batch = self.producer.batch().await?;
            for record in slice {
                let message = serde_json::to_vec(&record.stream_payload())?;
                batch.produce(message, topic, self.pick_partition());
            }
            batch.finish().await?;
        }

        Ok(())
    }

    /// [`delay`](Self::delay) many records, batching the deliveries.
    pub async fn bulk_delay<T: Streamable>(&self, records: &[T]) -> Result<()> {
        let topic = delay_topic_for(self.topics.topic_for::<T>()?);

        for slice in records.chunks(STREAMER_BATCH_SIZE) {
            let mut batch = self.producer.batch().await?;
            for record in slice {
                let envelope = DelayEnvelope::now(record.stream_payload());
                batch.produce(serde_json::to_vec(&envelope)?, &topic, self.pick_partition());
            }
            batch.finish().await?;
        }

        Ok(())
    }

    /// Delay `records`, run `update`, then queue `records`.
    ///
    /// If `update` fails the records are not queued, but the delayed copies
    /// still get republished.
    pub async fn bulk<T, F, Fut, R, E>(&self, records: &[T], update: F) -> Result<R>
    where
        T: Streamable,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<R, E>>,
        E: Into<crate::error::BoxError>,
    {
        self.bulk_delay(records).await?;
        let result = update().await.map_err(SyncError::handler)?;
        self.bulk_queue(records).await?;
        Ok(result)
    }

    fn pick_partition(&self) -> i32 {
        self.partitions[fastrand::usize(..self.partitions.len())]
    }
}
