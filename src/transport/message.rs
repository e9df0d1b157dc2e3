use bytes::Bytes;
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::Result;

/// A message fetched from the log.
///
/// The JSON payload is parsed on first access and cached.
#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    topic: String,
    partition: i32,
    offset: i64,
    key: Option<Bytes>,
    value: Bytes,
    payload: OnceCell<Value>,
}

impl ConsumedMessage {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        key: Option<Bytes>,
        value: Bytes,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key,
            value,
            payload: OnceCell::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    /// Raw message bytes.
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// The value parsed as JSON.
    pub fn payload(&self) -> Result<&Value> {
        self.payload
            .get_or_try_init(|| serde_json::from_slice(&self.value))
            .map_err(Into::into)
    }

    /// The value deserialized into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.value)?)
    }
}
