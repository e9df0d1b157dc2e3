//! Delay queue on top of the log.
//!
//! Messages meant for later are written to a topic's delay companion
//! (`<topic>-delay`) wrapped in a [`DelayEnvelope`]. A [`Delayer`] consumes
//! the companion in log order and republishes each payload to the live topic
//! once `created_at + delay` has passed.
//!
//! Because envelopes are appended in creation order, the delayer only ever
//! needs to wait for the message at the head of its batch. Before it sleeps
//! it delivers everything already republished and commits the consumer offset
//! up to the message it waits for, so a leadership change during a long sleep
//! neither loses nor duplicates more than that message.
//!
//! An envelope may carry a `topic` field overriding the delayer's topic, which
//! lets many topics share one delay topic (for example `delay_5m`). A delayer
//! with a `forward_topic` also appends every envelope, with a refreshed
//! `created_at`, to that topic, chaining delays.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::constants::{
    DEFAULT_DELAY, DELAY_TOPIC_SUFFIX, DELAYER_BATCH_SIZE, DELAYER_CONSUMER_NAME,
    DELAYER_POOL_SIZE,
};
use crate::consumer::{BatchContext, BatchHandler, Consumer, ConsumerOptions};
use crate::context::SyncContext;
use crate::election::LeaderElection;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::producer::Producer;
use crate::transport::ConsumedMessage;

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Name of the delay companion of `topic`.
pub fn delay_topic_for(topic: &str) -> String {
    format!("{topic}{DELAY_TOPIC_SUFFIX}")
}

/// A payload waiting in a delay topic.
///
/// Fields other than the known ones are kept when the envelope is forwarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayEnvelope {
    pub payload: Value,
    /// Unix seconds.
    pub created_at: f64,
    /// Overrides the delayer's target topic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DelayEnvelope {
    pub fn new(payload: Value, created_at: f64) -> Self {
        Self {
            payload,
            created_at,
            topic: None,
            extra: Map::new(),
        }
    }

    /// Envelope created now.
    pub fn now(payload: Value) -> Self {
        Self::new(payload, unix_now())
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Decode a delay-topic message.
    pub fn from_message(message: &ConsumedMessage) -> Result<Self> {
        serde_json::from_slice(message.value()).map_err(|e| SyncError::InvalidEnvelope {
            offset: message.offset(),
            reason: e.to_string(),
        })
    }

    /// Time left until the envelope is eligible, or `None` if it already is.
    ///
    /// Fails if the wait does not fit in a [`Duration`], which only happens
    /// for a `created_at` far in the future.
    pub fn remaining(&self, delay: Duration, now: f64) -> std::result::Result<Option<Duration>, String> {
        let diff = self.created_at + delay.as_secs_f64() - now;
        if diff <= 0.0 {
            return Ok(None);
        }
        Duration::try_from_secs_f64(diff)
            .map(Some)
            .map_err(|e| format!("created_at {} out of range: {e}", self.created_at))
    }

    /// Copy with `created_at` set to `now`.
    pub fn refreshed(&self, now: f64) -> Self {
        Self {
            created_at: now,
            ..self.clone()
        }
    }
}

/// Where a delayer reads from and writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayerOptions {
    /// Live topic the payloads are republished to.
    pub topic: String,
    pub partition: i32,
    pub delay: Duration,
    /// Also append each envelope, re-stamped, to this topic.
    pub forward_topic: Option<String>,
    /// Read from this topic instead of `<topic>-delay`.
    pub delay_topic: Option<String>,
}

impl DelayerOptions {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            delay: DEFAULT_DELAY,
            forward_topic: None,
            delay_topic: None,
        }
    }

    pub fn partition(mut self, partition: i32) -> Self {
        self.partition = partition;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn forward_topic(mut self, topic: impl Into<String>) -> Self {
        self.forward_topic = Some(topic.into());
        self
    }

    pub fn delay_topic(mut self, topic: impl Into<String>) -> Self {
        self.delay_topic = Some(topic.into());
        self
    }
}

/// Consumer of a delay topic that republishes eligible payloads.
#[derive(Debug, Clone)]
pub struct Delayer {
    consumer: Consumer,
    handler: DelayHandler,
}

impl Delayer {
    pub fn new(ctx: &SyncContext, options: DelayerOptions) -> Self {
        let source = options
            .delay_topic
            .clone()
            .unwrap_or_else(|| delay_topic_for(&options.topic));

        let consumer = Consumer::new(
            ctx,
            ConsumerOptions::new(source, DELAYER_CONSUMER_NAME)
                .partition(options.partition)
                .batch_size(DELAYER_BATCH_SIZE),
        );

        let handler = DelayHandler {
            producer: Producer::new(ctx.transport().clone(), DELAYER_POOL_SIZE),
            target_topic: options.topic,
            partition: options.partition,
            delay: options.delay,
            safety_margin: ctx.config().delay_safety_margin,
            forward_topic: options.forward_topic,
        };

        Self { consumer, handler }
    }

    /// Topic this delayer consumes.
    pub fn delay_topic(&self) -> &str {
        self.consumer.topic()
    }

    pub fn consumer(&self) -> &Consumer {
        &self.consumer
    }

    /// Start delaying. Returns immediately.
    pub fn run(&self) -> LeaderElection {
        self.consumer.run(self.handler.clone())
    }
}

#[derive(Debug, Clone)]
struct DelayHandler {
    producer: Producer,
    target_topic: String,
    partition: i32,
    delay: Duration,
    safety_margin: Duration,
    forward_topic: Option<String>,
}

#[async_trait]
impl BatchHandler for DelayHandler {
    async fn handle(&self, messages: &[ConsumedMessage], ctx: &BatchContext) -> Result<()> {
        let mut batch = self.producer.batch().await?;

        for slice in messages.chunks(DELAYER_BATCH_SIZE) {
            for message in slice {
                let envelope = match DelayEnvelope::from_message(message) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        skip_invalid(message, &e);
                        continue;
                    }
                };

                let remaining = match envelope.remaining(self.delay, unix_now()) {
                    Ok(remaining) => remaining,
                    Err(reason) => {
                        skip_invalid(
                            message,
                            &SyncError::InvalidEnvelope {
                                offset: message.offset(),
                                reason,
                            },
                        );
                        continue;
                    }
                };

                if let Some(remaining) = remaining {
                    if batch.size() > 0 {
                        batch.deliver().await?;
                        ctx.commit(message.offset()).await?;
                    }

                    metrics::DELAY_SLEEPS
                        .with_label_values(&[self.target_topic.as_str()])
                        .inc();
                    debug!(offset = message.offset(), ?remaining, "Waiting for delay message");

                    tokio::select! {
                        _ = tokio::time::sleep(remaining.saturating_add(self.safety_margin)) => {}
                        _ = ctx.status().stopped() => return Err(SyncError::Stopped),
                    }
                }

                if let Some(forward) = &self.forward_topic {
                    let forwarded = serde_json::to_vec(&envelope.refreshed(unix_now()))?;
                    batch.produce(forwarded, forward, self.partition);
                }

                let topic = envelope.topic.as_deref().unwrap_or(&self.target_topic);
                batch.produce(serde_json::to_vec(&envelope.payload)?, topic, self.partition);

                metrics::MESSAGES_DELAYED.with_label_values(&[topic]).inc();
            }

            batch.deliver().await?;
        }

        batch.finish().await
    }
}

fn skip_invalid(message: &ConsumedMessage, e: &SyncError) {
    metrics::LOOP_ERRORS
        .with_label_values(&[message.topic(), DELAYER_CONSUMER_NAME, e.as_metric_label()])
        .inc();
    error!(offset = message.offset(), error = %e, "Skipping invalid delay message");
}
