//! Pooled producer.
//!
//! A [`Producer`] owns a small pool of [`LogProducer`] connections. A
//! semaphore bounds how many connections exist; idle connections are reused.
//! A connection is only ever used by one caller at a time.
//!
//! Single messages go through [`Producer::produce`]. Larger runs use a
//! [`ProducerBatch`], which keeps one connection checked out, buffers
//! messages, and sends them on [`deliver`](ProducerBatch::deliver) and
//! [`finish`](ProducerBatch::finish):
//!
//! ```rust,no_run
//! # async fn example(producer: kafka_sync::producer::Producer) -> kafka_sync::Result<()> {
//! let mut batch = producer.batch().await?;
//! for id in 0..100 {
//!     batch.produce(format!(r#"{{"id":{id}}}"#), "products", 0);
//! }
//! batch.finish().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use backon::BackoffBuilder;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::context::SyncContext;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::retry;
use crate::transport::{LogProducer, LogTransport};

struct Pool {
    transport: Arc<dyn LogTransport>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn LogProducer>>>,
    size: usize,
}

/// Pooled producer. Clones share the pool.
#[derive(Clone)]
pub struct Producer {
    pool: Arc<Pool>,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("pool_size", &self.pool.size)
            .field("idle", &self.idle_connections())
            .finish()
    }
}

impl Producer {
    /// Create a producer with at most `pool_size` connections.
    pub fn new(transport: Arc<dyn LogTransport>, pool_size: usize) -> Self {
        let size = pool_size.max(1);
        Self {
            pool: Arc::new(Pool {
                transport,
                permits: Arc::new(Semaphore::new(size)),
                idle: Mutex::new(Vec::with_capacity(size)),
                size,
            }),
        }
    }

    /// Create a producer using the context's transport and pool size.
    pub fn from_context(ctx: &SyncContext) -> Self {
        Self::new(ctx.transport().clone(), ctx.config().producer_pool_size)
    }

    pub fn pool_size(&self) -> usize {
        self.pool.size
    }

    /// Connections currently waiting in the pool.
    pub fn idle_connections(&self) -> usize {
        self.pool.idle.lock().len()
    }

    /// Send one message and wait until it is delivered.
    pub async fn produce(&self, message: impl Into<Bytes>, topic: &str, partition: i32) -> Result<()> {
        let mut connection = self.checkout().await?;
        connection.produce(message.into(), topic, partition);
        connection.deliver().await?;
        Ok(())
    }

    /// Check out a connection for a batch.
    ///
    /// Waits while all connections are in use.
    pub async fn batch(&self) -> Result<ProducerBatch> {
        Ok(ProducerBatch {
            connection: self.checkout().await?,
            size: 0,
        })
    }

    /// Refuse further checkouts and drop idle connections.
    pub fn close(&self) {
        self.pool.permits.close();
        self.pool.idle.lock().clear();
    }

    async fn checkout(&self) -> Result<PooledConnection> {
        let permit = self
            .pool
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SyncError::PoolClosed)?;

        let idle = self.pool.idle.lock().pop();
        let producer = match idle {
            Some(producer) => producer,
            None => {
                debug!("Opening producer connection");
                self.pool.transport.connect_producer().await?
            }
        };

        Ok(PooledConnection {
            producer: Some(producer),
            pool: self.pool.clone(),
            pending: HashMap::new(),
            healthy: true,
            _permit: permit,
        })
    }
}

/// A checked-out connection. Returns itself to the pool on drop.
struct PooledConnection {
    producer: Option<Box<dyn LogProducer>>,
    pool: Arc<Pool>,
    /// Buffered message count per topic, for metrics.
    pending: HashMap<String, u64>,
    healthy: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn produce(&mut self, message: Bytes, topic: &str, partition: i32) {
        if let Some(producer) = self.producer.as_mut() {
            producer.produce(message, topic, partition);
            *self.pending.entry(topic.to_string()).or_default() += 1;
        }
    }

    /// Flush the buffer, retrying transient failures.
    async fn deliver(&mut self) -> Result<usize> {
        let Some(producer) = self.producer.as_mut() else {
            return Err(SyncError::PoolClosed);
        };

        let mut backoff = retry::transport_policy().build();
        loop {
            match producer.deliver().await {
                Ok(delivered) => {
                    for (topic, count) in self.pending.drain() {
                        metrics::MESSAGES_PRODUCED
                            .with_label_values(&[topic.as_str()])
                            .inc_by(count);
                    }
                    return Ok(delivered);
                }
                Err(e) if e.is_retriable() => match backoff.next() {
                    Some(delay) => {
                        warn!(error = %e, ?delay, "Delivery failed, retrying");
                        metrics::RETRY_ATTEMPTS
                            .with_label_values(&["transport"])
                            .inc();
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        self.healthy = false;
                        return Err(e);
                    }
                },
                Err(e) => {
                    self.healthy = false;
                    return Err(e);
                }
            }
        }
    }

    fn discard(&mut self) -> usize {
        self.pending.clear();
        match self.producer.as_mut() {
            Some(producer) => {
                let discarded = producer.buffered();
                producer.clear();
                discarded
            }
            None => 0,
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(mut producer) = self.producer.take() else {
            return;
        };

        if !self.healthy || self.pool.permits.is_closed() {
            return;
        }

        producer.clear();
        self.pool.idle.lock().push(producer);
    }
}

/// Buffered run of messages on one checked-out connection.
///
/// Call [`finish`](Self::finish) to send the remainder and return the
/// connection. Dropping an unfinished batch discards whatever was not
/// delivered yet.
pub struct ProducerBatch {
    connection: PooledConnection,
    size: usize,
}

impl std::fmt::Debug for ProducerBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerBatch")
            .field("size", &self.size)
            .finish()
    }
}

impl ProducerBatch {
    /// Buffer a message.
    pub fn produce(&mut self, message: impl Into<Bytes>, topic: &str, partition: i32) {
        self.connection.produce(message.into(), topic, partition);
        self.size += 1;
    }

    /// Messages buffered since the last delivery.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Send the buffered messages.
    pub async fn deliver(&mut self) -> Result<()> {
        if self.size > 0 {
            self.connection.deliver().await?;
        }
        self.size = 0;
        Ok(())
    }

    /// Send the remainder and return the connection to the pool.
    pub async fn finish(mut self) -> Result<()> {
        self.deliver().await
    }
}

impl Drop for ProducerBatch {
    fn drop(&mut self) {
        if self.size > 0 {
            let discarded = self.connection.discard();
            warn!(discarded, "Producer batch dropped with undelivered messages");
        }
    }
}
