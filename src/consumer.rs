//! Leader-elected, offset-tracked consumer.
//!
//! A [`Consumer`] is identified by its `(topic, partition, name)` triple. Any
//! number of processes may run the same triple; a [`LeaderElection`] on the
//! triple's leader path makes sure only one of them fetches at a time.
//!
//! # Delivery
//!
//! The leader fetches from the committed offset, hands the messages to the
//! [`BatchHandler`] in chunks of at most `batch_size`, and commits
//! `last offset + 1` after each chunk the handler accepted. A handler failure
//! or a crash therefore redelivers the chunk, but never skips it.
//!
//! ```rust,no_run
//! use kafka_sync::consumer::{Consumer, ConsumerOptions, handler_fn};
//! use kafka_sync::SyncContext;
//!
//! # fn example(ctx: &SyncContext) {
//! let consumer = Consumer::new(ctx, ConsumerOptions::new("products", "indexer"));
//!
//! let election = consumer.run(handler_fn(|messages, _ctx| async move {
//!     for message in &messages {
//!         println!("{} -> {:?}", message.offset(), message.payload());
//!     }
//!     Ok(())
//! }));
//! # let _ = election;
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{Instrument, debug, error, info_span};

use crate::context::SyncContext;
use crate::coordination::ConsumerPaths;
use crate::coordination::paths::{decode_offset, encode_offset};
use crate::election::LeaderElection;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::retry::with_jitter;
use crate::status::StatusToken;
use crate::transport::{ConsumedMessage, FetchOffset};

/// Identity of a consumer and its batching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    pub topic: String,
    pub name: String,
    pub partition: i32,
    /// Falls back to [`SyncConfig::default_batch_size`](crate::SyncConfig::default_batch_size).
    pub batch_size: Option<usize>,
}

impl ConsumerOptions {
    pub fn new(topic: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            name: name.into(),
            partition: 0,
            batch_size: None,
        }
    }

    pub fn partition(mut self, partition: i32) -> Self {
        self.partition = partition;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }
}

/// User logic invoked with each chunk of fetched messages.
///
/// Returning `Ok` commits the chunk. Returning [`SyncError::Stopped`] leaves
/// the consumer loop without committing; any other error is logged and the
/// chunk is fetched again after the error backoff.
#[async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    async fn handle(&self, messages: &[ConsumedMessage], ctx: &BatchContext) -> Result<()>;
}

/// Handler built from an async closure, see [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

/// Adapt an async closure into a [`BatchHandler`].
///
/// The closure receives an owned copy of the chunk and of the context.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Vec<ConsumedMessage>, BatchContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> BatchHandler for HandlerFn<F>
where
    F: Fn(Vec<ConsumedMessage>, BatchContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, messages: &[ConsumedMessage], ctx: &BatchContext) -> Result<()> {
        (self.f)(messages.to_vec(), ctx.clone()).await
    }
}

/// What a handler can do besides looking at messages.
#[derive(Debug, Clone)]
pub struct BatchContext {
    consumer: Consumer,
    status: StatusToken,
}

impl BatchContext {
    /// Commit `offset` as the next offset to read.
    ///
    /// Lets a handler save progress in the middle of a chunk.
    pub async fn commit(&self, offset: i64) -> Result<()> {
        self.consumer.commit(offset).await
    }

    /// Status token of the current leadership term.
    pub fn status(&self) -> &StatusToken {
        &self.status
    }

    pub fn is_stopping(&self) -> bool {
        self.status.is_stopping()
    }

    pub fn consumer(&self) -> &Consumer {
        &self.consumer
    }
}

/// Offset-tracked consumer of one topic partition.
#[derive(Debug, Clone)]
pub struct Consumer {
    ctx: SyncContext,
    topic: String,
    name: String,
    partition: i32,
    batch_size: usize,
    paths: ConsumerPaths,
}

impl Consumer {
    pub fn new(ctx: &SyncContext, options: ConsumerOptions) -> Self {
        let paths = ctx.consumer_paths(&options.topic, options.partition, &options.name);
        let batch_size = options
            .batch_size
            .unwrap_or(ctx.config().default_batch_size)
            .max(1);

        Self {
            ctx: ctx.clone(),
            topic: options.topic,
            name: options.name,
            partition: options.partition,
            batch_size,
            paths,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn paths(&self) -> &ConsumerPaths {
        &self.paths
    }

    /// The committed offset, or `None` if nothing was committed yet.
    pub async fn current_offset(&self) -> Result<Option<i64>> {
        let path = self.paths.offset();
        match self.ctx.store().get(&path).await {
            Ok(data) => decode_offset(&data).map_err(|value| SyncError::InvalidOffset { path, value }),
            Err(SyncError::NoNode { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Persist `offset` as the next offset to read.
    ///
    /// Creates the offset path on first use.
    pub async fn commit(&self, offset: i64) -> Result<()> {
        let path = self.paths.offset();
        let data = encode_offset(offset);
        let store = self.ctx.store();

        match store.set(&path, data.as_bytes()).await {
            Ok(()) => {}
            Err(SyncError::NoNode { .. }) => {
                store.ensure_path(&path).await?;
                store.set(&path, data.as_bytes()).await?;
            }
            Err(e) => return Err(e),
        }

        metrics::record_commit(&self.topic, self.partition, &self.name, offset);
        debug!(topic = %self.topic, partition = self.partition, name = %self.name, offset, "Committed offset");
        Ok(())
    }

    /// Start consuming with `handler`. Returns immediately.
    ///
    /// The fetch loop runs as the leader body of an election on this
    /// consumer's leader path; the returned election can be observed or shut
    /// down.
    pub fn run<H: BatchHandler>(&self, handler: H) -> LeaderElection {
        let consumer = self.clone();
        let handler = Arc::new(handler);
        let config = self.ctx.config();

        let election = LeaderElection::builder(
            self.ctx.store().clone(),
            self.paths.leader(),
            config.identity.clone(),
        )
        .election_backoff(config.election_backoff)
        .as_leader(move |status| {
            let consumer = consumer.clone();
            let handler = handler.clone();
            async move { consumer.work(status, handler).await }
        })
        .build();

        election.run();
        election
    }

    /// Fetch loop of one leadership term. Never fails; errors are retried.
    pub(crate) async fn work<H: BatchHandler + ?Sized>(
        &self,
        status: StatusToken,
        handler: Arc<H>,
    ) -> Result<()> {
        let span = info_span!(
            "consumer",
            topic = %self.topic,
            partition = self.partition,
            name = %self.name
        );

        async {
            loop {
                match self.consume(&status, handler.as_ref()).await {
                    Ok(()) => return Ok(()),
                    Err(SyncError::Stopped) => {
                        debug!("Handler stopped, leaving without commit");
                        return Ok(());
                    }
                    Err(e) => {
                        metrics::LOOP_ERRORS
                            .with_label_values(&[
                                self.topic.as_str(),
                                self.name.as_str(),
                                e.as_metric_label(),
                            ])
                            .inc();
                        error!(error = %e, "Consumer loop failed, retrying");

                        if self.sleep_or_stop(&status, self.ctx.config().error_backoff).await {
                            return Ok(());
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Run until `status` stops. Starts over from the committed offset.
    async fn consume<H: BatchHandler + ?Sized>(
        &self,
        status: &StatusToken,
        handler: &H,
    ) -> Result<()> {
        let mut offset = FetchOffset::from_committed(self.current_offset().await?);
        let max_wait = self.ctx.config().fetch_max_wait;
        let context = BatchContext {
            consumer: self.clone(),
            status: status.clone(),
        };

        debug!(?offset, "Consuming");

        while !status.is_stopping() {
            let messages = tokio::select! {
                fetched = self.ctx.transport().fetch(
                    &self.topic,
                    self.partition,
                    offset,
                    self.batch_size,
                    max_wait,
                ) => fetched?,
                _ = status.stopped() => return Ok(()),
            };

            for chunk in messages.chunks(self.batch_size) {
                if status.is_stopping() {
                    return Ok(());
                }

                let Some(last) = chunk.last() else {
                    continue;
                };

                handler.handle(chunk, &context).await?;

                metrics::MESSAGES_CONSUMED
                    .with_label_values(&[self.topic.as_str(), self.name.as_str()])
                    .inc_by(chunk.len() as u64);

                let next = last.offset() + 1;
                self.commit(next).await?;
                offset = FetchOffset::At(next);
            }
        }

        Ok(())
    }

    /// Sleep the jittered backoff. Returns true if `status` stopped first.
    async fn sleep_or_stop(&self, status: &StatusToken, backoff: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(with_jitter(backoff)) => false,
            _ = status.stopped() => true,
        }
    }
}
