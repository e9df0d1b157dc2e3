//! # kafka-sync
//! Leader-elected, offset-tracked consumers of a partitioned log, and a delay
//! queue built on top of them.
//!
//! The crate is the plumbing underneath model-change replication: application
//! records are streamed to topics, and downstream processes consume them with
//! durable, coordinated offsets.
//!
//! - [`election::LeaderElection`]: at most one active worker per coordination
//!   path across a fleet, with handoff when the leader dies
//! - [`consumer::Consumer`]: fetch, handle, commit. Never loses a message, may
//!   redeliver one
//! - [`delayer::Delayer`]: republishes delay-topic messages once they are old
//!   enough
//! - [`producer::Producer`]: pooled, batching producer
//! - [`streamer::Streamer`]: publishes [`streamer::Streamable`] records
//! - [`barrier::Barrier`]: waits until a consumer has caught up
//!
//! The coordination store and the log are reached through the
//! [`coordination::CoordinationStore`] and [`transport::LogTransport`] traits.
//! In-memory implementations of both ship with the crate.
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kafka_sync::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> kafka_sync::Result<()> {
//!     let store = MemoryCoordinationStore::new();
//!     let log = MemoryLog::new();
//!     let ctx = SyncContext::new(
//!         Arc::new(store.connect()),
//!         Arc::new(log.clone()),
//!         SyncConfig::from_env()?,
//!     );
//!
//!     let consumer = Consumer::new(&ctx, ConsumerOptions::new("products", "indexer"));
//!     let election = consumer.run(handler_fn(|messages, _ctx| async move {
//!         for message in &messages {
//!             tracing::info!(offset = message.offset(), "indexing");
//!         }
//!         Ok(())
//!     }));
//!
//!     let delayer = Delayer::new(&ctx, DelayerOptions::new("products"));
//!     let _delayer_election = delayer.run();
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     election.shutdown().await
//! }
//! ```

#![forbid(unsafe_code)]

pub mod barrier;
pub mod config;
pub mod constants;
pub mod consumer;
mod context;
pub mod coordination;
pub mod delayer;
pub mod election;
pub mod error;
pub mod metrics;
pub mod producer;
pub mod retry;
pub mod status;
pub mod streamer;
pub mod telemetry;
pub mod transport;

pub use config::SyncConfig;
pub use context::SyncContext;
pub use error::{Result, SyncError};

pub mod prelude {
    //! Commonly used types.
    pub use crate::barrier::{Barrier, BarrierOptions};
    pub use crate::config::SyncConfig;
    pub use crate::consumer::{BatchContext, BatchHandler, Consumer, ConsumerOptions, handler_fn};
    pub use crate::context::SyncContext;
    pub use crate::coordination::{CoordinationStore, MemoryCoordinationStore};
    pub use crate::delayer::{DelayEnvelope, Delayer, DelayerOptions};
    pub use crate::election::{LeaderElection, Role};
    pub use crate::error::{Result, SyncError};
    pub use crate::producer::{Producer, ProducerBatch};
    pub use crate::status::StatusToken;
    pub use crate::streamer::{Streamable, Streamer, TopicMap};
    pub use crate::transport::{ConsumedMessage, LogTransport, MemoryLog};

    pub use bytes;
}
