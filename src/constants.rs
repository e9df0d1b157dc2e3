//! Centralized defaults and protocol constants.
//!
//! # Categories
//!
//! - **Paths**: coordination store layout
//! - **Consumer**: fetch and batching defaults
//! - **Backoff**: retry intervals for the never-ending loops
//! - **Delayer**: delay queue defaults

use std::time::Duration;

// =============================================================================
// Paths
// =============================================================================

/// Root namespace for all coordination paths.
///
/// Paths look like `/<namespace>/consumer/<topic>/<partition>/<name>/offset`.
pub const DEFAULT_NAMESPACE: &str = "kafka_sync";

/// Client id reported to the log transport.
pub const DEFAULT_CLIENT_ID: &str = "kafka_sync";

/// Default seed broker for the log transport.
pub const DEFAULT_SEED_BROKER: &str = "127.0.0.1:9092";

/// Default coordination store address.
pub const DEFAULT_COORDINATION_HOSTS: &str = "127.0.0.1:2181";

/// Separator between the election id and the sequence number of a candidate node.
pub const CANDIDATE_SEPARATOR: char = '_';

/// Width of the zero-padded sequence suffix appended by the store.
pub const SEQUENCE_WIDTH: usize = 10;

// =============================================================================
// Consumer
// =============================================================================

/// Default maximum number of messages handed to a handler at once.
pub const DEFAULT_BATCH_SIZE: usize = 1_000;

/// Default bound on how long a fetch waits for new data.
pub const DEFAULT_FETCH_MAX_WAIT: Duration = Duration::from_secs(8);

/// Default connection pool size for producers.
pub const DEFAULT_PRODUCER_POOL_SIZE: usize = 5;

// =============================================================================
// Backoff
// =============================================================================

/// Default sleep after a failed consumer loop iteration.
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Default sleep after a failed election attempt.
pub const DEFAULT_ELECTION_BACKOFF: Duration = Duration::from_secs(5);

// =============================================================================
// Delayer
// =============================================================================

/// Suffix of a topic's delay companion.
pub const DELAY_TOPIC_SUFFIX: &str = "-delay";

/// Consumer name used by delayers.
pub const DELAYER_CONSUMER_NAME: &str = "delayer";

/// Batch size used by delayers.
pub const DELAYER_BATCH_SIZE: usize = 250;

/// Producer pool size used by delayers.
pub const DELAYER_POOL_SIZE: usize = 1;

/// Default delay before a delay message becomes eligible.
pub const DEFAULT_DELAY: Duration = Duration::from_secs(300);

/// Extra sleep after a message's eligibility time.
pub const DEFAULT_DELAY_SAFETY_MARGIN: Duration = Duration::from_secs(1);

// =============================================================================
// Streamer
// =============================================================================

/// Messages per producer batch in bulk streaming.
pub const STREAMER_BATCH_SIZE: usize = 250;

// =============================================================================
// Barrier
// =============================================================================

/// Default poll interval for [`Barrier::wait`](crate::barrier::Barrier::wait).
pub const DEFAULT_BARRIER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default timeout for [`Barrier::wait`](crate::barrier::Barrier::wait).
pub const DEFAULT_BARRIER_TIMEOUT: Duration = Duration::from_secs(30);
