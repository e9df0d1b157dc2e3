//! Prometheus metrics for elections, consumers, producers and delayers.
//!
//! All metrics are registered to a custom registry with the `kafka_sync`
//! prefix so they never collide with metrics of the embedding application.
//! Registration errors are handled gracefully: if a metric fails to register,
//! an unregistered metric is used instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Registry, TextEncoder, opts};
use tracing::warn;

/// Custom Prometheus registry for kafka-sync metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("kafka_sync".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================

macro_rules! define_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> = Lazy::new(|| {
            register_int_gauge_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

// =============================================================================
// Election metrics
// =============================================================================

define_counter_vec!(
    ELECTIONS,
    "elections_total",
    "Election rounds by outcome",
    ["outcome"]
);
define_counter_vec!(
    ROLE_TRANSITIONS,
    "role_transitions_total",
    "Role bodies started, by role",
    ["role"]
);
define_counter_vec!(
    ROLE_BODY_FAILURES,
    "role_body_failures_total",
    "Role bodies that returned an error or panicked",
    ["role"]
);
define_gauge_vec!(
    IS_LEADER,
    "is_leader",
    "Whether this process currently leads a coordination path",
    ["path"]
);

// =============================================================================
// Consumer metrics
// =============================================================================

define_counter_vec!(
    MESSAGES_CONSUMED,
    "messages_consumed_total",
    "Messages handed to batch handlers",
    ["topic", "name"]
);
define_counter_vec!(
    OFFSETS_COMMITTED,
    "offsets_committed_total",
    "Offset commits written to the coordination store",
    ["topic", "name"]
);
define_gauge_vec!(
    COMMITTED_OFFSET,
    "committed_offset",
    "Last committed offset",
    ["topic", "partition", "name"]
);
define_counter_vec!(
    LOOP_ERRORS,
    "loop_errors_total",
    "Failed consumer loop iterations by error kind",
    ["topic", "name", "kind"]
);

// =============================================================================
// Producer and delayer metrics
// =============================================================================

define_counter_vec!(
    MESSAGES_PRODUCED,
    "messages_produced_total",
    "Messages delivered to the log",
    ["topic"]
);
define_counter_vec!(
    MESSAGES_DELAYED,
    "messages_delayed_total",
    "Delay messages republished to their target topic",
    ["topic"]
);
define_counter_vec!(
    DELAY_SLEEPS,
    "delay_sleeps_total",
    "Times a delayer slept until a message became eligible",
    ["topic"]
);
define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Bounded retry attempts by policy",
    ["policy"]
);

// =============================================================================
// Registration
// =============================================================================

fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGaugeVec metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

/// Encode all metrics in the Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// =============================================================================
// Recording helpers
// =============================================================================

/// Record the outcome of one election round.
pub fn record_election(outcome: &str) {
    ELECTIONS.with_label_values(&[outcome]).inc();
}

/// Record a role body start and update the leadership gauge.
pub fn record_role_start(path: &str, role: &str) {
    ROLE_TRANSITIONS.with_label_values(&[role]).inc();
    IS_LEADER
        .with_label_values(&[path])
        .set(i64::from(role == "leader"));
}

/// Record a commit of `offset` for a consumer triple.
pub fn record_commit(topic: &str, partition: i32, name: &str, offset: i64) {
    OFFSETS_COMMITTED.with_label_values(&[topic, name]).inc();
    COMMITTED_OFFSET
        .with_label_values(&[topic, &partition.to_string(), name])
        .set(offset);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_prefixed_names() {
        record_election("leader");
        MESSAGES_PRODUCED.with_label_values(&["metrics-test"]).inc_by(3);

        let text = encode_metrics().unwrap();
        assert!(text.contains("kafka_sync_elections_total"));
        assert!(text.contains("kafka_sync_messages_produced_total{topic=\"metrics-test\"} 3"));
    }

    #[test]
    fn test_role_start_sets_leader_gauge() {
        record_role_start("/metrics/test/leader", "leader");
        assert_eq!(IS_LEADER.with_label_values(&["/metrics/test/leader"]).get(), 1);

        record_role_start("/metrics/test/leader", "follower");
        assert_eq!(IS_LEADER.with_label_values(&["/metrics/test/leader"]).get(), 0);
    }

    #[test]
    fn test_record_commit_tracks_last_offset() {
        record_commit("metrics-commit", 2, "idx", 41);
        record_commit("metrics-commit", 2, "idx", 42);

        assert_eq!(
            COMMITTED_OFFSET
                .with_label_values(&["metrics-commit", "2", "idx"])
                .get(),
            42
        );
    }
}
