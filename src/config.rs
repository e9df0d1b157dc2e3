//! Runtime configuration.
//!
//! [`SyncConfig`] carries everything the election, consumer and delayer loops
//! need besides the two backends themselves. Build it with
//! [`SyncConfig::default`] and struct update syntax, or from the environment:
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `KAFKA_SYNC_SEED_BROKERS` | `seed_brokers` (comma separated) | `127.0.0.1:9092` |
//! | `KAFKA_SYNC_ZK_HOSTS` | `coordination_hosts` | `127.0.0.1:2181` |
//! | `KAFKA_SYNC_NAMESPACE` | `namespace` | `kafka_sync` |
//! | `KAFKA_SYNC_CLIENT_ID` | `client_id` | `kafka_sync` |
//! | `HOSTNAME` | `identity` | `unknown-host` |
//! | `KAFKA_SYNC_BATCH_SIZE` | `default_batch_size` | 1000 |
//! | `KAFKA_SYNC_FETCH_MAX_WAIT_SECS` | `fetch_max_wait` | 8 |
//! | `KAFKA_SYNC_ERROR_BACKOFF_SECS` | `error_backoff` | 5 |
//! | `KAFKA_SYNC_ELECTION_BACKOFF_SECS` | `election_backoff` | 5 |
//! | `KAFKA_SYNC_PRODUCER_POOL_SIZE` | `producer_pool_size` | 5 |

use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_CLIENT_ID, DEFAULT_COORDINATION_HOSTS, DEFAULT_DELAY_SAFETY_MARGIN,
    DEFAULT_ELECTION_BACKOFF, DEFAULT_ERROR_BACKOFF, DEFAULT_FETCH_MAX_WAIT, DEFAULT_NAMESPACE,
    DEFAULT_PRODUCER_POOL_SIZE, DEFAULT_SEED_BROKER,
};
use crate::error::{Result, SyncError};

const UNKNOWN_IDENTITY: &str = "unknown-host";

/// Configuration shared by all components built from one
/// [`SyncContext`](crate::SyncContext).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Brokers used to bootstrap the log transport.
    ///
    /// Not read by this crate; passed to the application's
    /// [`LogTransport`](crate::transport::LogTransport) constructor.
    pub seed_brokers: Vec<String>,

    /// Coordination store connection string.
    ///
    /// Not read by this crate; passed to the application's
    /// [`CoordinationStore`](crate::coordination::CoordinationStore) constructor.
    pub coordination_hosts: String,

    /// Root of all coordination paths.
    pub namespace: String,

    /// Client id reported to the log transport.
    ///
    /// Not read by this crate, like `seed_brokers`.
    pub client_id: String,

    /// Value stored in election candidate nodes.
    pub identity: String,

    /// Batch size for consumers that do not set their own.
    pub default_batch_size: usize,

    /// Upper bound on one fetch's wait for new data.
    pub fetch_max_wait: Duration,

    /// Sleep after a failed consumer loop iteration.
    pub error_backoff: Duration,

    /// Sleep after a failed election attempt.
    pub election_backoff: Duration,

    /// Extra sleep past a delay message's eligibility time.
    pub delay_safety_margin: Duration,

    /// Producer connection pool size.
    pub producer_pool_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            seed_brokers: vec![DEFAULT_SEED_BROKER.to_string()],
            coordination_hosts: DEFAULT_COORDINATION_HOSTS.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            identity: UNKNOWN_IDENTITY.to_string(),
            default_batch_size: DEFAULT_BATCH_SIZE,
            fetch_max_wait: DEFAULT_FETCH_MAX_WAIT,
            error_backoff: DEFAULT_ERROR_BACKOFF,
            election_backoff: DEFAULT_ELECTION_BACKOFF,
            delay_safety_margin: DEFAULT_DELAY_SAFETY_MARGIN,
            producer_pool_size: DEFAULT_PRODUCER_POOL_SIZE,
        }
    }
}

impl SyncConfig {
    /// Build a configuration from environment variables.
    ///
    /// Unset variables keep their defaults. Malformed values and values that
    /// fail [`validate`](Self::validate) are rejected.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let seed_brokers = match env_string("KAFKA_SYNC_SEED_BROKERS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => defaults.seed_brokers,
        };

        let config = Self {
            seed_brokers,
            coordination_hosts: env_string("KAFKA_SYNC_ZK_HOSTS")
                .unwrap_or(defaults.coordination_hosts),
            namespace: env_string("KAFKA_SYNC_NAMESPACE").unwrap_or(defaults.namespace),
            client_id: env_string("KAFKA_SYNC_CLIENT_ID").unwrap_or(defaults.client_id),
            identity: env_string("HOSTNAME").unwrap_or(defaults.identity),
            default_batch_size: env_parse("KAFKA_SYNC_BATCH_SIZE")?
                .unwrap_or(defaults.default_batch_size),
            fetch_max_wait: env_secs("KAFKA_SYNC_FETCH_MAX_WAIT_SECS")?
                .unwrap_or(defaults.fetch_max_wait),
            error_backoff: env_secs("KAFKA_SYNC_ERROR_BACKOFF_SECS")?
                .unwrap_or(defaults.error_backoff),
            election_backoff: env_secs("KAFKA_SYNC_ELECTION_BACKOFF_SECS")?
                .unwrap_or(defaults.election_backoff),
            delay_safety_margin: defaults.delay_safety_margin,
            producer_pool_size: env_parse("KAFKA_SYNC_PRODUCER_POOL_SIZE")?
                .unwrap_or(defaults.producer_pool_size),
        };

        config
            .validate()
            .map_err(|errors| SyncError::Config(errors.join("; ")))?;

        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// Returns all problems at once.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.seed_brokers.is_empty() {
            errors.push("seed_brokers must not be empty".to_string());
        }

        if self.coordination_hosts.trim().is_empty() {
            errors.push("coordination_hosts must not be empty".to_string());
        }

        let namespace = self.namespace.trim_matches('/');
        if namespace.is_empty() {
            errors.push("namespace must not be empty".to_string());
        } else if namespace.split('/').any(str::is_empty) {
            errors.push(format!(
                "namespace ({:?}) must not contain empty path components",
                self.namespace
            ));
        }

        if self.identity.is_empty() {
            errors.push("identity must not be empty".to_string());
        }

        if self.default_batch_size == 0 {
            errors.push("default_batch_size must be greater than 0".to_string());
        }

        if self.fetch_max_wait.is_zero() {
            errors.push("fetch_max_wait must be greater than 0".to_string());
        }

        if self.error_backoff.is_zero() {
            errors.push("error_backoff must be greater than 0".to_string());
        }

        if self.election_backoff.is_zero() {
            errors.push("election_backoff must be greater than 0".to_string());
        }

        if self.producer_pool_size == 0 {
            errors.push("producer_pool_size must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_string(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| SyncError::Config(format!("Invalid {}: {}", key, e)))
        })
        .transpose()
}

fn env_secs(key: &str) -> Result<Option<Duration>> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();

        assert_eq!(config.seed_brokers, vec!["127.0.0.1:9092".to_string()]);
        assert_eq!(config.coordination_hosts, "127.0.0.1:2181");
        assert_eq!(config.namespace, "kafka_sync");
        assert_eq!(config.default_batch_size, 1000);
        assert_eq!(config.fetch_max_wait, Duration::from_secs(8));
        assert_eq!(config.error_backoff, Duration::from_secs(5));
        assert_eq!(config.election_backoff, Duration::from_secs(5));
        assert_eq!(config.delay_safety_margin, Duration::from_secs(1));
        assert_eq!(config.producer_pool_size, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let config = SyncConfig {
            seed_brokers: Vec::new(),
            namespace: "/".to_string(),
            default_batch_size: 0,
            producer_pool_size: 0,
            ..Default::default()
        };

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("seed_brokers")));
        assert!(errors.iter().any(|e| e.contains("namespace")));
        assert!(errors.iter().any(|e| e.contains("default_batch_size")));
        assert!(errors.iter().any(|e| e.contains("producer_pool_size")));
    }

    #[test]
    fn test_nested_namespace_is_valid() {
        let config = SyncConfig {
            namespace: "apps/search".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let config = SyncConfig {
            namespace: "apps//search".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_backoffs_are_rejected() {
        let config = SyncConfig {
            error_backoff: Duration::ZERO,
            election_backoff: Duration::ZERO,
            ..Default::default()
        };

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("error_backoff")));
        assert!(errors.iter().any(|e| e.contains("election_backoff")));
    }
}
