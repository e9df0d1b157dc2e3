use std::sync::Arc;

use crate::config::SyncConfig;
use crate::coordination::{ConsumerPaths, CoordinationStore};
use crate::transport::LogTransport;

/// Handles shared by every component: the coordination store, the log
/// transport and the configuration.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct SyncContext {
    store: Arc<dyn CoordinationStore>,
    transport: Arc<dyn LogTransport>,
    config: Arc<SyncConfig>,
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SyncContext {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        transport: Arc<dyn LogTransport>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            transport,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<dyn LogTransport> {
        &self.transport
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Coordination paths of a consumer triple in this context's namespace.
    pub fn consumer_paths(&self, topic: &str, partition: i32, name: &str) -> ConsumerPaths {
        ConsumerPaths::new(&self.config.namespace, topic, partition, name)
    }
}
