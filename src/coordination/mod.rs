//! Coordination store abstraction.
//!
//! The election and the offset bookkeeping only need a small hierarchical
//! key space with ZooKeeper-like semantics:
//!
//! - nodes addressed by `/`-separated paths, parents must exist
//! - **ephemeral** nodes that vanish with the session that created them
//! - **sequential** nodes whose names get a monotonically increasing,
//!   zero-padded suffix assigned by the store
//! - one-shot **watches** on a single path
//! - a notification whenever the session (re)connects
//!
//! # Available Implementations
//!
//! - [`MemoryCoordinationStore`]: in-process store with real session,
//!   ephemeral, sequential and watch semantics; used by the test-suite and
//!   for single-process deployments.
//!
//! Production deployments implement [`CoordinationStore`] on top of their
//! ZooKeeper (or etcd/Consul) client and pass it in through
//! [`SyncContext`](crate::SyncContext).

pub mod memory;
pub mod paths;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, oneshot};

use crate::error::{Result, SyncError};

pub use memory::{MemoryCoordinationStore, MemorySession};
pub use paths::ConsumerPaths;

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session.
    Persistent,
    /// Deleted when the creating session ends.
    Ephemeral,
    /// Persistent, with a store-assigned sequence suffix.
    PersistentSequential,
    /// Ephemeral, with a store-assigned sequence suffix.
    EphemeralSequential,
}

impl CreateMode {
    /// Returns true if the node is bound to the creating session.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    /// Returns true if the store appends a sequence number to the name.
    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Change reported by a one-shot watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    /// The watched node was created.
    NodeCreated,
    /// The watched node was deleted.
    NodeDeleted,
    /// The watched node's data changed.
    NodeDataChanged,
}

impl WatchEvent {
    /// Returns true for deletions.
    #[inline]
    pub fn is_node_deleted(&self) -> bool {
        matches!(self, WatchEvent::NodeDeleted)
    }
}

/// One-shot watch registration.
///
/// The sender side is dropped without an event when the session ends, which
/// callers must treat like "state unknown, re-evaluate".
pub type WatchReceiver = oneshot::Receiver<WatchEvent>;

/// Hierarchical coordination store used for elections and committed offsets.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Check whether a node exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Create a node and return the path that was actually created.
    ///
    /// For sequential modes the returned path carries the sequence suffix.
    /// Fails with [`SyncError::NoNode`] if the parent is missing and with
    /// [`SyncError::NodeExists`] if the node is already there.
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String>;

    /// List the names (not full paths) of a node's children.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Delete a node without children.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Read a node's data.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Overwrite a node's data. Fails with [`SyncError::NoNode`] if missing.
    async fn set(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Register a one-shot watch on `path`.
    ///
    /// The watch fires on the next creation, deletion or data change of the
    /// node, whether or not the node exists at registration time.
    async fn watch(&self, path: &str) -> Result<WatchReceiver>;

    /// Subscribe to (re)connection notifications.
    fn subscribe_connected(&self) -> broadcast::Receiver<()>;

    /// Create `path` and all missing ancestors as empty persistent nodes.
    ///
    /// Concurrent creators are tolerated.
    async fn ensure_path(&self, path: &str) -> Result<()> {
        if self.exists(path).await? {
            return Ok(());
        }

        let mut current = String::with_capacity(path.len());
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current.push('/');
            current.push_str(component);

            match self.create(&current, &[], CreateMode::Persistent).await {
                Ok(_) | Err(SyncError::NodeExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}
