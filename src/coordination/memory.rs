//! In-memory coordination store.
//!
//! [`MemoryCoordinationStore`] is the shared "ensemble"; every call to
//! [`MemoryCoordinationStore::connect`] opens a [`MemorySession`], which is
//! what elections and consumers talk to. Sessions behave like ZooKeeper
//! sessions:
//!
//! - ephemeral nodes belong to the session that created them and are deleted
//!   (firing watches) when it is [closed](MemorySession::close)
//! - a [disconnected](MemorySession::disconnect) session rejects every
//!   operation with [`SyncError::Disconnected`] but keeps its nodes
//! - [`MemorySession::reconnect`] re-establishes the session (with a new
//!   identity if it was closed) and notifies `subscribe_connected` listeners
//!
//! # Usage
//!
//! ```rust
//! use kafka_sync::coordination::{CoordinationStore, CreateMode, MemoryCoordinationStore};
//!
//! # #[tokio::main]
//! # async fn main() -> kafka_sync::Result<()> {
//! let ensemble = MemoryCoordinationStore::new();
//! let session = ensemble.connect();
//!
//! session.ensure_path("/election").await?;
//! let node = session
//!     .create("/election/n_", b"host-a", CreateMode::EphemeralSequential)
//!     .await?;
//! assert_eq!(node, "/election/n_0000000000");
//!
//! session.close();
//! assert!(!ensemble.contains(&node));
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

use super::paths;
use super::{CoordinationStore, CreateMode, WatchEvent, WatchReceiver};
use crate::constants::SEQUENCE_WIDTH;
use crate::error::{Result, SyncError};

type SessionId = u64;

/// A stored node.
#[derive(Debug, Clone)]
struct Node {
    data: Bytes,
    /// Owning session for ephemeral nodes.
    owner: Option<SessionId>,
    /// Next sequence number handed to a sequential child.
    next_sequence: u64,
}

impl Node {
    fn new(data: Bytes, owner: Option<SessionId>) -> Self {
        Self {
            data,
            owner,
            next_sequence: 0,
        }
    }
}

/// Pending one-shot watch.
#[derive(Debug)]
struct Watch {
    session: SessionId,
    tx: oneshot::Sender<WatchEvent>,
}

/// State shared by all sessions of one ensemble.
#[derive(Debug)]
struct EnsembleState {
    nodes: BTreeMap<String, Node>,
    watches: HashMap<String, Vec<Watch>>,
    next_session_id: SessionId,
}

impl EnsembleState {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(Bytes::new(), None));
        Self {
            nodes,
            watches: HashMap::new(),
            next_session_id: 1,
        }
    }

    fn allocate_session(&mut self) -> SessionId {
        let id = self.next_session_id;
        self.next_session_id += 1;
        id
    }

    fn fire(&mut self, path: &str, event: WatchEvent) {
        if let Some(watches) = self.watches.remove(path) {
            for watch in watches {
                let _ = watch.tx.send(event);
            }
        }
    }

    fn child_names(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };

        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn remove(&mut self, path: &str) {
        if self.nodes.remove(path).is_some() {
            self.fire(path, WatchEvent::NodeDeleted);
        }
    }
}

/// Connection status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStatus {
    Connected,
    Disconnected,
    Closed,
}

#[derive(Debug)]
struct SessionState {
    id: SessionId,
    status: SessionStatus,
}

/// Shared in-memory coordination ensemble.
#[derive(Debug, Clone)]
pub struct MemoryCoordinationStore {
    state: Arc<Mutex<EnsembleState>>,
}

impl Default for MemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinationStore {
    /// Create an empty ensemble containing only the root node.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EnsembleState::new())),
        }
    }

    /// Open a new session.
    pub fn connect(&self) -> MemorySession {
        let id = self.state.lock().allocate_session();
        let (connected_tx, _) = broadcast::channel(16);
        MemorySession {
            ensemble: self.state.clone(),
            session: Arc::new(Mutex::new(SessionState {
                id,
                status: SessionStatus::Connected,
            })),
            connected_tx,
        }
    }

    /// Check whether a node exists, bypassing sessions.
    pub fn contains(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(path)
    }

    /// Read a node's data, bypassing sessions.
    pub fn data(&self, path: &str) -> Option<Bytes> {
        self.state.lock().nodes.get(path).map(|n| n.data.clone())
    }

    /// List a node's children, bypassing sessions.
    pub fn children_of(&self, path: &str) -> Vec<String> {
        self.state.lock().child_names(path)
    }

    /// Total number of nodes, including the root.
    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    /// Remove a node as an operator would, firing its watches.
    pub fn force_delete(&self, path: &str) -> bool {
        let mut state = self.state.lock();
        let existed = state.nodes.contains_key(path);
        state.remove(path);
        existed
    }
}

/// A session on a [`MemoryCoordinationStore`].
///
/// Clones share the same session.
#[derive(Debug, Clone)]
pub struct MemorySession {
    ensemble: Arc<Mutex<EnsembleState>>,
    session: Arc<Mutex<SessionState>>,
    connected_tx: broadcast::Sender<()>,
}

impl MemorySession {
    /// Current session id.
    pub fn session_id(&self) -> u64 {
        self.session.lock().id
    }

    /// Returns true if operations are currently accepted.
    pub fn is_connected(&self) -> bool {
        self.session.lock().status == SessionStatus::Connected
    }

    /// Lose the connection without losing the session.
    pub fn disconnect(&self) {
        let mut session = self.session.lock();
        if session.status == SessionStatus::Connected {
            session.status = SessionStatus::Disconnected;
            debug!(session = session.id, "Memory session disconnected");
        }
    }

    /// End the session: its ephemeral nodes are deleted and its watches dropped.
    pub fn close(&self) {
        let id = {
            let mut session = self.session.lock();
            if session.status == SessionStatus::Closed {
                return;
            }
            session.status = SessionStatus::Closed;
            session.id
        };

        let mut state = self.ensemble.lock();
        let owned: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(id))
            .map(|(path, _)| path.clone())
            .collect();

        for path in &owned {
            state.remove(path);
        }

        for watches in state.watches.values_mut() {
            watches.retain(|w| w.session != id);
        }
        state.watches.retain(|_, watches| !watches.is_empty());

        debug!(
            session = id,
            ephemeral_nodes = owned.len(),
            "Memory session closed"
        );
    }

    /// Re-establish the session and notify reconnection listeners.
    ///
    /// A closed session comes back with a fresh id and no ephemeral nodes.
    pub fn reconnect(&self) {
        {
            let mut session = self.session.lock();
            if session.status == SessionStatus::Closed {
                session.id = self.ensemble.lock().allocate_session();
            }
            session.status = SessionStatus::Connected;
            debug!(session = session.id, "Memory session connected");
        }

        let _ = self.connected_tx.send(());
    }

    fn live_session(&self) -> Result<SessionId> {
        let session = self.session.lock();
        match session.status {
            SessionStatus::Connected => Ok(session.id),
            SessionStatus::Disconnected | SessionStatus::Closed => Err(SyncError::Disconnected),
        }
    }

    fn check_path(path: &str) -> Result<()> {
        if paths::is_valid_path(path) {
            Ok(())
        } else {
            Err(SyncError::Coordination(format!("Invalid path {path:?}")))
        }
    }
}

#[async_trait]
impl CoordinationStore for MemorySession {
    async fn exists(&self, path: &str) -> Result<bool> {
        Self::check_path(path)?;
        self.live_session()?;
        Ok(self.ensemble.lock().nodes.contains_key(path))
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        Self::check_path(path)?;
        let session = self.live_session()?;

        let parent = paths::parent(path).ok_or_else(|| SyncError::NodeExists {
            path: path.to_string(),
        })?;

        let mut state = self.ensemble.lock();

        let parent_node = state
            .nodes
            .get_mut(parent)
            .ok_or_else(|| SyncError::NoNode {
                path: parent.to_string(),
            })?;

        if parent_node.owner.is_some() {
            return Err(SyncError::Coordination(format!(
                "Ephemeral node {parent} cannot have children"
            )));
        }

        let actual = if mode.is_sequential() {
            let sequence = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            format!("{path}{sequence:0width$}", width = SEQUENCE_WIDTH)
        } else {
            path.to_string()
        };

        if state.nodes.contains_key(&actual) {
            return Err(SyncError::NodeExists { path: actual });
        }

        let owner = mode.is_ephemeral().then_some(session);
        state
            .nodes
            .insert(actual.clone(), Node::new(Bytes::copy_from_slice(data), owner));
        state.fire(&actual, WatchEvent::NodeCreated);

        Ok(actual)
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        Self::check_path(path)?;
        self.live_session()?;

        let state = self.ensemble.lock();
        if !state.nodes.contains_key(path) {
            return Err(SyncError::NoNode {
                path: path.to_string(),
            });
        }
        Ok(state.child_names(path))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        Self::check_path(path)?;
        self.live_session()?;

        let mut state = self.ensemble.lock();
        if path == "/" || !state.nodes.contains_key(path) {
            return Err(SyncError::NoNode {
                path: path.to_string(),
            });
        }
        if !state.child_names(path).is_empty() {
            return Err(SyncError::NotEmpty {
                path: path.to_string(),
            });
        }

        state.remove(path);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        Self::check_path(path)?;
        self.live_session()?;

        self.ensemble
            .lock()
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| SyncError::NoNode {
                path: path.to_string(),
            })
    }

    async fn set(&self, path: &str, data: &[u8]) -> Result<()> {
        Self::check_path(path)?;
        self.live_session()?;

        let mut state = self.ensemble.lock();
        let node = state.nodes.get_mut(path).ok_or_else(|| SyncError::NoNode {
            path: path.to_string(),
        })?;
        node.data = Bytes::copy_from_slice(data);
        state.fire(path, WatchEvent::NodeDataChanged);
        Ok(())
    }

    async fn watch(&self, path: &str) -> Result<WatchReceiver> {
        Self::check_path(path)?;
        let session = self.live_session()?;

        let (tx, rx) = oneshot::channel();
        self.ensemble
            .lock()
            .watches
            .entry(path.to_string())
            .or_default()
            .push(Watch { session, tx });
        Ok(rx)
    }

    fn subscribe_connected(&self) -> broadcast::Receiver<()> {
        self.connected_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_requires_parent() {
        let session = MemoryCoordinationStore::new().connect();

        let err = session
            .create("/a/b", b"", CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(err.is_no_node());

        session.create("/a", b"", CreateMode::Persistent).await.unwrap();
        session.create("/a/b", b"x", CreateMode::Persistent).await.unwrap();
        assert_eq!(session.get("/a/b").await.unwrap(), Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn test_create_existing_node_fails() {
        let session = MemoryCoordinationStore::new().connect();
        session.create("/a", b"", CreateMode::Persistent).await.unwrap();

        let err = session
            .create("/a", b"", CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NodeExists { .. }));
    }

    #[tokio::test]
    async fn test_sequential_nodes_are_monotonic() {
        let session = MemoryCoordinationStore::new().connect();
        session.ensure_path("/e").await.unwrap();

        let first = session
            .create("/e/a_", b"", CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let second = session
            .create("/e/b_", b"", CreateMode::EphemeralSequential)
            .await
            .unwrap();

        assert_eq!(first, "/e/a_0000000000");
        assert_eq!(second, "/e/b_0000000001");

        session.delete(&first).await.unwrap();
        let third = session
            .create("/e/a_", b"", CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert_eq!(third, "/e/a_0000000002");
    }

    #[tokio::test]
    async fn test_ensure_path_is_idempotent() {
        let store = MemoryCoordinationStore::new();
        let session = store.connect();

        session.ensure_path("/x/y/z").await.unwrap();
        session.ensure_path("/x/y/z").await.unwrap();

        assert!(store.contains("/x"));
        assert!(store.contains("/x/y"));
        assert!(store.contains("/x/y/z"));
        assert_eq!(store.node_count(), 4);
    }

    #[tokio::test]
    async fn test_children_lists_direct_children_only() {
        let session = MemoryCoordinationStore::new().connect();
        session.ensure_path("/p/a/deep").await.unwrap();
        session.ensure_path("/p/b").await.unwrap();
        session.ensure_path("/pp").await.unwrap();

        let mut children = session.children("/p").await.unwrap();
        children.sort();
        assert_eq!(children, vec!["a".to_string(), "b".to_string()]);

        assert!(session.children("/missing").await.unwrap_err().is_no_node());
    }

    #[tokio::test]
    async fn test_delete_rejects_non_empty() {
        let session = MemoryCoordinationStore::new().connect();
        session.ensure_path("/p/c").await.unwrap();

        let err = session.delete("/p").await.unwrap_err();
        assert!(matches!(err, SyncError::NotEmpty { .. }));

        session.delete("/p/c").await.unwrap();
        session.delete("/p").await.unwrap();
        assert!(session.delete("/p").await.unwrap_err().is_no_node());
    }

    #[tokio::test]
    async fn test_set_missing_node() {
        let session = MemoryCoordinationStore::new().connect();
        let err = session.set("/nope", b"1").await.unwrap_err();
        assert!(err.is_no_node());
    }

    #[tokio::test]
    async fn test_close_removes_ephemeral_nodes() {
        let store = MemoryCoordinationStore::new();
        let owner = store.connect();
        let other = store.connect();

        owner.ensure_path("/e").await.unwrap();
        let ephemeral = owner
            .create("/e/n_", b"", CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let persistent = other
            .create("/e/keep", b"", CreateMode::Persistent)
            .await
            .unwrap();

        owner.close();

        assert!(!store.contains(&ephemeral));
        assert!(store.contains(&persistent));
        assert!(matches!(
            owner.exists("/e").await.unwrap_err(),
            SyncError::Disconnected
        ));
    }

    #[tokio::test]
    async fn test_watch_fires_once_on_delete() {
        let store = MemoryCoordinationStore::new();
        let watcher = store.connect();
        let owner = store.connect();

        owner.ensure_path("/e").await.unwrap();
        let node = owner
            .create("/e/n_", b"", CreateMode::EphemeralSequential)
            .await
            .unwrap();

        let rx = watcher.watch(&node).await.unwrap();
        owner.close();

        assert_eq!(rx.await.unwrap(), WatchEvent::NodeDeleted);
    }

    #[tokio::test]
    async fn test_watch_fires_on_create_and_data_change() {
        let session = MemoryCoordinationStore::new().connect();

        let created = session.watch("/w").await.unwrap();
        session.create("/w", b"", CreateMode::Persistent).await.unwrap();
        assert_eq!(created.await.unwrap(), WatchEvent::NodeCreated);

        let changed = session.watch("/w").await.unwrap();
        session.set("/w", b"1").await.unwrap();
        assert_eq!(changed.await.unwrap(), WatchEvent::NodeDataChanged);
    }

    #[tokio::test]
    async fn test_closing_watcher_drops_its_watches() {
        let store = MemoryCoordinationStore::new();
        let watcher = store.connect();
        let writer = store.connect();

        let rx = watcher.watch("/w").await.unwrap();
        watcher.close();
        writer.create("/w", b"", CreateMode::Persistent).await.unwrap();

        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect() {
        let store = MemoryCoordinationStore::new();
        let session = store.connect();
        let mut connected = session.subscribe_connected();

        session.ensure_path("/e").await.unwrap();
        let node = session
            .create("/e/n", b"", CreateMode::Ephemeral)
            .await
            .unwrap();

        session.disconnect();
        assert!(!session.is_connected());
        assert!(matches!(
            session.get("/e").await.unwrap_err(),
            SyncError::Disconnected
        ));
        assert!(store.contains(&node));

        session.reconnect();
        connected.recv().await.unwrap();
        assert!(session.exists(&node).await.unwrap());
    }

    #[tokio::test]
    async fn test_reconnect_after_close_gets_new_session() {
        let store = MemoryCoordinationStore::new();
        let session = store.connect();
        let first_id = session.session_id();

        session.close();
        session.reconnect();

        assert_ne!(session.session_id(), first_id);
        assert!(session.exists("/").await.unwrap());
    }

    #[tokio::test]
    async fn test_ephemeral_nodes_cannot_have_children() {
        let session = MemoryCoordinationStore::new().connect();
        session.create("/e", b"", CreateMode::Ephemeral).await.unwrap();

        let err = session
            .create("/e/child", b"", CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Coordination(_)));
    }

    #[tokio::test]
    async fn test_invalid_paths_are_rejected() {
        let session = MemoryCoordinationStore::new().connect();
        assert!(session.exists("relative").await.is_err());
        assert!(session.get("/trailing/").await.is_err());
    }
}
