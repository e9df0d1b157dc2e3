//! Leader election over a [`CoordinationStore`].
//!
//! Implements the sequential-ephemeral-node recipe:
//!
//! 1. every participant creates an ephemeral sequential candidate node under
//!    the election path
//! 2. the participant owning the lowest sequence number leads
//! 3. every other participant watches only its immediate predecessor, so a
//!    leader's death wakes exactly one follower
//!
//! A participant whose predecessor disappears re-checks the full candidate
//! list before taking over, because the predecessor may have been a follower
//! that simply left.
//!
//! # Role Bodies
//!
//! The leader and follower bodies are async closures receiving a fresh
//! [`StatusToken`] each time the role is (re)entered. On every transition the
//! previous token is stopped; bodies are expected to poll it and return.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kafka_sync::coordination::MemoryCoordinationStore;
//! use kafka_sync::election::LeaderElection;
//!
//! # async fn example() {
//! let store = Arc::new(MemoryCoordinationStore::new().connect());
//!
//! let election = LeaderElection::builder(store, "/jobs/reindex/leader", "host-a")
//!     .as_leader(|status| async move {
//!         while !status.is_stopping() {
//!             // ... do the work only one process may do
//!             tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//!         }
//!         Ok(())
//!     })
//!     .build();
//!
//! election.run();
//! # }
//! ```
//!
//! # Failure Handling
//!
//! Election rounds that fail are logged and retried after the election
//! backoff, forever. Every (re)connection of the store session triggers a new
//! round, which re-votes if the previous candidate node died with the old
//! session.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::constants::{DEFAULT_ELECTION_BACKOFF, SEQUENCE_WIDTH};
use crate::coordination::paths::{self, candidate_prefix};
use crate::coordination::{CoordinationStore, CreateMode, WatchReceiver};
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::retry::with_jitter;
use crate::status::StatusToken;

/// Future returned by a role body.
pub type RoleFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

type RoleBody = Arc<dyn Fn(StatusToken) -> RoleFuture + Send + Sync>;

/// Current role of a [`LeaderElection`] participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// `run` was not called yet, or the election was shut down.
    Unelected,
    /// The first vote is in progress.
    Voting,
    /// Owns the lowest sequence number.
    Leader,
    /// Waiting for its predecessor to go away.
    Follower,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Unelected => "unelected",
            Role::Voting => "voting",
            Role::Leader => "leader",
            Role::Follower => "follower",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builder for [`LeaderElection`].
pub struct LeaderElectionBuilder {
    store: Arc<dyn CoordinationStore>,
    path: String,
    value: Bytes,
    backoff: Duration,
    leader_body: Option<RoleBody>,
    follower_body: Option<RoleBody>,
}

impl LeaderElectionBuilder {
    /// Sleep between failed election rounds (jittered).
    pub fn election_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Body to run while this participant leads.
    pub fn as_leader<F, Fut>(mut self, body: F) -> Self
    where
        F: Fn(StatusToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.leader_body = Some(Arc::new(move |status| Box::pin(body(status))));
        self
    }

    /// Body to run while this participant follows.
    pub fn as_follower<F, Fut>(mut self, body: F) -> Self
    where
        F: Fn(StatusToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.follower_body = Some(Arc::new(move |status| Box::pin(body(status))));
        self
    }

    pub fn build(self) -> LeaderElection {
        let (role_tx, _) = watch::channel(Role::Unelected);
        let id = format!("{:016x}{:016x}", fastrand::u64(..), fastrand::u64(..));

        LeaderElection {
            inner: Arc::new(ElectionInner {
                store: self.store,
                path: self.path,
                value: self.value,
                id,
                backoff: self.backoff,
                leader_body: self.leader_body,
                follower_body: self.follower_body,
                state: Mutex::new(ElectionState::default()),
                tasks: SyncMutex::new(BackgroundTasks::default()),
                role_tx,
            }),
        }
    }
}

/// One participant in a leader election.
///
/// Clones refer to the same participant. Background tasks keep running after
/// the last handle is dropped; call [`shutdown`](Self::shutdown) to leave.
#[derive(Clone)]
pub struct LeaderElection {
    inner: Arc<ElectionInner>,
}

impl std::fmt::Debug for LeaderElection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElection")
            .field("path", &self.inner.path)
            .field("id", &self.inner.id)
            .field("role", &self.role())
            .finish()
    }
}

impl LeaderElection {
    /// Start building an election on `path`.
    ///
    /// `value` is stored in this participant's candidate node, usually the
    /// hostname.
    pub fn builder(
        store: Arc<dyn CoordinationStore>,
        path: impl Into<String>,
        value: impl Into<Bytes>,
    ) -> LeaderElectionBuilder {
        LeaderElectionBuilder {
            store,
            path: path.into(),
            value: value.into(),
            backoff: DEFAULT_ELECTION_BACKOFF,
            leader_body: None,
            follower_body: None,
        }
    }

    /// Start participating. Returns immediately.
    ///
    /// Spawns the first election round and a listener that starts a new
    /// round on every reconnection of the store session.
    pub fn run(&self) {
        let mut connected = self.inner.store.subscribe_connected();
        let inner = self.inner.clone();

        let reconnect = tokio::spawn(async move {
            loop {
                match connected.recv().await {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        info!(path = %inner.path, "Coordination session connected, re-electing");
                        inner.spawn_election();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        {
            let mut tasks = self.inner.tasks.lock();
            if let Some(old) = tasks.reconnect.replace(reconnect) {
                old.abort();
            }
            tasks.shut_down = false;
        }

        self.inner.role_tx.send_if_modified(|role| {
            let changed = *role == Role::Unelected;
            if changed {
                *role = Role::Voting;
            }
            changed
        });

        self.inner.spawn_election();
    }

    /// Current role.
    pub fn role(&self) -> Role {
        *self.inner.role_tx.borrow()
    }

    /// Observe role changes.
    pub fn subscribe_role(&self) -> watch::Receiver<Role> {
        self.inner.role_tx.subscribe()
    }

    /// Check the store for whether this participant currently leads.
    pub async fn is_leader(&self) -> Result<bool> {
        self.inner.is_leader().await
    }

    /// Sequence number of this participant's candidate node.
    pub async fn sequence_number(&self) -> Option<u64> {
        self.inner.state.lock().await.sequence_number
    }

    /// Random id prefixing this participant's candidate nodes.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Election path.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Leave the election.
    ///
    /// Stops the running role body, cancels background tasks and deletes the
    /// candidate node so the next participant takes over immediately.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.tasks.lock().abort_all();

        let mut state = self.inner.state.lock().await;
        state.status.stop();
        state.leader_task = None;
        state.follower_task = None;
        self.inner.role_tx.send_replace(Role::Unelected);
        metrics::IS_LEADER
            .with_label_values(&[self.inner.path.as_str()])
            .set(0);

        if let Some(sequence) = state.sequence_number.take() {
            let node = paths::join(
                &self.inner.path,
                &format!(
                    "{}{sequence:0width$}",
                    candidate_prefix(&self.inner.id),
                    width = SEQUENCE_WIDTH
                ),
            );
            match self.inner.store.delete(&node).await {
                Ok(()) | Err(SyncError::NoNode { .. }) => {}
                Err(e) => return Err(e),
            }
            info!(path = %self.inner.path, node = %node, "Left election");
        }

        Ok(())
    }
}

#[derive(Default)]
struct ElectionState {
    sequence_number: Option<u64>,
    status: StatusToken,
    leader_task: Option<JoinHandle<()>>,
    follower_task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct BackgroundTasks {
    election: Option<JoinHandle<()>>,
    watch: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    shut_down: bool,
}

impl BackgroundTasks {
    fn abort_all(&mut self) {
        self.shut_down = true;
        for task in [
            self.election.take(),
            self.watch.take(),
            self.reconnect.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

struct ElectionInner {
    store: Arc<dyn CoordinationStore>,
    path: String,
    value: Bytes,
    id: String,
    backoff: Duration,
    leader_body: Option<RoleBody>,
    follower_body: Option<RoleBody>,
    state: Mutex<ElectionState>,
    tasks: SyncMutex<BackgroundTasks>,
    role_tx: watch::Sender<Role>,
}

impl ElectionInner {
    /// Replace any running election round with a new one.
    fn spawn_election(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if tasks.shut_down {
            return;
        }
        if let Some(old) = tasks.election.take() {
            old.abort();
        }
        tasks.election = Some(tokio::spawn(self.clone().elect()));
    }

    async fn elect(self: Arc<Self>) {
        loop {
            match self.elect_once().await {
                Ok(()) => return,
                Err(e) => {
                    metrics::record_election("error");
                    error!(
                        path = %self.path,
                        error = %e,
                        "Election failed, retrying"
                    );
                    tokio::time::sleep(with_jitter(self.backoff)).await;
                }
            }

            if self.tasks.lock().shut_down {
                return;
            }
        }
    }

    async fn elect_once(self: &Arc<Self>) -> Result<()> {
        loop {
            if !self.store.exists(&self.path).await? {
                self.store.ensure_path(&self.path).await?;
            }

            let sequence = self.vote().await?;
            let nodes = self.sorted_nodes().await?;

            if nodes.first().map(|(s, _)| *s) == Some(sequence) {
                metrics::record_election("leader");
                self.become_leader().await;
                return Ok(());
            }

            metrics::record_election("follower");
            self.become_follower().await;

            let Some((_, predecessor)) = nodes.iter().rev().find(|(s, _)| *s < sequence) else {
                debug!(path = %self.path, sequence, "No predecessor, re-electing");
                continue;
            };

            let predecessor = paths::join(&self.path, predecessor);
            if self.watch_predecessor(&predecessor).await? {
                return Ok(());
            }

            debug!(path = %self.path, predecessor = %predecessor, "Predecessor vanished, re-electing");
        }
    }

    /// Make sure this participant has exactly one live candidate node.
    async fn vote(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        let children = self.store.children(&self.path).await?;
        let prefix = candidate_prefix(&self.id);

        if let Some(sequence) = state.sequence_number {
            let still_present = children.iter().any(|child| {
                child.starts_with(&prefix) && paths::sequence_number(child) == Some(sequence)
            });
            if still_present {
                return Ok(sequence);
            }
        }

        for stale in children.iter().filter(|child| child.starts_with(&prefix)) {
            match self.store.delete(&paths::join(&self.path, stale)).await {
                Ok(()) | Err(SyncError::NoNode { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let created = self
            .store
            .create(
                &paths::join(&self.path, &prefix),
                &self.value,
                CreateMode::EphemeralSequential,
            )
            .await?;

        let sequence = paths::sequence_number(&created).ok_or_else(|| {
            SyncError::Coordination(format!("Candidate node {created} has no sequence number"))
        })?;

        state.sequence_number = Some(sequence);
        debug!(path = %self.path, node = %created, "Voted");
        Ok(sequence)
    }

    /// Candidate nodes ordered by sequence number.
    async fn sorted_nodes(&self) -> Result<Vec<(u64, String)>> {
        let mut nodes: Vec<(u64, String)> = self
            .store
            .children(&self.path)
            .await?
            .into_iter()
            .filter_map(|name| paths::sequence_number(&name).map(|s| (s, name)))
            .collect();
        nodes.sort_unstable();
        Ok(nodes)
    }

    async fn is_leader(&self) -> Result<bool> {
        let Some(sequence) = self.state.lock().await.sequence_number else {
            return Ok(false);
        };
        let nodes = self.sorted_nodes().await?;
        Ok(nodes.first().map(|(s, _)| *s) == Some(sequence))
    }

    /// Watch `predecessor`. Returns false if it is already gone.
    async fn watch_predecessor(self: &Arc<Self>, predecessor: &str) -> Result<bool> {
        // Register before checking so a deletion in between is not missed.
        let rx = self.store.watch(predecessor).await?;
        if !self.store.exists(predecessor).await? {
            return Ok(false);
        }

        let task = tokio::spawn(self.clone().await_predecessor(predecessor.to_string(), rx));

        let mut tasks = self.tasks.lock();
        if tasks.shut_down {
            task.abort();
        } else if let Some(old) = tasks.watch.replace(task) {
            old.abort();
        }

        Ok(true)
    }

    async fn await_predecessor(self: Arc<Self>, predecessor: String, mut rx: WatchReceiver) {
        loop {
            match rx.await {
                Ok(event) if event.is_node_deleted() => match self.is_leader().await {
                    Ok(true) => {
                        info!(path = %self.path, predecessor = %predecessor, "Predecessor deleted, taking over");
                        self.become_leader().await;
                        return;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(path = %self.path, error = %e, "Leadership check failed");
                        break;
                    }
                },
                Ok(_) => {}
                Err(_) => {
                    debug!(path = %self.path, "Predecessor watch dropped");
                    break;
                }
            }

            match self.rearm(&predecessor).await {
                Ok(Some(next)) => rx = next,
                Ok(None) => break,
                Err(e) => {
                    warn!(path = %self.path, error = %e, "Failed to re-arm predecessor watch");
                    break;
                }
            }
        }

        self.spawn_election();
    }

    async fn rearm(&self, predecessor: &str) -> Result<Option<WatchReceiver>> {
        let rx = self.store.watch(predecessor).await?;
        Ok(self.store.exists(predecessor).await?.then_some(rx))
    }

    async fn become_leader(&self) {
        self.transition(Role::Leader).await;
    }

    async fn become_follower(&self) {
        self.transition(Role::Follower).await;
    }

    async fn transition(&self, role: Role) {
        let mut state = self.state.lock().await;
        if self.tasks.lock().shut_down {
            return;
        }

        let (body, running) = match role {
            Role::Leader => (&self.leader_body, &state.leader_task),
            _ => (&self.follower_body, &state.follower_task),
        };

        let current = *self.role_tx.borrow();
        let alive = running.as_ref().is_some_and(|task| !task.is_finished());
        if current == role && (alive || body.is_none()) {
            return;
        }

        if role == Role::Leader {
            info!(path = %self.path, "Becoming leader");
        } else {
            info!(path = %self.path, "Becoming follower");
        }

        state.status.stop();
        state.status = StatusToken::new();

        let task = body
            .as_ref()
            .map(|body| spawn_role_body(&self.path, role, body, state.status.clone()));

        match role {
            Role::Leader => {
                state.follower_task = None;
                state.leader_task = task;
            }
            _ => {
                state.leader_task = None;
                state.follower_task = task;
            }
        }

        self.role_tx.send_replace(role);
        metrics::record_role_start(&self.path, role.as_str());
    }
}

/// Run a role body in its own task and log how it ended.
fn spawn_role_body(path: &str, role: Role, body: &RoleBody, status: StatusToken) -> JoinHandle<()> {
    let path = path.to_string();
    let body = tokio::spawn(body(status));

    tokio::spawn(async move {
        match body.await {
            Ok(Ok(())) => debug!(path = %path, role = %role, "Role body finished"),
            Ok(Err(SyncError::Stopped)) => debug!(path = %path, role = %role, "Role body stopped"),
            Ok(Err(e)) => {
                metrics::ROLE_BODY_FAILURES
                    .with_label_values(&[role.as_str()])
                    .inc();
                error!(path = %path, role = %role, error = %e, "Role body failed");
            }
            Err(e) if e.is_panic() => {
                metrics::ROLE_BODY_FAILURES
                    .with_label_values(&[role.as_str()])
                    .inc();
                error!(path = %path, role = %role, "Role body panicked");
            }
            Err(_) => debug!(path = %path, role = %role, "Role body cancelled"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinationStore;

    fn election(store: &MemoryCoordinationStore, value: &str) -> LeaderElection {
        LeaderElection::builder(Arc::new(store.connect()), "/test/leader", value.to_string())
            .election_backoff(Duration::from_millis(10))
            .build()
    }

    async fn wait_for_role(election: &LeaderElection, role: Role) {
        let mut rx = election.subscribe_role();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|r| *r == role))
            .await
            .expect("role not reached in time")
            .unwrap();
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Leader.to_string(), "leader");
        assert_eq!(Role::Follower.as_str(), "follower");
    }

    #[test]
    fn test_ids_are_random_hex() {
        let store = MemoryCoordinationStore::new();
        let a = election(&store, "a");
        let b = election(&store, "b");

        assert_eq!(a.id().len(), 32);
        assert!(a.id().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_single_participant_leads() {
        let store = MemoryCoordinationStore::new();
        let election = election(&store, "host-a");
        assert_eq!(election.role(), Role::Unelected);

        election.run();
        wait_for_role(&election, Role::Leader).await;

        assert!(election.is_leader().await.unwrap());
        assert_eq!(election.sequence_number().await, Some(0));

        let children = store.children_of("/test/leader");
        assert_eq!(children.len(), 1);
        assert!(children[0].starts_with(election.id()));
        assert_eq!(
            store.data(&format!("/test/leader/{}", children[0])),
            Some(Bytes::from("host-a"))
        );
    }

    #[tokio::test]
    async fn test_vote_reuses_live_node() {
        let store = MemoryCoordinationStore::new();
        let election = election(&store, "host-a");
        election.run();
        wait_for_role(&election, Role::Leader).await;

        let first = election.inner.vote().await.unwrap();
        let second = election.inner.vote().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.children_of("/test/leader").len(), 1);
    }

    #[tokio::test]
    async fn test_vote_replaces_stale_nodes() {
        let store = MemoryCoordinationStore::new();
        let election = election(&store, "host-a");
        election.run();
        wait_for_role(&election, Role::Leader).await;

        // A leftover node with our prefix that we no longer track.
        let stale = format!("/test/leader/{}9999999999", candidate_prefix(election.id()));
        let session = store.connect();
        session
            .create(&stale, b"", CreateMode::Persistent)
            .await
            .unwrap();
        election.inner.state.lock().await.sequence_number = None;

        election.inner.vote().await.unwrap();

        let children = store.children_of("/test/leader");
        assert_eq!(children.len(), 1);
        assert!(!store.contains(&stale));
    }

    #[tokio::test]
    async fn test_shutdown_deletes_candidate() {
        let store = MemoryCoordinationStore::new();
        let election = election(&store, "host-a");
        election.run();
        wait_for_role(&election, Role::Leader).await;

        election.shutdown().await.unwrap();

        assert_eq!(election.role(), Role::Unelected);
        assert!(store.children_of("/test/leader").is_empty());
        assert_eq!(election.sequence_number().await, None);
    }
}
