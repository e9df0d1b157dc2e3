//! Integration tests for LeaderElection against the in-memory coordination store.
//!
//! These cover the election recipe end to end:
//! - first candidate leads, later candidates follow
//! - a follower takes over only when its predecessor goes away and it is then
//!   the lowest candidate
//! - session loss, reconnection and shutdown

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use kafka_sync::coordination::{MemoryCoordinationStore, MemorySession};
use kafka_sync::election::{LeaderElection, Role};
use parking_lot::Mutex;

const PATH: &str = "/kafka_sync/consumer/products/0/indexer/leader";

type Events = Arc<Mutex<Vec<String>>>;

/// A participant whose bodies record start/stop events.
fn participant(store: &MemoryCoordinationStore, name: &str, events: &Events) -> (LeaderElection, MemorySession) {
    let session = store.connect();

    let leader_events = events.clone();
    let leader_name = name.to_string();
    let follower_events = events.clone();
    let follower_name = name.to_string();

    let election = LeaderElection::builder(Arc::new(session.clone()), PATH, name.to_string())
        .election_backoff(Duration::from_millis(20))
        .as_leader(move |status| {
            let events = leader_events.clone();
            let name = leader_name.clone();
            async move {
                events.lock().push(format!("{name} leads"));
                status.stopped().await;
                events.lock().push(format!("{name} stops leading"));
                Ok(())
            }
        })
        .as_follower(move |status| {
            let events = follower_events.clone();
            let name = follower_name.clone();
            async move {
                events.lock().push(format!("{name} follows"));
                status.stopped().await;
                Ok(())
            }
        })
        .build();

    (election, session)
}

async fn wait_for_role(election: &LeaderElection, role: Role) {
    let mut rx = election.subscribe_role();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|r| *r == role))
        .await
        .unwrap_or_else(|_| panic!("{} did not become {role}", election.id()))
        .unwrap();
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

fn has_event(events: &Events, event: &str) -> bool {
    events.lock().iter().any(|e| e == event)
}

// ============================================================================
// Basic Election
// ============================================================================

#[tokio::test]
async fn test_first_candidate_leads_second_follows() {
    let store = MemoryCoordinationStore::new();
    let events = Events::default();

    let (a, _sa) = participant(&store, "a", &events);
    a.run();
    wait_for_role(&a, Role::Leader).await;

    let (b, _sb) = participant(&store, "b", &events);
    b.run();
    wait_for_role(&b, Role::Follower).await;

    assert!(a.is_leader().await.unwrap());
    assert!(!b.is_leader().await.unwrap());
    assert!(a.sequence_number().await < b.sequence_number().await);

    eventually(|| has_event(&events, "a leads") && has_event(&events, "b follows")).await;
    assert!(!has_event(&events, "b leads"));
    assert_eq!(store.children_of(PATH).len(), 2);
}

#[tokio::test]
async fn test_leader_body_runs_once_per_term() {
    let store = MemoryCoordinationStore::new();
    let starts = Arc::new(AtomicUsize::new(0));

    let counter = starts.clone();
    let election = LeaderElection::builder(Arc::new(store.connect()), PATH, "host")
        .as_leader(move |status| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                status.stopped().await;
                Ok(())
            }
        })
        .build();

    election.run();
    wait_for_role(&election, Role::Leader).await;

    // Another round while still leading must not restart the body.
    election.run();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(store.children_of(PATH).len(), 1);
}

#[tokio::test]
async fn test_failing_body_is_not_restarted_within_term() {
    let store = MemoryCoordinationStore::new();
    let starts = Arc::new(AtomicUsize::new(0));

    let counter = starts.clone();
    let election = LeaderElection::builder(Arc::new(store.connect()), PATH, "host")
        .as_leader(move |_status| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(kafka_sync::SyncError::handler("boom"))
            }
        })
        .build();

    election.run();
    wait_for_role(&election, Role::Leader).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(election.role(), Role::Leader);
}

// ============================================================================
// Handoff
// ============================================================================

#[tokio::test]
async fn test_follower_takes_over_when_leader_session_ends() {
    let store = MemoryCoordinationStore::new();
    let events = Events::default();

    let (a, session_a) = participant(&store, "a", &events);
    a.run();
    wait_for_role(&a, Role::Leader).await;

    let (b, _sb) = participant(&store, "b", &events);
    b.run();
    wait_for_role(&b, Role::Follower).await;

    session_a.close();

    wait_for_role(&b, Role::Leader).await;
    eventually(|| has_event(&events, "b leads")).await;
    assert_eq!(store.children_of(PATH).len(), 1);
}

#[tokio::test]
async fn test_departing_middle_follower_does_not_promote_successor() {
    let store = MemoryCoordinationStore::new();
    let events = Events::default();

    let (a, _sa) = participant(&store, "a", &events);
    a.run();
    wait_for_role(&a, Role::Leader).await;

    let (b, _sb) = participant(&store, "b", &events);
    b.run();
    wait_for_role(&b, Role::Follower).await;

    let (c, _sc) = participant(&store, "c", &events);
    c.run();
    wait_for_role(&c, Role::Follower).await;

    // c watches b. b leaving must not make c leader while a still leads.
    b.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(c.role(), Role::Follower);
    assert!(!has_event(&events, "c leads"));
    assert_eq!(store.children_of(PATH).len(), 2);

    // c now watches a directly.
    a.shutdown().await.unwrap();
    wait_for_role(&c, Role::Leader).await;
    eventually(|| has_event(&events, "a stops leading") && has_event(&events, "c leads")).await;
}

#[tokio::test]
async fn test_shutdown_hands_over_immediately() {
    let store = MemoryCoordinationStore::new();
    let events = Events::default();

    let (a, _sa) = participant(&store, "a", &events);
    a.run();
    wait_for_role(&a, Role::Leader).await;

    let (b, _sb) = participant(&store, "b", &events);
    b.run();
    wait_for_role(&b, Role::Follower).await;

    a.shutdown().await.unwrap();

    assert_eq!(a.role(), Role::Unelected);
    wait_for_role(&b, Role::Leader).await;
    eventually(|| has_event(&events, "a stops leading")).await;
}

// ============================================================================
// Session Loss
// ============================================================================

#[tokio::test]
async fn test_expired_leader_rejoins_as_follower_on_reconnect() {
    let store = MemoryCoordinationStore::new();
    let events = Events::default();

    let (a, session_a) = participant(&store, "a", &events);
    a.run();
    wait_for_role(&a, Role::Leader).await;

    let (b, _sb) = participant(&store, "b", &events);
    b.run();
    wait_for_role(&b, Role::Follower).await;

    session_a.close();
    wait_for_role(&b, Role::Leader).await;

    // a still believes it leads until its session comes back.
    assert!(!has_event(&events, "a stops leading"));

    session_a.reconnect();
    wait_for_role(&a, Role::Follower).await;
    eventually(|| has_event(&events, "a stops leading")).await;

    assert!(b.is_leader().await.unwrap());
    assert_eq!(store.children_of(PATH).len(), 2);
}

#[tokio::test]
async fn test_election_retries_until_store_is_reachable() {
    let store = MemoryCoordinationStore::new();
    let events = Events::default();

    let (a, session) = participant(&store, "a", &events);
    session.disconnect();
    a.run();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(a.role(), Role::Voting);
    assert!(store.children_of(PATH).is_empty());

    session.reconnect();
    wait_for_role(&a, Role::Leader).await;
}

#[tokio::test]
async fn test_candidate_node_holds_identity() {
    let store = MemoryCoordinationStore::new();
    let events = Events::default();

    let (a, _sa) = participant(&store, "host-a.example.com", &events);
    a.run();
    wait_for_role(&a, Role::Leader).await;

    let children = store.children_of(PATH);
    assert_eq!(children.len(), 1);
    assert!(children[0].starts_with(&format!("{}_", a.id())));
    assert_eq!(
        store.data(&format!("{PATH}/{}", children[0])).unwrap(),
        bytes::Bytes::from("host-a.example.com")
    );
}
