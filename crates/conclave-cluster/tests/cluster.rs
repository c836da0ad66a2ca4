//! Multi-node clusters running in one process over the in-process
//! raft router and peer client.

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use conclave_cluster::{
    ClusterConfig, ClusterDescriptor, CoordError, CoordResult, Coordinator, JoinState,
    LocalPeers, NodeEntry, PeerClient, RelayEnvelope, RelayMessage,
};
use conclave_raft::{LocalRouter, Transport, member_id};
use tokio::time::{Instant, sleep};

struct Node {
    coord: Arc<Coordinator>,
    fed: Arc<AtomicUsize>,
}

fn directory(base: u16) -> Vec<NodeEntry> {
    vec![
        NodeEntry::new("n1", "id-1", "127.0.0.1", base),
        NodeEntry::new("n2", "id-2", "127.0.0.1", base + 10),
        NodeEntry::new("n3", "id-3", "127.0.0.1", base + 20),
    ]
}

fn config(dir: &Path, name: &str, base: u16) -> ClusterConfig {
    ClusterConfig {
        name: name.to_string(),
        data_dir: dir.join(name),
        cluster_token: "test-cluster".to_string(),
        join_timeout_ms: 10_000,
        heartbeat_ms: 50,
        election_timeout_min_ms: 150,
        election_timeout_max_ms: 300,
        nodes: directory(base),
        ..Default::default()
    }
}

fn node(config: ClusterConfig, router: &Arc<LocalRouter>, peers: &LocalPeers) -> Node {
    let fed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fed);
    let transport: Arc<dyn Transport> = router.clone();
    let coord = Arc::new(
        Coordinator::new(config, transport, Arc::new(peers.clone()))
            .with_feed(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .with_rng_seed(1),
    );
    peers.register(&coord);
    Node { coord, fed }
}

async fn eventually<F, Fut>(what: &str, f: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(15);
    while !f().await {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(25)).await;
    }
}

async fn is_voter(coord: &Coordinator, name: &str) -> bool {
    coord
        .members()
        .await
        .is_ok_and(|ms| ms.iter().any(|m| m.name == name && !m.is_learner))
}

#[tokio::test]
async fn init_then_join_shares_membership_and_leader() {
    let dir = tempfile::tempdir().unwrap();
    let router = Arc::new(LocalRouter::new());
    let peers = LocalPeers::new();
    let a = node(config(dir.path(), "n1", 7500), &router, &peers);
    let b = node(config(dir.path(), "n2", 7500), &router, &peers);

    a.coord.init(true).await.unwrap();
    assert!(a.coord.is_leader().await);

    b.coord.join("n1").await.unwrap();
    assert_eq!(b.coord.join_state(), JoinState::Joined);
    assert!(matches!(b.coord.join("n1").await, Err(CoordError::AlreadyRunning)));

    let follower = &b.coord;
    eventually("both names in the descriptor", || async move {
        let d = follower.current_descriptor().await;
        d.contains("n1=http://127.0.0.1:7501") && d.contains("n2=http://127.0.0.1:7511")
    })
    .await;
    let parsed = ClusterDescriptor::parse(&a.coord.current_descriptor().await).unwrap();
    assert_eq!(parsed.entries().len(), 2);

    for coord in [&a.coord, &b.coord] {
        let (id, entry) = coord.leader(None).await;
        assert_eq!(id, member_id("http://127.0.0.1:7501"));
        assert_eq!(entry.unwrap().name, "n1");
    }
    let nodes: Vec<NodeEntry> = a.coord.directory().read().clone();
    assert_eq!(b.coord.leader(Some(nodes.as_slice())).await.1.unwrap().name, "n1");

    // Writes on the follower reach the leader.
    b.coord.put_work("{\"height\":7}").await.unwrap();
    assert_eq!(a.coord.get_work().await.unwrap(), "{\"height\":7}");
    b.coord.delete_work().await.unwrap();
    assert_eq!(a.coord.get_work().await.unwrap(), "");

    let info = b.coord.info().await.unwrap();
    assert_eq!(info.members.len(), 2);
    assert_eq!(info.leader.unwrap().name, "n1");
    assert_eq!(info.self_.unwrap().name, "n2");

    b.coord.stop().await.unwrap();
    a.coord.stop().await.unwrap();
}

#[tokio::test]
async fn move_leader_hands_over_and_feeds_once() {
    let dir = tempfile::tempdir().unwrap();
    let router = Arc::new(LocalRouter::new());
    let peers = LocalPeers::new();
    let a = node(config(dir.path(), "n1", 7600), &router, &peers);
    let b = node(config(dir.path(), "n2", 7600), &router, &peers);

    a.coord.init(true).await.unwrap();
    b.coord.join("n1").await.unwrap();
    let leader = &a.coord;
    eventually("n2 promoted to voter", || is_voter(leader, "n2")).await;
    assert_eq!(b.fed.load(Ordering::SeqCst), 0);

    a.coord.move_leader("n2").await.unwrap();
    let successor = &b.coord;
    eventually("n2 leads", || successor.is_leader()).await;
    assert!(!a.coord.is_leader().await);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(b.fed.load(Ordering::SeqCst), 1);
    assert_eq!(a.fed.load(Ordering::SeqCst), 1);

    let (_, entry) = a.coord.leader(None).await;
    assert_eq!(entry.unwrap().name, "n2");

    b.coord.stop().await.unwrap();
    a.coord.stop().await.unwrap();
}

#[tokio::test]
async fn move_leader_completes_with_default_timings() {
    let dir = tempfile::tempdir().unwrap();
    let router = Arc::new(LocalRouter::new());
    let peers = LocalPeers::new();
    let stock = |name: &str| ClusterConfig {
        name: name.to_string(),
        data_dir: dir.path().join(name),
        cluster_token: "test-cluster".to_string(),
        nodes: directory(8000),
        ..Default::default()
    };
    let a = node(stock("n1"), &router, &peers);
    let b = node(stock("n2"), &router, &peers);
    a.coord.config().validate().unwrap();

    a.coord.init(true).await.unwrap();
    b.coord.join("n1").await.unwrap();
    let leader = &a.coord;
    eventually("n2 promoted to voter", || is_voter(leader, "n2")).await;

    a.coord.move_leader("n2").await.unwrap();
    assert!(b.coord.is_leader().await);
    assert!(!a.coord.is_leader().await);

    b.coord.stop().await.unwrap();
    a.coord.stop().await.unwrap();
}

#[tokio::test]
async fn move_leader_past_deadline_is_a_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let router = Arc::new(LocalRouter::new());
    let peers = LocalPeers::new();
    let mut cfg = config(dir.path(), "n1", 8050);
    cfg.move_leader_timeout_ms = 1;
    let a = node(cfg, &router, &peers);
    let b = node(config(dir.path(), "n2", 8050), &router, &peers);

    a.coord.init(true).await.unwrap();
    b.coord.join("n1").await.unwrap();
    let leader = &a.coord;
    eventually("n2 promoted to voter", || is_voter(leader, "n2")).await;

    assert!(matches!(a.coord.move_leader("n2").await, Err(CoordError::Timeout(_))));
    // Heartbeats are back on, so n1 keeps its leadership.
    sleep(Duration::from_millis(1_000)).await;
    assert!(a.coord.is_leader().await);

    b.coord.stop().await.unwrap();
    a.coord.stop().await.unwrap();
}

#[tokio::test]
async fn init_without_bootstrap_resets_membership_keeps_data() {
    let dir = tempfile::tempdir().unwrap();
    let router = Arc::new(LocalRouter::new());
    let peers = LocalPeers::new();
    let a = node(config(dir.path(), "n1", 8100), &router, &peers);

    a.coord.init(true).await.unwrap();
    a.coord.put_work("{\"height\":3}").await.unwrap();
    a.coord.add("n2").await.unwrap();
    assert_eq!(a.coord.members().await.unwrap().len(), 2);
    a.coord.stop().await.unwrap();

    a.coord.init(false).await.unwrap();
    let members = a.coord.members().await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].peer_urls, vec!["http://127.0.0.1:8101".to_string()]);
    assert!(a.coord.is_leader().await);
    assert_eq!(a.coord.get_work().await.unwrap(), "{\"height\":3}");
    let solo = &a.coord;
    eventually("descriptor names only n1", || async move {
        solo.current_descriptor().await == "n1=http://127.0.0.1:8101"
    })
    .await;
    a.coord.stop().await.unwrap();
}

#[tokio::test]
async fn move_leader_to_unknown_member_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let router = Arc::new(LocalRouter::new());
    let peers = LocalPeers::new();
    let a = node(config(dir.path(), "n1", 7650), &router, &peers);
    a.coord.init(true).await.unwrap();
    assert!(matches!(a.coord.move_leader("ghost").await, Err(CoordError::NotFound(_))));
    a.coord.stop().await.unwrap();
}

#[tokio::test]
async fn wipe_discards_membership() {
    let dir = tempfile::tempdir().unwrap();
    let router = Arc::new(LocalRouter::new());
    let peers = LocalPeers::new();
    let a = node(config(dir.path(), "n1", 7700), &router, &peers);

    a.coord.wipe().await.unwrap();

    a.coord.init(true).await.unwrap();
    a.coord.put("k", "v").await.unwrap();
    a.coord.add("n2").await.unwrap();
    assert_eq!(a.coord.members().await.unwrap().len(), 2);
    a.coord.stop().await.unwrap();

    a.coord.wipe().await.unwrap();
    assert!(!dir.path().join("n1").exists());

    a.coord.start().await.unwrap();
    assert_eq!(a.coord.members().await.unwrap().len(), 1);
    assert_eq!(a.coord.get("k").await.unwrap(), "");
    a.coord.stop().await.unwrap();
}

#[tokio::test]
async fn add_is_idempotent_and_remove_by_hex_id() {
    let dir = tempfile::tempdir().unwrap();
    let router = Arc::new(LocalRouter::new());
    let peers = LocalPeers::new();
    let a = node(config(dir.path(), "n1", 7750), &router, &peers);
    a.coord.init(true).await.unwrap();
    let coord = &a.coord;
    eventually("n1 publishes its name", || async move {
        coord.current_descriptor().await == "n1=http://127.0.0.1:7751"
    })
    .await;

    let first = a.coord.add("n2").await.unwrap();
    let second = a.coord.add("id-2").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(ClusterDescriptor::parse(&first).unwrap().entries().len(), 2);
    assert!(first.contains("=http://127.0.0.1:7761"));
    assert!(a.coord.member_exists("n2", &first).unwrap());
    assert!(!a.coord.member_exists("n3", &first).unwrap());
    assert!(matches!(a.coord.add("ghost").await, Err(CoordError::NotFound(_))));

    // Never started, so it has not published a name yet.
    assert!(matches!(a.coord.remove("n2").await, Err(CoordError::NotFound(_))));
    assert!(matches!(a.coord.remove("ghost").await, Err(CoordError::NotFound(_))));

    let hex = format!("{:x}", member_id("http://127.0.0.1:7761"));
    let after = a.coord.remove(&hex).await.unwrap();
    assert_eq!(after, "n1=http://127.0.0.1:7751");
    a.coord.stop().await.unwrap();
}

#[tokio::test]
async fn kv_round_trip_and_missing_key() {
    let dir = tempfile::tempdir().unwrap();
    let router = Arc::new(LocalRouter::new());
    let peers = LocalPeers::new();
    let a = node(config(dir.path(), "n1", 7800), &router, &peers);

    assert!(matches!(a.coord.get("k").await, Err(CoordError::NotRunning)));
    assert!(matches!(a.coord.put("k", "v").await, Err(CoordError::NotRunning)));
    assert!(matches!(a.coord.add("n2").await, Err(CoordError::NotRunning)));
    assert_eq!(a.coord.current_descriptor().await, "");
    assert_eq!(a.coord.leader(None).await, (0, None));
    assert!(!a.coord.is_leader().await);

    a.coord.init(true).await.unwrap();
    assert_eq!(a.coord.get("missing-key").await.unwrap(), "");
    let rev = a.coord.put("k", "v1").await.unwrap();
    a.coord.put("k", "v2").await.unwrap();
    a.coord.compact(rev).await.unwrap();
    assert_eq!(a.coord.get("k").await.unwrap(), "v2");
    assert!(a.coord.compact(rev + 1_000).await.is_err());
    a.coord.stop().await.unwrap();
}

#[tokio::test]
async fn fix_cluster_names_local_slot() {
    let dir = tempfile::tempdir().unwrap();
    let router = Arc::new(LocalRouter::new());
    let peers = LocalPeers::new();
    let b = node(config(dir.path(), "n2", 7850), &router, &peers);

    let fixed = b
        .coord
        .fix_cluster("=http://127.0.0.1:7861,n1=http://127.0.0.1:7851")
        .unwrap();
    assert_eq!(fixed, "n2=http://127.0.0.1:7861,n1=http://127.0.0.1:7851");
    assert_eq!(b.coord.fix_cluster(&fixed).unwrap(), fixed);

    let stranger = node(config(dir.path(), "nobody", 7850), &router, &peers);
    assert!(matches!(
        stranger.coord.fix_cluster(&fixed),
        Err(CoordError::NotConfigured)
    ));
}

#[tokio::test]
async fn ensure_started_joins_a_running_peer() {
    let dir = tempfile::tempdir().unwrap();
    let router = Arc::new(LocalRouter::new());
    let peers = LocalPeers::new();
    let a = node(config(dir.path(), "n1", 7900), &router, &peers);
    let mut cfg = config(dir.path(), "n2", 7900);
    cfg.nodes.truncate(2);
    let b = node(cfg, &router, &peers);

    a.coord.init(true).await.unwrap();
    assert!(b.coord.ensure_started().await.unwrap());
    assert!(b.coord.is_running().await);
    assert!(b.coord.ensure_started().await.unwrap());

    b.coord.stop().await.unwrap();
    a.coord.stop().await.unwrap();
}

/// Peer that acknowledges admission, relays only noise, or fails outright.
struct StubPeers {
    joiner: OnceLock<Weak<Coordinator>>,
    fail: bool,
}

#[async_trait]
impl PeerClient for StubPeers {
    async fn request_admission(&self, _target: &NodeEntry, _joiner_id: &str, attempt: u64) -> CoordResult<()> {
        if self.fail {
            return Err(CoordError::Rpc("connection refused".to_string()));
        }
        if let Some(joiner) = self.joiner.get().and_then(Weak::upgrade) {
            assert!(joiner.deliver(RelayEnvelope {
                attempt,
                message: RelayMessage::Other(serde_json::json!({"hello": "there"})),
            }));
        }
        Ok(())
    }

    async fn relay(&self, _target: &NodeEntry, _envelope: RelayEnvelope) -> CoordResult<()> {
        Ok(())
    }

    async fn is_peer_up(&self, _target: &NodeEntry) -> bool {
        true
    }
}

fn stub_node(dir: &Path, fail: bool) -> Arc<Coordinator> {
    let mut cfg = config(dir, "n2", 7950);
    cfg.join_timeout_ms = 300;
    let stub = Arc::new(StubPeers {
        joiner: OnceLock::new(),
        fail,
    });
    let coord = Arc::new(Coordinator::new(cfg, Arc::new(LocalRouter::new()), stub.clone()));
    let _ = stub.joiner.set(Arc::downgrade(&coord));
    coord
}

#[tokio::test]
async fn join_times_out_without_descriptor() {
    let dir = tempfile::tempdir().unwrap();
    let coord = stub_node(dir.path(), false);
    assert!(matches!(coord.join("n1").await, Err(CoordError::Timeout(_))));
    assert_eq!(coord.join_state(), JoinState::Failed);
    assert!(!coord.is_running().await);
}

#[tokio::test]
async fn join_surfaces_rpc_failure() {
    let dir = tempfile::tempdir().unwrap();
    let coord = stub_node(dir.path(), true);
    assert!(matches!(coord.join("n1").await, Err(CoordError::Rpc(_))));
    assert_eq!(coord.join_state(), JoinState::Failed);
    assert!(matches!(coord.join("ghost").await, Err(CoordError::NotFound(_))));
}
