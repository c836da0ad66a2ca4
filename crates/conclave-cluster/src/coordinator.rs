//! The coordinator: owns at most one live store and serializes every
//! control operation through a single gate.

use std::sync::Arc;

use conclave_raft::store::DB_FILE;
use conclave_raft::{ClusterState, EmbeddedStore, StoreConfig, Transport};
use parking_lot::Mutex as SyncMutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::directory::{NodeDirectory, NodeEntry};
use crate::error::{CoordError, CoordResult};
use crate::join::{JoinState, Mailboxes};
use crate::monitor::{LeadershipFeed, LeadershipMonitor, NoFeed};
use crate::peer::PeerClient;

/// A running store and the monitor watching it.
pub(crate) struct Live {
    pub(crate) store: EmbeddedStore,
    monitor: LeadershipMonitor,
}

pub struct Coordinator {
    pub(crate) config: ClusterConfig,
    pub(crate) directory: Arc<NodeDirectory>,
    transport: Arc<dyn Transport>,
    pub(crate) peers: Arc<dyn PeerClient>,
    feed: Arc<dyn LeadershipFeed>,
    /// Serializes init, start, join, add, remove and move-leader.
    pub(crate) gate: Mutex<()>,
    pub(crate) live: RwLock<Option<Live>>,
    pub(crate) mailboxes: Mailboxes,
    pub(crate) join_state: SyncMutex<JoinState>,
    picker: SyncMutex<StdRng>,
}

impl Coordinator {
    /// Create a coordinator. The node directory is seeded from
    /// `config.nodes`.
    pub fn new(
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
        peers: Arc<dyn PeerClient>,
    ) -> Self {
        let directory = Arc::new(NodeDirectory::new(config.nodes.clone()));
        Self {
            config,
            directory,
            transport,
            peers,
            feed: Arc::new(NoFeed),
            gate: Mutex::new(()),
            live: RwLock::new(None),
            mailboxes: Mailboxes::default(),
            join_state: SyncMutex::new(JoinState::Idle),
            picker: SyncMutex::new(StdRng::from_os_rng()),
        }
    }

    /// Set the subsystem notified when this node becomes leader.
    pub fn with_feed(mut self, feed: Arc<dyn LeadershipFeed>) -> Self {
        self.feed = feed;
        self
    }

    /// Share an externally owned node directory.
    pub fn with_directory(mut self, directory: Arc<NodeDirectory>) -> Self {
        self.directory = directory;
        self
    }

    /// Make random peer selection reproducible.
    pub fn with_rng_seed(self, seed: u64) -> Self {
        *self.picker.lock() = StdRng::seed_from_u64(seed);
        self
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn directory(&self) -> &Arc<NodeDirectory> {
        &self.directory
    }

    pub async fn is_running(&self) -> bool {
        self.live.read().await.is_some()
    }

    /// The local node's directory entry.
    pub(crate) fn local(&self) -> CoordResult<NodeEntry> {
        if self.config.name.is_empty() {
            return Err(CoordError::NotConfigured);
        }
        self.directory
            .by_name(&self.config.name)
            .ok_or(CoordError::NotConfigured)
    }

    pub(crate) fn store_config(
        &self,
        me: &NodeEntry,
        initial_cluster: Vec<(String, String)>,
        cluster_state: ClusterState,
    ) -> StoreConfig {
        StoreConfig {
            name: me.name.clone(),
            data_dir: self.config.data_dir.clone(),
            listen_peer_url: me.listen_peer_url(),
            advertise_peer_url: me.peer_url(),
            advertise_client_url: me.client_url(),
            initial_cluster,
            cluster_state,
            cluster_token: self.config.cluster_token.clone(),
            ready_timeout: self.config.ready_timeout(),
            heartbeat_interval: self.config.heartbeat(),
            election_timeout_min: self.config.election_timeout_min(),
            election_timeout_max: self.config.election_timeout_max(),
        }
    }

    /// Start a store into the empty `live` slot along with its monitor.
    pub(crate) async fn launch(&self, live: &mut Option<Live>, config: StoreConfig) -> CoordResult<()> {
        if live.is_some() {
            return Err(CoordError::AlreadyRunning);
        }
        let store = EmbeddedStore::start(config, Arc::clone(&self.transport)).await?;
        let monitor =
            LeadershipMonitor::spawn(store.id(), store.leader_watch(), Arc::clone(&self.feed));
        *live = Some(Live { store, monitor });
        Ok(())
    }

    /// Create a new single-member cluster rooted at this node. With
    /// `bootstrap` set, any previous local state is wiped first; without
    /// it the stored key-value data is kept but the old membership is
    /// dropped.
    pub async fn init(&self, bootstrap: bool) -> CoordResult<()> {
        let _gate = self.gate.lock().await;
        let mut live = self.live.write().await;
        if live.is_some() {
            return Err(CoordError::AlreadyRunning);
        }
        let me = self.local()?;
        let cluster_state = if bootstrap {
            self.remove_data_dir()?;
            ClusterState::New
        } else {
            ClusterState::ForceNew
        };
        let config = self.store_config(&me, vec![(me.name.clone(), me.peer_url())], cluster_state);
        self.launch(&mut live, config).await?;
        info!(name = %me.name, bootstrap, "initialized cluster");
        Ok(())
    }

    /// Resume the persisted cluster, or bootstrap a single-member one when
    /// there is no local state.
    pub async fn start(&self) -> CoordResult<()> {
        let _gate = self.gate.lock().await;
        self.start_locked(ClusterState::New).await
    }

    async fn start_locked(&self, cluster_state: ClusterState) -> CoordResult<()> {
        let mut live = self.live.write().await;
        if live.is_some() {
            return Err(CoordError::AlreadyRunning);
        }
        let me = self.local()?;
        let config = self.store_config(&me, vec![(me.name.clone(), me.peer_url())], cluster_state);
        match self.launch(&mut live, config).await {
            Ok(()) => {
                info!(name = %me.name, "started store");
                Ok(())
            }
            Err(e) => {
                warn!(name = %me.name, error = %e, "failed to start store");
                Err(e)
            }
        }
    }

    /// Make sure a store is running, without waiting behind another
    /// control operation.
    ///
    /// A node with local state resumes it. A node without, or one whose
    /// resume failed, tries to join a randomly chosen reachable peer.
    /// Returns whether a store is running afterwards.
    pub async fn ensure_started(&self) -> CoordResult<bool> {
        let Ok(_gate) = self.gate.try_lock() else {
            debug!("control operation in progress, skipping ensure-started");
            return Ok(false);
        };
        if self.is_running().await {
            return Ok(true);
        }

        if self.has_local_state() && self.start_locked(ClusterState::Existing).await.is_ok() {
            return Ok(true);
        }

        let Some(peer) = self.pick_peer() else {
            debug!("no peers to join");
            return Ok(false);
        };
        if !self.peers.is_peer_up(&peer).await {
            debug!(peer = %peer.name, "picked peer is not up");
            return Ok(false);
        }
        info!(peer = %peer.name, "trying to join");
        self.join_locked(&peer.name).await?;
        Ok(true)
    }

    /// Pick a random directory entry other than this node.
    fn pick_peer(&self) -> Option<NodeEntry> {
        let nodes = self.directory.read();
        let others: Vec<&NodeEntry> = nodes.iter().filter(|n| n.name != self.config.name).collect();
        if others.is_empty() {
            return None;
        }
        let ix = self.picker.lock().random_range(0..others.len());
        Some(others[ix].clone())
    }

    pub(crate) fn has_local_state(&self) -> bool {
        self.config.data_dir.join(DB_FILE).exists()
    }

    /// Stop the running store.
    pub async fn stop(&self) -> CoordResult<()> {
        let _gate = self.gate.lock().await;
        self.stop_locked().await
    }

    async fn stop_locked(&self) -> CoordResult<()> {
        let mut live = self.live.write().await;
        let Some(Live { store, monitor }) = live.take() else {
            return Err(CoordError::NotRunning);
        };
        monitor.stop().await;
        store.stop().await?;
        info!(name = %self.config.name, "stopped store");
        Ok(())
    }

    /// Stop the store if it runs and delete all local state.
    pub async fn wipe(&self) -> CoordResult<()> {
        let _gate = self.gate.lock().await;
        match self.stop_locked().await {
            Ok(()) | Err(CoordError::NotRunning) => {}
            Err(e) => return Err(e),
        }
        self.remove_data_dir()?;
        info!(dir = %self.config.data_dir.display(), "wiped local state");
        Ok(())
    }

    pub(crate) fn remove_data_dir(&self) -> CoordResult<()> {
        match std::fs::remove_dir_all(&self.config.data_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::LocalPeers;
    use conclave_raft::LocalRouter;

    fn coordinator(dir: &std::path::Path, name: &str) -> Coordinator {
        let config = ClusterConfig {
            name: name.to_string(),
            data_dir: dir.join(name),
            heartbeat_ms: 50,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            nodes: vec![
                NodeEntry::new("n1", "id-1", "127.0.0.1", 7300),
                NodeEntry::new("n2", "id-2", "127.0.0.1", 7310),
            ],
            ..Default::default()
        };
        Coordinator::new(config, Arc::new(LocalRouter::new()), Arc::new(LocalPeers::new()))
            .with_rng_seed(7)
    }

    #[tokio::test]
    async fn init_requires_local_identity() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path(), "ghost");
        assert!(matches!(c.init(true).await, Err(CoordError::NotConfigured)));
        let c = coordinator(dir.path(), "");
        assert!(matches!(c.init(true).await, Err(CoordError::NotConfigured)));
        assert!(!c.is_running().await);
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path(), "n1");
        assert!(matches!(c.stop().await, Err(CoordError::NotRunning)));

        c.init(true).await.unwrap();
        assert!(c.is_running().await);
        assert!(matches!(c.init(true).await, Err(CoordError::AlreadyRunning)));
        assert!(matches!(c.start().await, Err(CoordError::AlreadyRunning)));

        c.stop().await.unwrap();
        assert!(!c.is_running().await);
        assert!(c.has_local_state());

        c.start().await.unwrap();
        assert!(c.is_running().await);
        c.wipe().await.unwrap();
        assert!(!c.is_running().await);
        assert!(!c.has_local_state());
    }

    #[tokio::test]
    async fn wipe_without_state_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path(), "n1");
        c.wipe().await.unwrap();
    }

    #[tokio::test]
    async fn ensure_started_skips_while_gate_held() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path(), "n1");
        let _held = c.gate.lock().await;
        assert!(!c.ensure_started().await.unwrap());
        assert!(!c.is_running().await);
    }

    #[tokio::test]
    async fn ensure_started_without_reachable_peer_stays_down() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path(), "n1");
        assert!(!c.ensure_started().await.unwrap());
        assert!(!c.is_running().await);
    }

    #[test]
    fn picked_peer_is_never_self() {
        let dir = tempfile::tempdir().unwrap();
        let c = coordinator(dir.path(), "n1");
        for _ in 0..20 {
            assert_eq!(c.pick_peer().unwrap().name, "n2");
        }
    }
}
