//! The embedded replicated store.
//!
//! [`EmbeddedStore`] owns one member of a Raft group: the redb database,
//! the openraft instance, the peer listener and the background tasks
//! that publish this member's attributes and promote caught-up learners.
//!
//! Every mutating call works on any member. Followers hand writes,
//! linearizable reads, membership changes and leader transfers to the
//! current leader over the peer transport.

use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use openraft::error::{CheckIsLeaderError, ClientWriteError, RaftError};
use openraft::{BasicNode, ChangeMembers, Config, ServerState};
use parking_lot::Mutex;
use redb::Database;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::log_store::LogStore;
use crate::member_id::member_id;
use crate::network::NetworkFactory;
use crate::state_machine::{StateMachine, StateView};
use crate::transport::{Listener, PeerHandler, RaftCall, RaftEndpoint, RaftMethod, Transport};
use crate::typ::{
    ConclaveRaft, ForwardRequest, ForwardResponse, Metrics, Request, Response, TimeoutNow,
};

/// Name of the database file inside the data directory.
pub const DB_FILE: &str = "store.redb";

const PUBLISH_RETRY: Duration = Duration::from_millis(500);
const PROMOTE_INTERVAL: Duration = Duration::from_millis(200);
/// A learner this close to the leader's last log index counts as caught up.
const PROMOTE_LAG: u64 = 16;
/// How long a committed membership change may take to show up locally.
const MEMBERSHIP_VISIBLE: Duration = Duration::from_secs(2);

/// Whether the member starts a new group or joins one that already runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    New,
    Existing,
    /// Start a single-member group from `initial_cluster`, discarding the
    /// persisted log and membership but carrying the key-value data over.
    ForceNew,
}

/// Everything needed to start one member.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub name: String,
    pub data_dir: PathBuf,
    pub listen_peer_url: String,
    pub advertise_peer_url: String,
    pub advertise_client_url: String,
    /// `(name, peer URL)` of every member the group starts with.
    pub initial_cluster: Vec<(String, String)>,
    pub cluster_state: ClusterState,
    pub cluster_token: String,
    pub ready_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
}

impl StoreConfig {
    fn raft_config(&self) -> StoreResult<Config> {
        let config = Config {
            cluster_name: self.cluster_token.clone(),
            heartbeat_interval: self.heartbeat_interval.as_millis() as u64,
            election_timeout_min: self.election_timeout_min.as_millis() as u64,
            election_timeout_max: self.election_timeout_max.as_millis() as u64,
            ..Default::default()
        };
        config
            .validate()
            .map_err(|e| StoreError::Config(e.to_string()))
    }
}

/// One member as seen through the replicated membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: u64,
    /// Empty until the member has published its attributes.
    pub name: String,
    pub peer_urls: Vec<String>,
    pub client_urls: Vec<String>,
    pub is_learner: bool,
}

/// Stream of leader changes observed by one member.
pub struct LeaderWatch {
    rx: watch::Receiver<Metrics>,
    last: Option<Option<u64>>,
}

impl LeaderWatch {
    /// Wait for the next leader change and return the new leader.
    ///
    /// The first call returns the current leader immediately. Returns
    /// `None` once the store has shut down.
    pub async fn changed(&mut self) -> Option<Option<u64>> {
        loop {
            let current = self.rx.borrow_and_update().current_leader;
            if self.last != Some(current) {
                self.last = Some(current);
                return Some(current);
            }
            self.rx.changed().await.ok()?;
        }
    }
}

struct StoreInner {
    id: u64,
    config: StoreConfig,
    raft: ConclaveRaft,
    view: StateView,
    transport: Arc<dyn Transport>,
    tasks: Mutex<JoinSet<()>>,
}

/// A running member of the replicated store.
pub struct EmbeddedStore {
    inner: Arc<StoreInner>,
    listener: Mutex<Option<Listener>>,
    endpoint: Arc<RaftEndpoint>,
    db: Arc<Database>,
}

impl EmbeddedStore {
    /// Open the data directory, start Raft and the peer listener, and
    /// wait until a leader is known.
    ///
    /// A member with persisted state resumes it regardless of
    /// `cluster_state`, except in `ForceNew` mode. A pristine member in
    /// `New` mode bootstraps the group from `initial_cluster`; in `Existing`
    /// mode it waits for the leader to contact it.
    pub async fn start(config: StoreConfig, transport: Arc<dyn Transport>) -> StoreResult<Self> {
        let id = member_id(&config.advertise_peer_url);
        let advertised = config.advertise_peer_url.trim_end_matches('/');
        if !config
            .initial_cluster
            .iter()
            .any(|(_, url)| url.trim_end_matches('/') == advertised)
        {
            return Err(StoreError::Config(format!(
                "{advertised} is not listed in the initial cluster"
            )));
        }
        let raft_config = Arc::new(config.raft_config()?);

        std::fs::create_dir_all(&config.data_dir)?;
        let path = config.data_dir.join(DB_FILE);
        let carried = if config.cluster_state == ClusterState::ForceNew {
            take_kv(&path)?
        } else {
            BTreeMap::new()
        };
        let db = Arc::new(
            Database::create(&path)
                .map_err(|e| StoreError::Open(format!("{}: {e}", path.display())))?,
        );

        let log_store = LogStore::new(Arc::clone(&db))?;
        let pristine = log_store.is_pristine()?;
        let state_machine = StateMachine::new(Arc::clone(&db))?;
        let view = state_machine.view();
        let network = NetworkFactory::new(Arc::clone(&transport), config.cluster_token.clone());

        let raft = ConclaveRaft::new(id, raft_config, network, log_store, state_machine)
            .await
            .map_err(StoreError::raft)?;

        info!(
            name = %config.name,
            member = %format!("{id:x}"),
            peer_url = %config.advertise_peer_url,
            pristine,
            state = ?config.cluster_state,
            "starting store"
        );

        let inner = Arc::new(StoreInner {
            id,
            config,
            raft,
            view,
            transport: Arc::clone(&transport),
            tasks: Mutex::new(JoinSet::new()),
        });

        let endpoint = Arc::new(RaftEndpoint::new(
            inner.raft.clone(),
            inner.config.cluster_token.clone(),
            Arc::clone(&inner) as Arc<dyn PeerHandler>,
        ));
        let listener = match transport
            .serve(
                &inner.config.listen_peer_url,
                &inner.config.advertise_peer_url,
                Arc::clone(&endpoint),
            )
            .await
        {
            Ok(l) => l,
            Err(e) => {
                let _ = inner.raft.shutdown().await;
                endpoint.close().await;
                return Err(e);
            }
        };

        let store = Self {
            inner,
            listener: Mutex::new(Some(listener)),
            endpoint,
            db,
        };

        if let Err(e) = store.bootstrap(pristine).await {
            store.stop().await?;
            return Err(e);
        }

        let ready_timeout = store.inner.config.ready_timeout;
        if store
            .inner
            .raft
            .wait(Some(ready_timeout))
            .metrics(|m| m.current_leader.is_some(), "store ready")
            .await
            .is_err()
        {
            warn!(timeout = ?ready_timeout, "store saw no leader, shutting down");
            store.stop().await?;
            return Err(StoreError::NotReady(ready_timeout));
        }

        if !carried.is_empty() {
            info!(keys = carried.len(), "restoring key-value data into the new group");
            for (key, value) in &carried {
                if let Err(e) = store.put(key, value).await {
                    store.stop().await?;
                    return Err(e);
                }
            }
        }

        {
            let mut tasks = store.inner.tasks.lock();
            tasks.spawn(publish_loop(Arc::clone(&store.inner)));
            tasks.spawn(promote_loop(Arc::clone(&store.inner)));
        }

        info!(
            member = %format!("{id:x}"),
            leader = ?store.leader_id().map(|l| format!("{l:x}")),
            "store ready"
        );
        Ok(store)
    }

    async fn bootstrap(&self, pristine: bool) -> StoreResult<()> {
        if !pristine || self.inner.config.cluster_state == ClusterState::Existing {
            return Ok(());
        }
        let nodes: BTreeMap<u64, BasicNode> = self
            .inner
            .config
            .initial_cluster
            .iter()
            .map(|(_, url)| (member_id(url), BasicNode::new(url.trim_end_matches('/'))))
            .collect();
        debug!(members = nodes.len(), "initializing new group");
        match self.inner.raft.initialize(nodes).await {
            Ok(()) => Ok(()),
            Err(RaftError::APIError(e)) => {
                debug!(error = %e, "group already initialized");
                Ok(())
            }
            Err(e) => Err(StoreError::raft(e)),
        }
    }

    /// This member's id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// This member's configured name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// The leader this member currently knows of.
    pub fn leader_id(&self) -> Option<u64> {
        self.inner.raft.metrics().borrow().current_leader
    }

    pub fn is_leader(&self) -> bool {
        self.leader_id() == Some(self.inner.id)
    }

    /// Latest Raft metrics of this member.
    pub fn metrics(&self) -> Metrics {
        self.inner.raft.metrics().borrow().clone()
    }

    pub fn leader_watch(&self) -> LeaderWatch {
        LeaderWatch {
            rx: self.inner.raft.metrics(),
            last: None,
        }
    }

    /// Every member in the latest membership config, sorted by id.
    pub fn members(&self) -> StoreResult<Vec<Member>> {
        self.inner.members()
    }

    /// Add a member by peer URL. It joins as a learner and is promoted to
    /// voter once it has caught up. Adding a known member is a no-op.
    pub async fn add_member(&self, peer_url: &str) -> StoreResult<u64> {
        let id = self.inner.add_learner(peer_url, true).await?;
        self.await_membership(id, true).await?;
        Ok(id)
    }

    /// Remove a member (voter or learner) by id.
    pub async fn remove_member(&self, id: u64) -> StoreResult<()> {
        self.inner.remove_member(id, true).await?;
        self.await_membership(id, false).await
    }

    /// Wait until this member's view of the membership has (or lacks) `id`.
    /// Changes committed through the leader reach followers by replication.
    async fn await_membership(&self, id: u64, present: bool) -> StoreResult<()> {
        self.inner
            .raft
            .wait(Some(MEMBERSHIP_VISIBLE))
            .metrics(
                move |m| m.membership_config.membership().get_node(&id).is_some() == present,
                "membership change visible",
            )
            .await
            .map_err(|e| StoreError::Timeout(e.to_string()))?;
        Ok(())
    }

    /// Hand leadership to `to`, waiting at most `within`.
    pub async fn move_leader(&self, to: u64, within: Duration) -> StoreResult<()> {
        self.inner.transfer_leader(to, within, true).await
    }

    /// Store `value` under `key`; returns the revision it was applied at.
    pub async fn put(&self, key: &str, value: &str) -> StoreResult<u64> {
        let req = Request::Put {
            key: key.to_string(),
            value: value.to_string(),
        };
        Ok(self.inner.write(req, true).await?.revision)
    }

    /// Linearizable read of `key`.
    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.read(key, true).await
    }

    /// Delete `key`; returns the revision the delete was applied at.
    pub async fn delete(&self, key: &str) -> StoreResult<u64> {
        let req = Request::Delete {
            key: key.to_string(),
        };
        Ok(self.inner.write(req, true).await?.revision)
    }

    /// Discard this member's log up to and including `revision`.
    ///
    /// Returns once the entries are gone from disk.
    pub async fn compact(&self, revision: u64) -> StoreResult<()> {
        let raft = &self.inner.raft;
        let m = self.metrics();
        let applied = m.last_applied.map_or(0, |l| l.index);
        if revision > applied {
            return Err(StoreError::FutureRevision {
                requested: revision,
                applied,
            });
        }
        if m.purged.is_some_and(|p| revision <= p.index) {
            return Err(StoreError::Compacted(revision));
        }

        if m.snapshot.is_none_or(|s| s.index < revision) {
            raft.trigger().snapshot().await.map_err(StoreError::raft)?;
            raft.wait(None)
                .metrics(
                    |m| m.snapshot.is_some_and(|s| s.index >= revision),
                    "snapshot covers compaction point",
                )
                .await
                .map_err(StoreError::raft)?;
        }

        raft.trigger()
            .purge_log(revision)
            .await
            .map_err(StoreError::raft)?;
        raft.wait(None)
            .metrics(
                |m| m.purged.is_some_and(|p| p.index >= revision),
                "log purged",
            )
            .await
            .map_err(StoreError::raft)?;
        info!(revision, "compacted");
        Ok(())
    }

    /// Stop Raft, the listener and every background task, and release
    /// the database file.
    pub async fn stop(self) -> StoreResult<()> {
        let Self {
            inner,
            listener,
            endpoint,
            db,
        } = self;
        let id = inner.id;

        let listener = listener.lock().take();
        if let Some(listener) = listener {
            listener.close().await;
        }

        let tasks = mem::take(&mut *inner.tasks.lock());
        let mut tasks = tasks;
        tasks.shutdown().await;

        let res = inner.raft.shutdown().await.map_err(StoreError::raft);
        // Calls still in flight fail fast once Raft is down.
        endpoint.close().await;
        drop(inner);

        // openraft's state machine worker is detached from the core and
        // drops its database handle only after noticing the core is gone.
        let deadline = Instant::now() + Duration::from_secs(2);
        while Arc::strong_count(&db) > 1 && Instant::now() < deadline {
            sleep(Duration::from_millis(10)).await;
        }
        if Arc::strong_count(&db) > 1 {
            warn!(member = %format!("{id:x}"), "database still referenced after stop");
        }
        info!(member = %format!("{id:x}"), "store stopped");
        res
    }
}

impl StoreInner {
    fn members(&self) -> StoreResult<Vec<Member>> {
        let membership = Arc::clone(&self.raft.metrics().borrow().membership_config);
        let voters: BTreeSet<u64> = membership.voter_ids().collect();
        let attrs = self.view.member_attrs()?;

        Ok(membership
            .nodes()
            .map(|(id, node)| {
                let published = attrs.get(id);
                Member {
                    id: *id,
                    name: published.map(|a| a.name.clone()).unwrap_or_default(),
                    peer_urls: vec![node.addr.clone()],
                    client_urls: published.map(|a| a.client_urls.clone()).unwrap_or_default(),
                    is_learner: !voters.contains(id),
                }
            })
            .collect())
    }

    fn leader_addr(&self) -> StoreResult<String> {
        let m = self.raft.metrics().borrow().clone();
        let leader = m.current_leader.ok_or(StoreError::NoLeader)?;
        m.membership_config
            .membership()
            .get_node(&leader)
            .map(|n| n.addr.clone())
            .ok_or(StoreError::NoLeader)
    }

    /// Send `req` to the member at `addr`, or to the current leader.
    async fn forward_to(&self, addr: Option<String>, req: ForwardRequest) -> StoreResult<ForwardResponse> {
        let addr = match addr {
            Some(a) => a,
            None => self.leader_addr()?,
        };
        debug!(%addr, ?req, "forwarding to leader");
        let call = RaftCall {
            method: RaftMethod::Forward,
            cluster_token: self.config.cluster_token.clone(),
            data: serde_json::to_vec(&req)?,
        };
        let reply = self
            .transport
            .call(&addr, call)
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        if !reply.error.is_empty() {
            return Err(StoreError::Remote(reply.error));
        }
        match serde_json::from_slice(&reply.data)? {
            ForwardResponse::TimedOut(what) => Err(StoreError::Timeout(what)),
            resp => Ok(resp),
        }
    }

    async fn write(&self, req: Request, may_forward: bool) -> StoreResult<Response> {
        match self.raft.client_write(req.clone()).await {
            Ok(resp) => Ok(resp.data),
            Err(e) => match forward_target(&e, may_forward)? {
                Some(addr) => match self.forward_to(addr, ForwardRequest::Write(req)).await? {
                    ForwardResponse::Written(resp) => Ok(resp),
                    other => Err(unexpected(other)),
                },
                None => Err(StoreError::raft(e)),
            },
        }
    }

    async fn read(&self, key: &str, may_forward: bool) -> StoreResult<Option<String>> {
        match self.raft.ensure_linearizable().await {
            Ok(_) => self.view.get(key),
            Err(e) => match read_forward_target(&e, may_forward)? {
                Some(addr) => {
                    let req = ForwardRequest::Read {
                        key: key.to_string(),
                    };
                    match self.forward_to(addr, req).await? {
                        ForwardResponse::Value(v) => Ok(v),
                        other => Err(unexpected(other)),
                    }
                }
                None => Err(StoreError::raft(e)),
            },
        }
    }

    async fn add_learner(&self, peer_url: &str, may_forward: bool) -> StoreResult<u64> {
        let peer_url = peer_url.trim_end_matches('/');
        let id = member_id(peer_url);
        let known = self
            .raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .get_node(&id)
            .is_some();
        if known {
            debug!(member = %format!("{id:x}"), peer_url, "member already present");
            return Ok(id);
        }

        match self.raft.add_learner(id, BasicNode::new(peer_url), false).await {
            Ok(_) => {
                info!(member = %format!("{id:x}"), peer_url, "added learner");
                Ok(id)
            }
            Err(e) => match forward_target(&e, may_forward)? {
                Some(addr) => {
                    let req = ForwardRequest::AddLearner {
                        peer_url: peer_url.to_string(),
                    };
                    match self.forward_to(addr, req).await? {
                        ForwardResponse::Added(id) => Ok(id),
                        other => Err(unexpected(other)),
                    }
                }
                None => Err(StoreError::raft(e)),
            },
        }
    }

    async fn remove_member(&self, id: u64, may_forward: bool) -> StoreResult<()> {
        let membership = Arc::clone(&self.raft.metrics().borrow().membership_config);
        if membership.membership().get_node(&id).is_none() {
            return Err(StoreError::UnknownMember(id));
        }
        let ids = BTreeSet::from([id]);
        let change = if membership.voter_ids().any(|v| v == id) {
            ChangeMembers::RemoveVoters(ids)
        } else {
            ChangeMembers::RemoveNodes(ids)
        };

        match self.raft.change_membership(change, false).await {
            Ok(_) => {
                info!(member = %format!("{id:x}"), "removed member");
                Ok(())
            }
            Err(e) => match forward_target(&e, may_forward)? {
                Some(addr) => match self.forward_to(addr, ForwardRequest::RemoveMember { id }).await? {
                    ForwardResponse::Done => Ok(()),
                    other => Err(unexpected(other)),
                },
                None => Err(StoreError::raft(e)),
            },
        }
    }

    async fn transfer_leader(&self, to: u64, within: Duration, may_forward: bool) -> StoreResult<()> {
        let deadline = Instant::now() + within;
        let m = self.raft.metrics().borrow().clone();

        if m.current_leader == Some(to) {
            return Ok(());
        }
        if m.state != ServerState::Leader {
            if !may_forward {
                return Err(StoreError::NoLeader);
            }
            let req = ForwardRequest::TransferLeader {
                to,
                within_ms: within.as_millis() as u64,
            };
            return match self.forward_to(None, req).await? {
                ForwardResponse::Done => Ok(()),
                other => Err(unexpected(other)),
            };
        }

        let membership = m.membership_config.membership();
        let target = membership
            .get_node(&to)
            .ok_or(StoreError::UnknownMember(to))?
            .addr
            .clone();
        if !membership.voter_ids().any(|v| v == to) {
            return Err(StoreError::NotVoter(to));
        }

        info!(to = %format!("{to:x}"), ?within, "transferring leadership");
        let _paused = HeartbeatPause::new(&self.raft);
        self.hand_off(to, &target, deadline).await
    }

    async fn hand_off(&self, to: u64, target: &str, deadline: Instant) -> StoreResult<()> {
        let remaining = || deadline.saturating_duration_since(Instant::now());

        // The successor must hold every entry before it campaigns.
        self.raft
            .wait(Some(remaining()))
            .metrics(
                |m| {
                    let last = m.last_log_index;
                    m.replication
                        .as_ref()
                        .and_then(|r| r.get(&to))
                        .is_some_and(|matched| matched.map(|l| l.index) >= last)
                },
                "successor caught up",
            )
            .await
            .map_err(|e| StoreError::Timeout(e.to_string()))?;

        let call = RaftCall {
            method: RaftMethod::TimeoutNow,
            cluster_token: self.config.cluster_token.clone(),
            data: serde_json::to_vec(&TimeoutNow {
                within_ms: remaining().as_millis() as u64,
            })?,
        };
        let reply = self
            .transport
            .call(target, call)
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        if !reply.error.is_empty() {
            return Err(StoreError::Remote(reply.error));
        }

        self.raft
            .wait(Some(remaining()))
            .current_leader(to, "leadership transferred")
            .await
            .map_err(|e| StoreError::Timeout(e.to_string()))?;
        info!(to = %format!("{to:x}"), "leadership transferred");
        Ok(())
    }
}

impl StoreInner {
    async fn serve_forward(&self, req: ForwardRequest) -> StoreResult<ForwardResponse> {
        match req {
            ForwardRequest::Write(r) => Ok(ForwardResponse::Written(self.write(r, false).await?)),
            ForwardRequest::Read { key } => Ok(ForwardResponse::Value(self.read(&key, false).await?)),
            ForwardRequest::AddLearner { peer_url } => {
                Ok(ForwardResponse::Added(self.add_learner(&peer_url, false).await?))
            }
            ForwardRequest::RemoveMember { id } => {
                self.remove_member(id, false).await?;
                Ok(ForwardResponse::Done)
            }
            ForwardRequest::TransferLeader { to, within_ms } => {
                self.transfer_leader(to, Duration::from_millis(within_ms), false)
                    .await?;
                Ok(ForwardResponse::Done)
            }
        }
    }
}

#[async_trait]
impl PeerHandler for StoreInner {
    async fn forward(&self, req: ForwardRequest) -> StoreResult<ForwardResponse> {
        match self.serve_forward(req).await {
            Err(StoreError::Timeout(what)) => Ok(ForwardResponse::TimedOut(what)),
            res => res,
        }
    }

    async fn timeout_now(&self, req: TimeoutNow) -> StoreResult<()> {
        let raft = self.raft.clone();
        let id = self.id;
        let deadline = Instant::now() + Duration::from_millis(req.within_ms);
        let pause = self.config.election_timeout_min / 2;
        info!(member = %format!("{id:x}"), "asked to take over leadership");

        self.tasks.lock().spawn(async move {
            while Instant::now() < deadline {
                if raft.metrics().borrow().current_leader == Some(id) {
                    return;
                }
                if let Err(e) = raft.trigger().elect().await {
                    warn!(error = %e, "campaign aborted");
                    return;
                }
                sleep(pause).await;
            }
            debug!("campaign deadline passed");
        });
        Ok(())
    }
}

/// Suspends heartbeats for its lifetime, including when the transfer
/// future is dropped midway.
struct HeartbeatPause<'a>(&'a ConclaveRaft);

impl<'a> HeartbeatPause<'a> {
    fn new(raft: &'a ConclaveRaft) -> Self {
        raft.runtime_config().heartbeat(false);
        Self(raft)
    }
}

impl Drop for HeartbeatPause<'_> {
    fn drop(&mut self) {
        self.0.runtime_config().heartbeat(true);
    }
}

/// Read every key-value pair out of the database at `path` and delete the
/// file. A missing file yields nothing.
fn take_kv(path: &Path) -> StoreResult<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let kv = {
        let db = Arc::new(
            Database::open(path)
                .map_err(|e| StoreError::Open(format!("{}: {e}", path.display())))?,
        );
        StateMachine::new(db)?.view().entries()?
    };
    std::fs::remove_file(path)?;
    debug!(keys = kv.len(), path = %path.display(), "discarded persisted group");
    Ok(kv)
}

/// Where a failed write-class call should go next, if anywhere.
fn forward_target(
    e: &RaftError<u64, ClientWriteError<u64, BasicNode>>,
    may_forward: bool,
) -> StoreResult<Option<Option<String>>> {
    match e.forward_to_leader::<BasicNode>() {
        Some(_) if !may_forward => Err(StoreError::NoLeader),
        Some(fwd) => match &fwd.leader_node {
            Some(node) => Ok(Some(Some(node.addr.clone()))),
            None => Err(StoreError::NoLeader),
        },
        None => Ok(None),
    }
}

fn read_forward_target(
    e: &RaftError<u64, CheckIsLeaderError<u64, BasicNode>>,
    may_forward: bool,
) -> StoreResult<Option<Option<String>>> {
    match e.forward_to_leader::<BasicNode>() {
        Some(_) if !may_forward => Err(StoreError::NoLeader),
        Some(fwd) => match &fwd.leader_node {
            Some(node) => Ok(Some(Some(node.addr.clone()))),
            None => Err(StoreError::NoLeader),
        },
        None => Ok(None),
    }
}

fn unexpected(resp: ForwardResponse) -> StoreError {
    StoreError::Remote(format!("unexpected reply {resp:?}"))
}

/// Publish this member's name and client URL until the replicated
/// attributes match.
async fn publish_loop(inner: Arc<StoreInner>) {
    let wanted = (
        inner.config.name.clone(),
        vec![inner.config.advertise_client_url.clone()],
    );
    loop {
        let current = inner
            .view
            .member_attrs()
            .ok()
            .and_then(|mut attrs| attrs.remove(&inner.id));
        if current.is_some_and(|a| (a.name.clone(), a.client_urls.clone()) == wanted) {
            debug!(name = %wanted.0, "member attributes published");
            return;
        }

        let req = Request::PublishMember {
            id: inner.id,
            name: wanted.0.clone(),
            client_urls: wanted.1.clone(),
        };
        if let Err(e) = inner.write(req, true).await {
            debug!(error = %e, "publishing member attributes failed, retrying");
        }
        sleep(PUBLISH_RETRY).await;
    }
}

/// While leader, promote learners that have caught up to voters.
async fn promote_loop(inner: Arc<StoreInner>) {
    loop {
        sleep(PROMOTE_INTERVAL).await;

        let m = inner.raft.metrics().borrow().clone();
        if m.state != ServerState::Leader {
            continue;
        }
        let last = m.last_log_index.unwrap_or(0);
        let ready: BTreeSet<u64> = m
            .membership_config
            .membership()
            .learner_ids()
            .filter(|id| {
                m.replication
                    .as_ref()
                    .and_then(|r| r.get(id))
                    .and_then(|matched| *matched)
                    .is_some_and(|l| l.index + PROMOTE_LAG >= last)
            })
            .collect();
        if ready.is_empty() || m.membership_config.membership().get_joint_config().len() > 1 {
            continue;
        }

        let ids: Vec<String> = ready.iter().map(|id| format!("{id:x}")).collect();
        match inner
            .raft
            .change_membership(ChangeMembers::AddVoterIds(ready), false)
            .await
        {
            Ok(_) => info!(members = ?ids, "promoted learners to voters"),
            Err(e) => debug!(error = %e, "learner promotion failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalRouter;

    fn config(dir: &std::path::Path, name: &str, port: u16) -> StoreConfig {
        let peer = format!("http://127.0.0.1:{port}");
        StoreConfig {
            name: name.to_string(),
            data_dir: dir.join(name),
            listen_peer_url: peer.clone(),
            advertise_peer_url: peer.clone(),
            advertise_client_url: format!("http://localhost:{}", port + 1),
            initial_cluster: vec![(name.to_string(), peer)],
            cluster_state: ClusterState::New,
            cluster_token: "test-cluster".to_string(),
            ready_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
        }
    }

    async fn eventually<F: Fn() -> bool>(what: &str, f: F) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !f() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn rejects_member_missing_from_initial_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), "n1", 7100);
        cfg.initial_cluster = vec![("other".to_string(), "http://127.0.0.1:9".to_string())];
        let err = EmbeddedStore::start(cfg, Arc::new(LocalRouter::new()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[tokio::test]
    async fn single_member_bootstraps_and_serves_kv() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddedStore::start(config(dir.path(), "n1", 7110), Arc::new(LocalRouter::new()))
            .await
            .unwrap();
        assert!(store.is_leader());

        let rev = store.put("work", "{\"height\":1}").await.unwrap();
        assert!(rev > 0);
        assert_eq!(store.get("work").await.unwrap().as_deref(), Some("{\"height\":1}"));
        assert!(store.get("missing").await.unwrap().is_none());

        let del = store.delete("work").await.unwrap();
        assert!(del > rev);
        assert!(store.get("work").await.unwrap().is_none());

        eventually("name published", || {
            store.members().unwrap().first().is_some_and(|m| m.name == "n1")
        })
        .await;
        store.stop().await.unwrap();
    }

    #[tokio::test]
    async fn restart_resumes_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        let router = Arc::new(LocalRouter::new());
        let store = EmbeddedStore::start(config(dir.path(), "n1", 7120), router.clone())
            .await
            .unwrap();
        store.put("k", "v").await.unwrap();
        store.stop().await.unwrap();

        let mut cfg = config(dir.path(), "n1", 7120);
        cfg.cluster_state = ClusterState::Existing;
        let store = EmbeddedStore::start(cfg, router).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        store.stop().await.unwrap();
    }

    #[tokio::test]
    async fn force_new_keeps_kv_and_resets_membership() {
        let dir = tempfile::tempdir().unwrap();
        let router = Arc::new(LocalRouter::new());
        let store = EmbeddedStore::start(config(dir.path(), "n1", 7150), router.clone())
            .await
            .unwrap();
        store.put("work", "w").await.unwrap();
        store.put("k", "v").await.unwrap();
        store.add_member("http://127.0.0.1:7159").await.unwrap();
        assert_eq!(store.members().unwrap().len(), 2);
        store.stop().await.unwrap();

        let mut cfg = config(dir.path(), "n1", 7150);
        cfg.cluster_state = ClusterState::ForceNew;
        let store = EmbeddedStore::start(cfg, router).await.unwrap();
        assert!(store.is_leader());
        let members = store.members().unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id, store.id());
        assert_eq!(store.get("work").await.unwrap().as_deref(), Some("w"));
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        store.stop().await.unwrap();
    }

    #[tokio::test]
    async fn force_new_without_state_bootstraps() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), "n1", 7160);
        cfg.cluster_state = ClusterState::ForceNew;
        let store = EmbeddedStore::start(cfg, Arc::new(LocalRouter::new())).await.unwrap();
        assert!(store.is_leader());
        assert_eq!(store.members().unwrap().len(), 1);
        store.stop().await.unwrap();
    }

    #[tokio::test]
    async fn compact_checks_revision_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddedStore::start(config(dir.path(), "n1", 7130), Arc::new(LocalRouter::new()))
            .await
            .unwrap();
        let rev = store.put("a", "1").await.unwrap();
        store.put("a", "2").await.unwrap();

        assert!(matches!(
            store.compact(rev + 1000).await,
            Err(StoreError::FutureRevision { .. })
        ));

        store.compact(rev).await.unwrap();
        assert!(store.metrics().purged.is_some_and(|p| p.index >= rev));
        assert!(matches!(store.compact(rev).await, Err(StoreError::Compacted(_))));
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("2"));
        store.stop().await.unwrap();
    }

    #[tokio::test]
    async fn leader_watch_reports_current_leader_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddedStore::start(config(dir.path(), "n1", 7140), Arc::new(LocalRouter::new()))
            .await
            .unwrap();
        let mut watch = store.leader_watch();
        assert_eq!(watch.changed().await, Some(Some(store.id())));

        // No further change while the leader stays put.
        let next = tokio::time::timeout(Duration::from_millis(300), watch.changed()).await;
        assert!(next.is_err());
        store.stop().await.unwrap();
    }
}
