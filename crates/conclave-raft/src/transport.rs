//! Peer transport abstraction.
//!
//! Raft RPCs, leader forwarding and leadership hand-off all travel as a
//! JSON payload plus a method tag. A [`Transport`] moves those payloads
//! between members; [`RaftEndpoint`] is the receiving side that turns
//! them back into calls on the local Raft instance.
//!
//! Two transports exist: gRPC for real deployments (see `grpc`) and an
//! in-process [`LocalRouter`] used by tests and single-process clusters.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::typ::{ConclaveRaft, ForwardRequest, ForwardResponse, TimeoutNow, TypeConfig};

/// Which peer operation a [`RaftCall`] invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftMethod {
    AppendEntries,
    Vote,
    InstallSnapshot,
    Forward,
    TimeoutNow,
}

/// One outbound peer request.
#[derive(Debug, Clone)]
pub struct RaftCall {
    pub method: RaftMethod,
    pub cluster_token: String,
    pub data: Vec<u8>,
}

/// Reply to a [`RaftCall`]. A non-empty `error` means the peer refused
/// or failed the call; `data` is then empty.
#[derive(Debug, Clone, Default)]
pub struct RaftReply {
    pub data: Vec<u8>,
    pub error: String,
}

impl RaftReply {
    fn ok(value: &impl Serialize) -> Self {
        match serde_json::to_vec(value) {
            Ok(data) => Self {
                data,
                error: String::new(),
            },
            Err(e) => Self::failed(format!("serialize: {e}")),
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            data: Vec::new(),
            error: error.into(),
        }
    }
}

/// The peer could not be reached at all.
#[derive(Debug, thiserror::Error)]
#[error("peer {addr} unreachable: {reason}")]
pub struct TransportError {
    pub addr: String,
    pub reason: String,
}

impl TransportError {
    pub fn new(addr: &str, reason: impl std::fmt::Display) -> Self {
        Self {
            addr: addr.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Moves peer calls between members.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver `call` to the member advertising `addr`.
    async fn call(&self, addr: &str, call: RaftCall) -> Result<RaftReply, TransportError>;

    /// Start accepting calls for `endpoint`.
    ///
    /// `listen` is the local bind URL; `advertise` is the URL other
    /// members use to reach it.
    async fn serve(
        &self,
        listen: &str,
        advertise: &str,
        endpoint: Arc<RaftEndpoint>,
    ) -> StoreResult<Listener>;
}

/// Handle on a running listener.
pub struct Listener {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Listener {
    pub fn new(shutdown: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            shutdown: Some(shutdown),
            task: Some(task),
        }
    }

    /// Stop accepting calls and wait for the listener to wind down.
    pub async fn close(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "listener task ended abnormally");
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Store-level operations a peer may ask of this member.
#[async_trait]
pub trait PeerHandler: Send + Sync + 'static {
    /// Serve a request a follower forwarded to this (leader) member.
    async fn forward(&self, req: ForwardRequest) -> StoreResult<ForwardResponse>;

    /// The current leader asks this member to take over leadership.
    async fn timeout_now(&self, req: TimeoutNow) -> StoreResult<()>;
}

/// What an open endpoint dispatches to.
struct Target {
    raft: ConclaveRaft,
    handler: Arc<dyn PeerHandler>,
}

/// Receiving side of the peer protocol for one member.
pub struct RaftEndpoint {
    cluster_token: String,
    target: tokio::sync::RwLock<Option<Target>>,
}

impl RaftEndpoint {
    pub fn new(raft: ConclaveRaft, cluster_token: String, handler: Arc<dyn PeerHandler>) -> Self {
        Self {
            cluster_token,
            target: tokio::sync::RwLock::new(Some(Target { raft, handler })),
        }
    }

    /// Wait for in-flight calls to finish, then let go of the member.
    /// Later calls are refused.
    pub async fn close(&self) {
        self.target.write().await.take();
    }

    /// Decode, execute and encode one peer call.
    ///
    /// Raft RPC failures are returned as the JSON-encoded openraft error
    /// so the caller can rebuild it; everything else as plain text.
    pub async fn dispatch(&self, call: RaftCall) -> RaftReply {
        if call.cluster_token != self.cluster_token {
            warn!(method = ?call.method, "rejecting call from another cluster");
            return RaftReply::failed("cluster token mismatch");
        }
        let target = self.target.read().await;
        let Some(Target { raft, handler }) = target.as_ref() else {
            return RaftReply::failed("member is shutting down");
        };

        match call.method {
            RaftMethod::AppendEntries => {
                let req: openraft::raft::AppendEntriesRequest<TypeConfig> =
                    match serde_json::from_slice(&call.data) {
                        Ok(r) => r,
                        Err(e) => return RaftReply::failed(format!("deserialize: {e}")),
                    };
                match raft.append_entries(req).await {
                    Ok(resp) => RaftReply::ok(&resp),
                    Err(e) => raft_failure(&e),
                }
            }
            RaftMethod::Vote => {
                let req: openraft::raft::VoteRequest<u64> = match serde_json::from_slice(&call.data) {
                    Ok(r) => r,
                    Err(e) => return RaftReply::failed(format!("deserialize: {e}")),
                };
                debug!(term = req.vote.leader_id().term, "handling vote RPC");
                match raft.vote(req).await {
                    Ok(resp) => RaftReply::ok(&resp),
                    Err(e) => raft_failure(&e),
                }
            }
            RaftMethod::InstallSnapshot => {
                let req: openraft::raft::InstallSnapshotRequest<TypeConfig> =
                    match serde_json::from_slice(&call.data) {
                        Ok(r) => r,
                        Err(e) => return RaftReply::failed(format!("deserialize: {e}")),
                    };
                debug!(offset = req.offset, done = req.done, "handling install_snapshot RPC");
                match raft.install_snapshot(req).await {
                    Ok(resp) => RaftReply::ok(&resp),
                    Err(e) => raft_failure(&e),
                }
            }
            RaftMethod::Forward => {
                let req: ForwardRequest = match serde_json::from_slice(&call.data) {
                    Ok(r) => r,
                    Err(e) => return RaftReply::failed(format!("deserialize: {e}")),
                };
                match handler.forward(req).await {
                    Ok(resp) => RaftReply::ok(&resp),
                    Err(e) => RaftReply::failed(e.to_string()),
                }
            }
            RaftMethod::TimeoutNow => {
                let req: TimeoutNow = match serde_json::from_slice(&call.data) {
                    Ok(r) => r,
                    Err(e) => return RaftReply::failed(format!("deserialize: {e}")),
                };
                match handler.timeout_now(req).await {
                    Ok(()) => RaftReply::ok(&()),
                    Err(e) => RaftReply::failed(e.to_string()),
                }
            }
        }
    }
}

fn raft_failure(e: &impl Serialize) -> RaftReply {
    match serde_json::to_string(e) {
        Ok(json) => RaftReply::failed(json),
        Err(se) => RaftReply::failed(format!("serialize error: {se}")),
    }
}

// ── In-process transport ────────────────────────────────────────

/// In-process transport: members in one process find each other by
/// their advertised peer URL.
#[derive(Clone, Default)]
pub struct LocalRouter {
    endpoints: Arc<RwLock<HashMap<String, Arc<RaftEndpoint>>>>,
}

impl LocalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether some member is currently serving at `addr`.
    pub fn is_serving(&self, addr: &str) -> bool {
        self.endpoints.read().contains_key(normalize(addr))
    }
}

fn normalize(addr: &str) -> &str {
    addr.trim_end_matches('/')
}

#[async_trait]
impl Transport for LocalRouter {
    async fn call(&self, addr: &str, call: RaftCall) -> Result<RaftReply, TransportError> {
        let endpoint = self
            .endpoints
            .read()
            .get(normalize(addr))
            .cloned()
            .ok_or_else(|| TransportError::new(addr, "connection refused"))?;
        Ok(endpoint.dispatch(call).await)
    }

    async fn serve(
        &self,
        _listen: &str,
        advertise: &str,
        endpoint: Arc<RaftEndpoint>,
    ) -> StoreResult<Listener> {
        let key = normalize(advertise).to_string();
        {
            let mut endpoints = self.endpoints.write();
            if endpoints.contains_key(&key) {
                return Err(StoreError::Transport(format!("{key}: address in use")));
            }
            endpoints.insert(key.clone(), Arc::clone(&endpoint));
        }
        debug!(addr = %key, "local endpoint registered");

        let (tx, rx) = oneshot::channel();
        let endpoints = Arc::clone(&self.endpoints);
        let task = tokio::spawn(async move {
            let _ = rx.await;
            let mut map = endpoints.write();
            if map.get(&key).is_some_and(|e| Arc::ptr_eq(e, &endpoint)) {
                map.remove(&key);
            }
            debug!(addr = %key, "local endpoint removed");
        });
        Ok(Listener::new(tx, task))
    }
}
