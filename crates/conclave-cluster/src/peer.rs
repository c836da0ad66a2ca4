//! Peer RPC client: the calls one node makes on another's node service.
//!
//! [`GrpcPeers`] talks tonic to the node service on each node's base
//! port. [`LocalPeers`] dispatches straight into coordinators living in
//! the same process.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::coordinator::Coordinator;
use crate::directory::NodeEntry;
use crate::error::{CoordError, CoordResult};
use crate::join::RelayEnvelope;
use crate::proto;
use crate::proto::node_service_client::NodeServiceClient;

#[async_trait]
pub trait PeerClient: Send + Sync + 'static {
    /// Ask `target` to admit the node `joiner_id` and relay the refreshed
    /// descriptor to join attempt `attempt`.
    async fn request_admission(&self, target: &NodeEntry, joiner_id: &str, attempt: u64) -> CoordResult<()>;

    /// Push a message to a joining node's mailbox.
    async fn relay(&self, target: &NodeEntry, envelope: RelayEnvelope) -> CoordResult<()>;

    /// Whether `target` is reachable and runs a store.
    async fn is_peer_up(&self, target: &NodeEntry) -> bool;
}

// ── In-process ──────────────────────────────────────────────────

/// Peer client for coordinators sharing one process, keyed by node name.
#[derive(Clone, Default)]
pub struct LocalPeers {
    nodes: Arc<RwLock<HashMap<String, Weak<Coordinator>>>>,
}

impl LocalPeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, coordinator: &Arc<Coordinator>) {
        self.nodes
            .write()
            .insert(coordinator.name().to_string(), Arc::downgrade(coordinator));
    }

    fn get(&self, target: &NodeEntry) -> CoordResult<Arc<Coordinator>> {
        self.nodes
            .read()
            .get(&target.name)
            .and_then(Weak::upgrade)
            .ok_or_else(|| CoordError::Rpc(format!("{} is unreachable", target.name)))
    }
}

#[async_trait]
impl PeerClient for LocalPeers {
    async fn request_admission(&self, target: &NodeEntry, joiner_id: &str, attempt: u64) -> CoordResult<()> {
        let peer = self.get(target)?;
        peer.handle_admission(joiner_id, attempt).await
    }

    async fn relay(&self, target: &NodeEntry, envelope: RelayEnvelope) -> CoordResult<()> {
        let peer = self.get(target)?;
        if peer.deliver(envelope) {
            Ok(())
        } else {
            Err(CoordError::NotFound(format!("join mailbox on {}", target.name)))
        }
    }

    async fn is_peer_up(&self, target: &NodeEntry) -> bool {
        match self.get(target) {
            Ok(peer) => peer.is_running().await,
            Err(_) => false,
        }
    }
}

// ── gRPC ────────────────────────────────────────────────────────

/// Peer client over the tonic node service.
pub struct GrpcPeers {
    cluster_token: String,
    timeout: Duration,
    clients: Mutex<HashMap<String, NodeServiceClient<Channel>>>,
}

impl GrpcPeers {
    /// `timeout` bounds each call; admission calls wait for the peer's
    /// membership change, so it should exceed the request timeout.
    pub fn new(cluster_token: &str, timeout: Duration) -> Self {
        Self {
            cluster_token: cluster_token.to_string(),
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, url: &str) -> CoordResult<NodeServiceClient<Channel>> {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(url) {
            return Ok(client.clone());
        }
        let channel = Endpoint::from_shared(url.to_string())
            .map_err(|e| CoordError::Rpc(format!("invalid endpoint {url}: {e}")))?
            .connect_timeout(self.timeout)
            .connect_lazy();
        let client = NodeServiceClient::new(channel);
        clients.insert(url.to_string(), client.clone());
        debug!(url, "created node service channel");
        Ok(client)
    }

    fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut req = tonic::Request::new(message);
        req.set_timeout(self.timeout);
        req
    }

    fn failed(&self, url: &str, status: tonic::Status) -> CoordError {
        self.clients.lock().remove(url);
        status.into()
    }
}

#[async_trait]
impl PeerClient for GrpcPeers {
    async fn request_admission(&self, target: &NodeEntry, joiner_id: &str, attempt: u64) -> CoordResult<()> {
        let url = target.node_url();
        let req = self.request(proto::AdmissionRequest {
            joiner_id: joiner_id.to_string(),
            attempt,
            cluster_token: self.cluster_token.clone(),
        });
        self.client(&url)?
            .request_admission(req)
            .await
            .map_err(|s| self.failed(&url, s))?;
        Ok(())
    }

    async fn relay(&self, target: &NodeEntry, envelope: RelayEnvelope) -> CoordResult<()> {
        let url = target.node_url();
        let message = serde_json::to_string(&envelope.message)
            .map_err(|e| CoordError::Rpc(format!("encode relay: {e}")))?;
        let req = self.request(proto::RelayRequest {
            attempt: envelope.attempt,
            message,
            cluster_token: self.cluster_token.clone(),
        });
        self.client(&url)?
            .relay(req)
            .await
            .map_err(|s| self.failed(&url, s))?;
        Ok(())
    }

    async fn is_peer_up(&self, target: &NodeEntry) -> bool {
        let url = target.node_url();
        let Ok(mut client) = self.client(&url) else {
            return false;
        };
        let req = self.request(proto::PingRequest {
            cluster_token: self.cluster_token.clone(),
        });
        match client.ping(req).await {
            Ok(resp) => resp.into_inner().running,
            Err(status) => {
                debug!(peer = %target.name, error = %status.message(), "ping failed");
                self.failed(&url, status);
                false
            }
        }
    }
}

/// Send an operator command to the node service at `url`.
pub async fn control(url: &str, cluster_token: &str, command: &str, arg: &str) -> CoordResult<String> {
    let channel = Endpoint::from_shared(url.to_string())
        .map_err(|e| CoordError::Rpc(format!("invalid endpoint {url}: {e}")))?
        .connect()
        .await
        .map_err(|e| CoordError::Rpc(format!("connect {url}: {e}")))?;
    let resp = NodeServiceClient::new(channel)
        .control(proto::ControlRequest {
            command: command.to_string(),
            arg: arg.to_string(),
            cluster_token: cluster_token.to_string(),
        })
        .await?;
    Ok(resp.into_inner().output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unregistered_local_peer_is_down() {
        let peers = LocalPeers::new();
        let target = NodeEntry::new("n9", "id-9", "127.0.0.1", 7900);
        assert!(!peers.is_peer_up(&target).await);
        assert!(matches!(
            peers.request_admission(&target, "id-1", 1).await,
            Err(CoordError::Rpc(_))
        ));
    }

    #[tokio::test]
    async fn grpc_peer_on_closed_port_is_down() {
        let peers = GrpcPeers::new("t", Duration::from_millis(200));
        let target = NodeEntry::new("n9", "id-9", "127.0.0.1", 1);
        assert!(!peers.is_peer_up(&target).await);
    }
}
