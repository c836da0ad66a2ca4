//! Raft network layer over a [`Transport`].
//!
//! Implements `RaftNetworkFactory` and `RaftNetwork` so that openraft
//! can talk to peers. Each RPC is serialized to JSON, carried by the
//! transport, and the reply decoded back into openraft's types.

use std::sync::Arc;

use openraft::error::{InstallSnapshotError, RPCError, RaftError, RemoteError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::transport::{RaftCall, RaftMethod, Transport};
use crate::typ::TypeConfig;

/// Factory that creates per-peer connections over a shared transport.
pub struct NetworkFactory {
    transport: Arc<dyn Transport>,
    cluster_token: String,
}

impl NetworkFactory {
    pub fn new(transport: Arc<dyn Transport>, cluster_token: String) -> Self {
        Self {
            transport,
            cluster_token,
        }
    }
}

/// A single peer connection.
pub struct NetworkConnection {
    target: u64,
    addr: String,
    transport: Arc<dyn Transport>,
    cluster_token: String,
}

type RpcResult<T, E> = Result<T, RPCError<u64, BasicNode, RaftError<u64, E>>>;

impl NetworkConnection {
    fn unreachable<E: std::error::Error>(&self, msg: &str) -> RPCError<u64, BasicNode, E> {
        RPCError::Unreachable(Unreachable::new(&std::io::Error::other(format!(
            "raft rpc to node {:x} ({}): {msg}",
            self.target, self.addr
        ))))
    }

    async fn send<Req, Resp, E>(
        &self,
        method: RaftMethod,
        rpc: &Req,
        option: &RPCOption,
    ) -> RpcResult<Resp, E>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: std::error::Error + DeserializeOwned,
    {
        let data = serde_json::to_vec(rpc)
            .map_err(|e| self.unreachable(&format!("serialize: {e}")))?;
        let call = RaftCall {
            method,
            cluster_token: self.cluster_token.clone(),
            data,
        };

        let reply = tokio::time::timeout(option.hard_ttl(), self.transport.call(&self.addr, call))
            .await
            .map_err(|_| self.unreachable(&format!("no reply within {:?}", option.hard_ttl())))?
            .map_err(|e| self.unreachable(&e.to_string()))?;

        if !reply.error.is_empty() {
            // Anything that is not an openraft error (e.g. a token
            // mismatch) means the peer is not one we can talk to.
            return match serde_json::from_str::<RaftError<u64, E>>(&reply.error) {
                Ok(raft_err) => Err(RPCError::RemoteError(RemoteError::new(self.target, raft_err))),
                Err(_) => Err(self.unreachable(&reply.error)),
            };
        }

        serde_json::from_slice(&reply.data)
            .map_err(|e| self.unreachable(&format!("deserialize response: {e}")))
    }
}

impl RaftNetworkFactory<TypeConfig> for NetworkFactory {
    type Network = NetworkConnection;

    async fn new_client(&mut self, target: u64, node: &BasicNode) -> Self::Network {
        debug!(peer = %format!("{target:x}"), addr = %node.addr, "creating raft network connection");
        NetworkConnection {
            target,
            addr: node.addr.clone(),
            transport: Arc::clone(&self.transport),
            cluster_token: self.cluster_token.clone(),
        }
    }
}

impl RaftNetwork<TypeConfig> for NetworkConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        option: RPCOption,
    ) -> RpcResult<AppendEntriesResponse<u64>, openraft::error::Infallible> {
        self.send(RaftMethod::AppendEntries, &rpc, &option).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        option: RPCOption,
    ) -> RpcResult<InstallSnapshotResponse<u64>, InstallSnapshotError> {
        self.send(RaftMethod::InstallSnapshot, &rpc, &option).await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<u64>,
        option: RPCOption,
    ) -> RpcResult<VoteResponse<u64>, openraft::error::Infallible> {
        self.send(RaftMethod::Vote, &rpc, &option).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalRouter;

    #[tokio::test]
    async fn factory_creates_connection() {
        let mut factory = NetworkFactory::new(Arc::new(LocalRouter::new()), "t".to_string());
        let node = BasicNode::new("http://127.0.0.1:9100");
        let conn = factory.new_client(1, &node).await;
        assert_eq!(conn.target, 1);
        assert_eq!(conn.addr, "http://127.0.0.1:9100");
    }

    #[tokio::test]
    async fn absent_peer_is_unreachable() {
        let mut factory = NetworkFactory::new(Arc::new(LocalRouter::new()), "t".to_string());
        let mut conn = factory
            .new_client(7, &BasicNode::new("http://127.0.0.1:1"))
            .await;
        let req = VoteRequest::<u64> {
            vote: openraft::Vote::new(1, 2),
            last_log_id: None,
        };
        let err = conn
            .vote(req, RPCOption::new(std::time::Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, RPCError::Unreachable(_)));
    }
}
