//! gRPC peer transport.
//!
//! Client side caches one lazily-connected channel per peer URL; server
//! side mounts a [`RaftEndpoint`] behind the generated `RaftService`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Channel, Endpoint, Server};
use tonic::{Request, Response, Status};
use tracing::{debug, error, info};

use crate::error::{StoreError, StoreResult};
use crate::proto;
use crate::proto::raft_service_client::RaftServiceClient;
use crate::proto::raft_service_server::{RaftService, RaftServiceServer};
use crate::transport::{Listener, RaftCall, RaftEndpoint, RaftMethod, RaftReply, Transport, TransportError};

/// Peer transport over tonic gRPC.
pub struct GrpcTransport {
    clients: Mutex<HashMap<String, RaftServiceClient<Channel>>>,
    connect_timeout: Duration,
}

impl GrpcTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            connect_timeout,
        }
    }

    fn client(&self, addr: &str) -> Result<RaftServiceClient<Channel>, TransportError> {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(addr) {
            return Ok(client.clone());
        }
        let channel = Endpoint::from_shared(addr.to_string())
            .map_err(|e| TransportError::new(addr, format!("invalid endpoint: {e}")))?
            .connect_timeout(self.connect_timeout)
            .connect_lazy();
        let client = RaftServiceClient::new(channel);
        clients.insert(addr.to_string(), client.clone());
        debug!(addr, "created raft peer channel");
        Ok(client)
    }
}

impl Default for GrpcTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Resolve a `scheme://host:port` listen URL to a bindable address.
pub fn socket_addr(listen: &str) -> StoreResult<SocketAddr> {
    let url = url::Url::parse(listen)
        .map_err(|e| StoreError::Config(format!("invalid listen url {listen}: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| StoreError::Config(format!("listen url {listen} has no host")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| StoreError::Config(format!("listen url {listen} has no port")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    format!("{host}:{port}")
        .parse()
        .or_else(|_| {
            if host == "localhost" {
                Ok(SocketAddr::from(([127, 0, 0, 1], port)))
            } else {
                Err(StoreError::Config(format!("listen url {listen} is not an ip address")))
            }
        })
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn call(&self, addr: &str, call: RaftCall) -> Result<RaftReply, TransportError> {
        let mut client = self.client(addr)?;
        let req = proto::RaftRequest {
            data: call.data,
            cluster_token: call.cluster_token,
        };

        let result = match call.method {
            RaftMethod::AppendEntries => client.append_entries(req).await,
            RaftMethod::Vote => client.vote(req).await,
            RaftMethod::InstallSnapshot => client.install_snapshot(req).await,
            RaftMethod::Forward => client.forward(req).await,
            RaftMethod::TimeoutNow => client.timeout_now(req).await,
        };

        match result {
            Ok(resp) => {
                let inner = resp.into_inner();
                Ok(RaftReply {
                    data: inner.data,
                    error: inner.error,
                })
            }
            Err(status) => {
                self.clients.lock().remove(addr);
                Err(TransportError::new(addr, status))
            }
        }
    }

    async fn serve(
        &self,
        listen: &str,
        advertise: &str,
        endpoint: Arc<RaftEndpoint>,
    ) -> StoreResult<Listener> {
        let addr = socket_addr(listen)?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| StoreError::Transport(format!("bind {addr}: {e}")))?;
        info!(%addr, advertise, "raft peer listener started");

        let (tx, rx) = oneshot::channel::<()>();
        let service = RaftServiceServer::new(RaftGrpcServer { endpoint });
        let task = tokio::spawn(async move {
            let shutdown = async {
                let _ = rx.await;
            };
            if let Err(e) = Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
                .await
            {
                error!(%addr, error = %e, "raft peer listener failed");
            }
            debug!(%addr, "raft peer listener stopped");
        });
        Ok(Listener::new(tx, task))
    }
}

// ── Server ──────────────────────────────────────────────────────

/// gRPC face of a [`RaftEndpoint`].
struct RaftGrpcServer {
    endpoint: Arc<RaftEndpoint>,
}

impl RaftGrpcServer {
    async fn handle(
        &self,
        method: RaftMethod,
        request: Request<proto::RaftRequest>,
    ) -> Result<Response<proto::RaftResponse>, Status> {
        let inner = request.into_inner();
        let reply = self
            .endpoint
            .dispatch(RaftCall {
                method,
                cluster_token: inner.cluster_token,
                data: inner.data,
            })
            .await;
        Ok(Response::new(proto::RaftResponse {
            data: reply.data,
            error: reply.error,
        }))
    }
}

#[tonic::async_trait]
impl RaftService for RaftGrpcServer {
    async fn append_entries(
        &self,
        request: Request<proto::RaftRequest>,
    ) -> Result<Response<proto::RaftResponse>, Status> {
        self.handle(RaftMethod::AppendEntries, request).await
    }

    async fn vote(
        &self,
        request: Request<proto::RaftRequest>,
    ) -> Result<Response<proto::RaftResponse>, Status> {
        self.handle(RaftMethod::Vote, request).await
    }

    async fn install_snapshot(
        &self,
        request: Request<proto::RaftRequest>,
    ) -> Result<Response<proto::RaftResponse>, Status> {
        self.handle(RaftMethod::InstallSnapshot, request).await
    }

    async fn forward(
        &self,
        request: Request<proto::RaftRequest>,
    ) -> Result<Response<proto::RaftResponse>, Status> {
        self.handle(RaftMethod::Forward, request).await
    }

    async fn timeout_now(
        &self,
        request: Request<proto::RaftRequest>,
    ) -> Result<Response<proto::RaftResponse>, Status> {
        self.handle(RaftMethod::TimeoutNow, request).await
    }
}
