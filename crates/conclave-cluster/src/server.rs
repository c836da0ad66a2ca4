//! Node service: the gRPC face of a coordinator.
//!
//! Serves the peer side of the join protocol (admission and relay),
//! liveness pings, and operator control commands.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;
use crate::error::{CoordError, CoordResult};
use crate::join::{RelayEnvelope, RelayMessage};
use crate::proto;
use crate::proto::node_service_server::{NodeService, NodeServiceServer};

pub struct NodeServer {
    coordinator: Arc<Coordinator>,
}

impl NodeServer {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    /// Get the tonic service for mounting on a gRPC server.
    pub fn into_service(self) -> NodeServiceServer<Self> {
        NodeServiceServer::new(self)
    }

    fn check_token(&self, token: &str) -> Result<(), Status> {
        if token == self.coordinator.config().cluster_token {
            Ok(())
        } else {
            warn!("rejected call with foreign cluster token");
            Err(Status::permission_denied("cluster token mismatch"))
        }
    }
}

#[tonic::async_trait]
impl NodeService for NodeServer {
    async fn request_admission(
        &self,
        request: Request<proto::AdmissionRequest>,
    ) -> Result<Response<proto::AdmissionResponse>, Status> {
        let req = request.into_inner();
        self.check_token(&req.cluster_token)?;
        self.coordinator
            .handle_admission(&req.joiner_id, req.attempt)
            .await?;
        Ok(Response::new(proto::AdmissionResponse {}))
    }

    async fn relay(
        &self,
        request: Request<proto::RelayRequest>,
    ) -> Result<Response<proto::RelayResponse>, Status> {
        let req = request.into_inner();
        self.check_token(&req.cluster_token)?;
        let message: RelayMessage = serde_json::from_str(&req.message)
            .map_err(|e| Status::invalid_argument(format!("relay message: {e}")))?;
        let delivered = self.coordinator.deliver(RelayEnvelope {
            attempt: req.attempt,
            message,
        });
        if !delivered {
            return Err(Status::not_found(format!("no join attempt {}", req.attempt)));
        }
        debug!(attempt = req.attempt, "relay delivered");
        Ok(Response::new(proto::RelayResponse {}))
    }

    async fn ping(
        &self,
        request: Request<proto::PingRequest>,
    ) -> Result<Response<proto::PingResponse>, Status> {
        self.check_token(&request.into_inner().cluster_token)?;
        Ok(Response::new(proto::PingResponse {
            name: self.coordinator.name().to_string(),
            running: self.coordinator.is_running().await,
        }))
    }

    async fn control(
        &self,
        request: Request<proto::ControlRequest>,
    ) -> Result<Response<proto::ControlResponse>, Status> {
        let req = request.into_inner();
        self.check_token(&req.cluster_token)?;
        info!(command = %req.command, arg = %req.arg, "control command");
        let output = run_control(&self.coordinator, &req.command, &req.arg).await?;
        Ok(Response::new(proto::ControlResponse { output }))
    }
}

/// Execute one operator command against `coordinator`.
pub async fn run_control(coordinator: &Coordinator, command: &str, arg: &str) -> CoordResult<String> {
    match command {
        "init" => {
            coordinator.init(arg == "bootstrap").await?;
            Ok(coordinator.current_descriptor().await)
        }
        "start" => {
            coordinator.start().await?;
            Ok(coordinator.current_descriptor().await)
        }
        "stop" => coordinator.stop().await.map(|()| String::new()),
        "wipe" => coordinator.wipe().await.map(|()| String::new()),
        "add" => coordinator.add(arg).await,
        "remove" => coordinator.remove(arg).await,
        "move-leader" => coordinator.move_leader(arg).await.map(|()| String::new()),
        "join" => {
            coordinator.join(arg).await?;
            Ok(coordinator.current_descriptor().await)
        }
        "cluster" => Ok(coordinator.current_descriptor().await),
        "leader" => {
            let (id, node) = coordinator.leader(None).await;
            Ok(match node {
                Some(n) => format!("{id:x} {}", n.name),
                None => format!("{id:x}"),
            })
        }
        "info" => {
            let info = coordinator.info().await?;
            serde_json::to_string_pretty(&info).map_err(|e| CoordError::Rpc(e.to_string()))
        }
        "get-work" => coordinator.get_work().await,
        "put-work" => coordinator.put_work(arg).await.map(|rev| rev.to_string()),
        "delete-work" => coordinator.delete_work().await.map(|rev| rev.to_string()),
        other => Err(CoordError::NotFound(format!("command {other}"))),
    }
}
