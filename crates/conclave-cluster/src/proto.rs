//! Wire messages and generated stubs for the node service.

/// Ask a member to admit the node identified by `joiner_id`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AdmissionRequest {
    #[prost(string, tag = "1")]
    pub joiner_id: String,
    /// Join attempt the descriptor must be relayed back to.
    #[prost(uint64, tag = "2")]
    pub attempt: u64,
    #[prost(string, tag = "3")]
    pub cluster_token: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AdmissionResponse {}

/// A message pushed to a joining node's mailbox.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RelayRequest {
    #[prost(uint64, tag = "1")]
    pub attempt: u64,
    /// JSON-encoded relay message.
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(string, tag = "3")]
    pub cluster_token: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RelayResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PingRequest {
    #[prost(string, tag = "1")]
    pub cluster_token: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PingResponse {
    #[prost(string, tag = "1")]
    pub name: String,
    /// Whether the node's store is running.
    #[prost(bool, tag = "2")]
    pub running: bool,
}

/// Operator command for the local node.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ControlRequest {
    #[prost(string, tag = "1")]
    pub command: String,
    #[prost(string, tag = "2")]
    pub arg: String,
    #[prost(string, tag = "3")]
    pub cluster_token: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ControlResponse {
    #[prost(string, tag = "1")]
    pub output: String,
}

include!(concat!(env!("OUT_DIR"), "/conclave.cluster.NodeService.rs"));
