//! Wire messages and generated stubs for the peer gRPC service.

/// Envelope for every peer RPC: a JSON payload plus the cluster token.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RaftRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
    #[prost(string, tag = "2")]
    pub cluster_token: String,
}

/// Envelope for every peer RPC reply. `error` is empty on success.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RaftResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
    #[prost(string, tag = "2")]
    pub error: String,
}

include!(concat!(env!("OUT_DIR"), "/conclave.raft.RaftService.rs"));
