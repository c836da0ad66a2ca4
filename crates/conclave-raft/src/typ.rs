//! Raft type configuration for Conclave.
//!
//! Defines the `TypeConfig` that wires together all openraft
//! associated types, plus the payloads that travel through the log
//! and through leader forwarding.

use std::io::Cursor;

use openraft::TokioRuntime;

/// Client write request submitted to the Raft cluster.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Request {
    /// Store or update a value in the shared namespace.
    Put { key: String, value: String },
    /// Remove a key from the shared namespace.
    Delete { key: String },
    /// A member announcing its own name and client URLs.
    PublishMember {
        id: u64,
        name: String,
        client_urls: Vec<String>,
    },
}

/// Response returned after a write is applied to the state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Response {
    /// Log index the write was applied at.
    pub revision: u64,
}

/// Attributes a member publishes about itself once it is running.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MemberAttrs {
    pub name: String,
    pub client_urls: Vec<String>,
}

/// Operations a follower hands to the current leader.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum ForwardRequest {
    Write(Request),
    Read { key: String },
    AddLearner { peer_url: String },
    RemoveMember { id: u64 },
    TransferLeader { to: u64, within_ms: u64 },
}

/// Leader's answer to a [`ForwardRequest`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum ForwardResponse {
    Written(Response),
    Value(Option<String>),
    Added(u64),
    Done,
    /// The leader gave up waiting; carried apart from other failures so
    /// the follower can report it as a timeout.
    TimedOut(String),
}

/// Sent by a leader to the member that should take over leadership.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct TimeoutNow {
    pub within_ms: u64,
}

openraft::declare_raft_types!(
    /// Conclave Raft type configuration.
    pub TypeConfig:
        D = Request,
        R = Response,
        NodeId = u64,
        Node = openraft::BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

/// Convenience alias for the Raft instance.
pub type ConclaveRaft = openraft::Raft<TypeConfig>;

/// Metrics published by a [`ConclaveRaft`].
pub type Metrics = openraft::RaftMetrics<u64, openraft::BasicNode>;
