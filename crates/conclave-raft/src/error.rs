//! Error types for the embedded replicated store.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the embedded store.
///
/// Consensus failures are carried as their rendered message so callers
/// see them verbatim; this layer never reinterprets them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open storage: {0}")]
    Open(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid store configuration: {0}")]
    Config(String),

    #[error("raft error: {0}")]
    Raft(String),

    #[error("no leader is currently known")]
    NoLeader,

    #[error("remote peer error: {0}")]
    Remote(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unknown member: {0:x}")]
    UnknownMember(u64),

    #[error("member {0:x} is not a voter")]
    NotVoter(u64),

    #[error("store did not become ready within {0:?}")]
    NotReady(std::time::Duration),

    #[error("revision {requested} is ahead of the applied revision {applied}")]
    FutureRevision { requested: u64, applied: u64 },

    #[error("revision {0} has already been compacted")]
    Compacted(u64),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub(crate) fn raft(e: impl std::fmt::Display) -> Self {
        StoreError::Raft(e.to_string())
    }

    pub(crate) fn storage(e: impl std::fmt::Display) -> Self {
        StoreError::Storage(e.to_string())
    }
}
