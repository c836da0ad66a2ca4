//! Error types for the coordination layer.

use conclave_raft::StoreError;
use thiserror::Error;

/// Result type alias for coordinator operations.
pub type CoordResult<T> = Result<T, CoordError>;

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("store is not running")]
    NotRunning,

    #[error("store is already running")]
    AlreadyRunning,

    #[error("local node identity is not configured")]
    NotConfigured,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// Store failures pass through unchanged, except timeouts, which
    /// surface as [`CoordError::Timeout`].
    #[error(transparent)]
    Store(StoreError),

    #[error("peer rpc failed: {0}")]
    Rpc(String),

    #[error("invalid cluster descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for CoordError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Timeout(what) => CoordError::Timeout(what),
            other => CoordError::Store(other),
        }
    }
}

impl From<tonic::Status> for CoordError {
    fn from(status: tonic::Status) -> Self {
        CoordError::Rpc(status.message().to_string())
    }
}

impl From<CoordError> for tonic::Status {
    fn from(e: CoordError) -> Self {
        match e {
            CoordError::NotRunning | CoordError::AlreadyRunning | CoordError::NotConfigured => {
                tonic::Status::failed_precondition(e.to_string())
            }
            CoordError::NotFound(_) => tonic::Status::not_found(e.to_string()),
            CoordError::Timeout(_) => tonic::Status::deadline_exceeded(e.to_string()),
            CoordError::InvalidDescriptor(_) | CoordError::Config(_) => {
                tonic::Status::invalid_argument(e.to_string())
            }
            _ => tonic::Status::internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_render_verbatim() {
        let err = CoordError::from(StoreError::NoLeader);
        assert_eq!(err.to_string(), StoreError::NoLeader.to_string());
    }

    #[test]
    fn store_timeouts_become_coordinator_timeouts() {
        let err = CoordError::from(StoreError::Timeout("leadership transferred".into()));
        assert!(matches!(err, CoordError::Timeout(ref what) if what == "leadership transferred"));
        assert!(matches!(
            CoordError::from(StoreError::NotReady(std::time::Duration::from_secs(1))),
            CoordError::Store(StoreError::NotReady(_))
        ));
    }

    #[test]
    fn status_codes_follow_error_kind() {
        let status = tonic::Status::from(CoordError::NotFound("n9".into()));
        assert_eq!(status.code(), tonic::Code::NotFound);
        let status = tonic::Status::from(CoordError::NotRunning);
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    }
}
