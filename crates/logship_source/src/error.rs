//! Error types for the replication source.

use logship_core::{CoreError, ErrorCode};
use logship_protocol::{ErrorResponse, ProtocolError, SnapshotId};
use thiserror::Error;

/// Result type for source operations.
pub type SourceResult<T> = Result<T, SourceError>;

/// Errors that can occur while serving a replica.
#[derive(Error, Debug)]
pub enum SourceError {
    /// Missing, invalid or expired credentials.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// The request is malformed or not acceptable.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The snapshot does not exist or has expired.
    #[error("unknown snapshot: {0}")]
    SnapshotNotFound(SnapshotId),

    /// The snapshot does not contain the collection.
    #[error("collection {collection} is not part of snapshot {snapshot}")]
    NotInSnapshot {
        /// Snapshot id.
        snapshot: SnapshotId,
        /// Requested collection id.
        collection: u64,
    },

    /// Storage error.
    #[error("database error: {0}")]
    Core(#[from] CoreError),

    /// Encoding or decoding error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SourceError {
    /// Returns the code sent to the replica.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unauthorized(_) => ErrorCode::UNAUTHORIZED,
            Self::InvalidRequest(_) | Self::Protocol(_) => ErrorCode::BAD_PARAMETER,
            Self::SnapshotNotFound(_) | Self::NotInSnapshot { .. } => ErrorCode::NOT_FOUND,
            Self::Core(err) => err.code(),
            Self::Internal(_) => ErrorCode::INTERNAL,
        }
    }

    /// Returns true if the replica is to blame.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Internal(_))
    }

    /// Converts the error into its wire form.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.code(), self.to_string())
    }
}
