//! Error types for the replica side.

use logship_core::{CoreError, ErrorCode, Tick, TransactionId};
use logship_protocol::{ErrorResponse, ProtocolError};
use thiserror::Error;

/// Result type for replica operations.
pub type ApplierResult<T> = Result<T, ApplierError>;

/// Errors raised by the initial sync and the applier.
#[derive(Error, Debug, Clone)]
pub enum ApplierError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A request did not complete in time.
    #[error("operation timed out")]
    Timeout,

    /// The source answered with an error.
    #[error("source error {code}: {message}")]
    Remote {
        /// Code reported by the source.
        code: ErrorCode,
        /// Message reported by the source.
        message: String,
    },

    /// The source answered with something the request did not ask for.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A frame or chunk could not be decoded or broke the protocol rules.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The source could not be reached within the retry budget.
    #[error("no response from source after {attempts} attempts: {message}")]
    NoResponse {
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        message: String,
    },

    /// The requested start tick was already pruned on the source.
    #[error("start tick {tick} is no longer present on the source")]
    StartTickNotPresent {
        /// The requested tick.
        tick: Tick,
    },

    /// A transaction marker that does not fit the open transactions.
    #[error("unexpected {marker} marker for {transaction} at tick {tick}")]
    UnexpectedMarker {
        /// Marker name.
        marker: &'static str,
        /// Transaction the marker names.
        transaction: TransactionId,
        /// Tick of the marker.
        tick: Tick,
    },

    /// An entry refers to a transaction that is not open.
    #[error("entry at tick {tick} refers to unknown {transaction}")]
    UnexpectedTransaction {
        /// Transaction the entry names.
        transaction: TransactionId,
        /// Tick of the entry.
        tick: Tick,
    },

    /// Open transactions buffered more entries than allowed.
    #[error("open transactions exceed {limit} buffered entries")]
    TransactionTooLarge {
        /// Configured bound.
        limit: usize,
    },

    /// Applying an entry to the replica failed.
    #[error("failed to apply {operation} at tick {tick}: {source}")]
    Apply {
        /// Tick of the failing entry.
        tick: Tick,
        /// Operation name.
        operation: &'static str,
        /// The storage error.
        #[source]
        source: CoreError,
    },

    /// The operation is not valid in the applier's current state.
    #[error("invalid applier state: cannot {operation} while {state}")]
    InvalidState {
        /// Requested operation.
        operation: &'static str,
        /// Current phase.
        state: &'static str,
    },

    /// The applier is running.
    #[error("applier is running")]
    Running,

    /// The configuration is unusable.
    #[error("invalid applier configuration: {0}")]
    InvalidConfiguration(String),

    /// Replica storage error outside of entry application.
    #[error("database error: {0}")]
    Core(#[from] CoreError),

    /// Applier state could not be loaded or saved.
    #[error("state persistence error: {0}")]
    Persistence(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApplierError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Wraps an error answer from the source.
    pub fn remote(response: ErrorResponse) -> Self {
        Self::Remote {
            code: response.code,
            message: response.message,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::Timeout => true,
            _ => false,
        }
    }

    /// Returns true if the source rejected the credentials or the session.
    pub fn is_unauthorized(&self) -> bool {
        self.code() == ErrorCode::UNAUTHORIZED
    }

    /// Stable numeric code, as reported in `lastError`.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Transport { .. } | Self::Timeout | Self::NoResponse { .. } => {
                ErrorCode::REPLICATION_NO_RESPONSE
            }
            Self::Remote { code, .. } => *code,
            Self::InvalidResponse(_) | Self::Protocol(_) => ErrorCode::REPLICATION_INVALID_RESPONSE,
            Self::StartTickNotPresent { .. } => ErrorCode::REPLICATION_START_TICK_NOT_PRESENT,
            Self::UnexpectedMarker { .. } => ErrorCode::REPLICATION_UNEXPECTED_MARKER,
            Self::UnexpectedTransaction { .. } => ErrorCode::REPLICATION_UNEXPECTED_TRANSACTION,
            Self::TransactionTooLarge { .. } => ErrorCode::REPLICATION_TRANSACTION_TOO_LARGE,
            Self::Apply { source, .. } => source.code(),
            Self::InvalidState { .. } => ErrorCode::REPLICATION_INVALID_APPLIER_STATE,
            Self::Running => ErrorCode::REPLICATION_RUNNING,
            Self::InvalidConfiguration(_) => ErrorCode::REPLICATION_INVALID_APPLIER_CONFIGURATION,
            Self::Core(err) => err.code(),
            Self::Persistence(_) | Self::Internal(_) => ErrorCode::INTERNAL,
        }
    }
}
