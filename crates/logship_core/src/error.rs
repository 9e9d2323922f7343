//! Error types for logship core.

use crate::types::{CollectionId, IndexId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Stable numeric error code shared by every crate and carried on the wire.
///
/// Codes raised by the source's authentication layer are passed through the
/// replica unchanged, so the values here are part of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    /// Internal error.
    pub const INTERNAL: Self = Self(4);
    /// Malformed request parameter.
    pub const BAD_PARAMETER: Self = Self(400);
    /// Credentials were rejected.
    pub const UNAUTHORIZED: Self = Self(401);
    /// Unknown resource.
    pub const NOT_FOUND: Self = Self(404);
    /// Concurrent modification.
    pub const CONFLICT: Self = Self(1200);
    /// Document does not exist.
    pub const DOCUMENT_NOT_FOUND: Self = Self(1202);
    /// Collection does not exist.
    pub const COLLECTION_NOT_FOUND: Self = Self(1203);
    /// Collection name already taken.
    pub const DUPLICATE_NAME: Self = Self(1207);
    /// Collection name is not valid.
    pub const ILLEGAL_NAME: Self = Self(1208);
    /// Unique index rejected a document.
    pub const UNIQUE_CONSTRAINT_VIOLATED: Self = Self(1210);
    /// Index does not exist.
    pub const INDEX_NOT_FOUND: Self = Self(1212);
    /// Document body is not acceptable.
    pub const INVALID_DOCUMENT: Self = Self(1227);
    /// Transaction was rolled back.
    pub const TRANSACTION_ABORTED: Self = Self(1650);
    /// Source did not answer.
    pub const REPLICATION_NO_RESPONSE: Self = Self(1400);
    /// Source answered with something unusable.
    pub const REPLICATION_INVALID_RESPONSE: Self = Self(1401);
    /// Source reported an error.
    pub const REPLICATION_MASTER_ERROR: Self = Self(1402);
    /// Log marker arrived out of order.
    pub const REPLICATION_UNEXPECTED_MARKER: Self = Self(1406);
    /// Applier is in the wrong phase for the request.
    pub const REPLICATION_INVALID_APPLIER_STATE: Self = Self(1407);
    /// Transaction entry without a matching begin.
    pub const REPLICATION_UNEXPECTED_TRANSACTION: Self = Self(1408);
    /// Applier configuration is not usable.
    pub const REPLICATION_INVALID_APPLIER_CONFIGURATION: Self = Self(1410);
    /// Applier is running.
    pub const REPLICATION_RUNNING: Self = Self(1411);
    /// Requested start tick has been pruned from the source log.
    pub const REPLICATION_START_TICK_NOT_PRESENT: Self = Self(1414);
    /// Open transactions exceeded the buffering bound.
    pub const REPLICATION_TRANSACTION_TOO_LARGE: Self = Self(1415);

    /// Returns the raw code.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur in logship core operations.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// A tick string is not a canonical decimal number.
    #[error("invalid tick '{value}': {reason}")]
    InvalidTick {
        /// The rejected input.
        value: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Collection not found.
    #[error("collection not found: {name}")]
    CollectionNotFound {
        /// Name or id of the collection.
        name: String,
    },

    /// A collection with this name already exists.
    #[error("duplicate collection name: {name}")]
    DuplicateName {
        /// The conflicting name.
        name: String,
    },

    /// Collection name does not follow the naming rules.
    #[error("illegal collection name: '{name}'")]
    IllegalName {
        /// The rejected name.
        name: String,
    },

    /// Document not found.
    #[error("document not found: {collection}/{key}")]
    DocumentNotFound {
        /// Collection searched.
        collection: String,
        /// Missing key.
        key: String,
    },

    /// A unique index already holds the value.
    #[error("unique constraint violated in {collection} (index {index}) for key '{key}'")]
    UniqueConstraintViolated {
        /// Collection holding the index.
        collection: String,
        /// The index that rejected the write.
        index: IndexId,
        /// The document key that was being written.
        key: String,
    },

    /// Index not found.
    #[error("index {index} not found in {collection}")]
    IndexNotFound {
        /// Collection searched.
        collection: CollectionId,
        /// Missing index.
        index: IndexId,
    },

    /// Document was changed concurrently.
    #[error("conflict on {collection}/{key}: {message}")]
    Conflict {
        /// Collection of the document.
        collection: String,
        /// Key of the document.
        key: String,
        /// Details.
        message: String,
    },

    /// Document body is not acceptable.
    #[error("invalid document: {message}")]
    InvalidDocument {
        /// Description of the problem.
        message: String,
    },

    /// Index definition is not acceptable.
    #[error("invalid index definition: {message}")]
    InvalidIndex {
        /// Description of the problem.
        message: String,
    },

    /// Transaction was aborted.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Reason for abort.
        reason: String,
    },

    /// Operation not valid in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of the problem.
        message: String,
    },
}

impl CoreError {
    /// Creates an invalid tick error.
    pub fn invalid_tick(value: &str, reason: &'static str) -> Self {
        Self::InvalidTick {
            value: value.to_string(),
            reason,
        }
    }

    /// Creates a collection not found error.
    pub fn collection_not_found(name: impl Into<String>) -> Self {
        Self::CollectionNotFound { name: name.into() }
    }

    /// Creates a document not found error.
    pub fn document_not_found(collection: impl Into<String>, key: impl Into<String>) -> Self {
        Self::DocumentNotFound {
            collection: collection.into(),
            key: key.into(),
        }
    }

    /// Creates an invalid document error.
    pub fn invalid_document(message: impl Into<String>) -> Self {
        Self::InvalidDocument {
            message: message.into(),
        }
    }

    /// Creates an invalid index error.
    pub fn invalid_index(message: impl Into<String>) -> Self {
        Self::InvalidIndex {
            message: message.into(),
        }
    }

    /// Creates a transaction aborted error.
    pub fn transaction_aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns the stable error code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidTick { .. } | Self::InvalidOperation { .. } => ErrorCode::BAD_PARAMETER,
            Self::CollectionNotFound { .. } => ErrorCode::COLLECTION_NOT_FOUND,
            Self::DuplicateName { .. } => ErrorCode::DUPLICATE_NAME,
            Self::IllegalName { .. } => ErrorCode::ILLEGAL_NAME,
            Self::DocumentNotFound { .. } => ErrorCode::DOCUMENT_NOT_FOUND,
            Self::UniqueConstraintViolated { .. } => ErrorCode::UNIQUE_CONSTRAINT_VIOLATED,
            Self::IndexNotFound { .. } => ErrorCode::INDEX_NOT_FOUND,
            Self::Conflict { .. } => ErrorCode::CONFLICT,
            Self::InvalidDocument { .. } | Self::InvalidIndex { .. } => {
                ErrorCode::INVALID_DOCUMENT
            }
            Self::TransactionAborted { .. } => ErrorCode::TRANSACTION_ABORTED,
        }
    }
}
