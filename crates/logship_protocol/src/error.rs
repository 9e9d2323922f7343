//! Protocol errors.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding, decoding or validating protocol data.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A message could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// Bytes could not be decoded into a message.
    #[error("decode error: {0}")]
    Decode(String),

    /// The peer speaks a different protocol version.
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Our version.
        expected: u16,
        /// The peer's version.
        actual: u16,
    },

    /// A message decoded fine but violates the protocol.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A configuration value is not recognized.
    #[error("invalid value for {field}: '{value}'")]
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// Rejected value.
        value: String,
    },
}

impl ProtocolError {
    /// Creates a malformed-message error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }
}
