//! Database configuration.

use crate::types::ServerId;

/// Default largest accepted document body (16 MiB of JSON).
pub const DEFAULT_MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Identity reported to replicas.
    pub server_id: ServerId,
    /// Largest accepted document body in bytes of JSON.
    pub max_document_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            server_id: ServerId::generate(),
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
        }
    }
}

impl DatabaseConfig {
    /// Sets the server id.
    #[must_use]
    pub const fn with_server_id(mut self, id: ServerId) -> Self {
        self.server_id = id;
        self
    }

    /// Sets the maximum document size.
    #[must_use]
    pub const fn with_max_document_size(mut self, bytes: usize) -> Self {
        self.max_document_size = bytes;
        self
    }
}
