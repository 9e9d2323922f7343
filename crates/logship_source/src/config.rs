//! Source configuration.

use std::time::Duration;

/// Chunk size used when a follow request does not name one.
pub const DEFAULT_CHUNK_SIZE: u64 = 16 * 1024;
/// Smallest chunk size a follow request may ask for.
pub const MIN_CHUNK_SIZE: u64 = 512;
/// Largest chunk size a follow request may ask for.
pub const MAX_CHUNK_SIZE: u64 = 128 * 1024 * 1024;

/// Configuration for a replication source.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Chunk size for follow requests that ask for zero bytes.
    pub default_chunk_size: u64,
    /// Lower clamp for requested chunk sizes.
    pub min_chunk_size: u64,
    /// Upper clamp for requested chunk sizes.
    pub max_chunk_size: u64,
    /// Documents per dump page when the request asks for zero.
    pub dump_batch_size: u64,
    /// How long an unused snapshot is kept.
    pub snapshot_ttl: Duration,
    /// Lifetime of a session token.
    pub token_expiry: Duration,
    /// Whether requests other than login need a token.
    pub require_authentication: bool,
    /// HMAC key for session tokens; random if absent.
    pub auth_secret: Option<Vec<u8>>,
}

impl SourceConfig {
    /// Sets the chunk size limits.
    #[must_use]
    pub fn with_chunk_limits(mut self, min: u64, default: u64, max: u64) -> Self {
        self.min_chunk_size = min;
        self.default_chunk_size = default;
        self.max_chunk_size = max;
        self
    }

    /// Sets the default dump page size.
    #[must_use]
    pub fn with_dump_batch_size(mut self, size: u64) -> Self {
        self.dump_batch_size = size;
        self
    }

    /// Sets the snapshot time-to-live.
    #[must_use]
    pub fn with_snapshot_ttl(mut self, ttl: Duration) -> Self {
        self.snapshot_ttl = ttl;
        self
    }

    /// Sets the session token lifetime.
    #[must_use]
    pub fn with_token_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }

    /// Enables or disables token checks.
    #[must_use]
    pub fn with_authentication(mut self, required: bool) -> Self {
        self.require_authentication = required;
        self
    }

    /// Sets the token signing key.
    #[must_use]
    pub fn with_auth_secret(mut self, secret: Vec<u8>) -> Self {
        self.auth_secret = Some(secret);
        self
    }

    /// Maps a requested chunk size into the configured range.
    #[must_use]
    pub fn clamp_chunk_size(&self, requested: u64) -> u64 {
        if requested == 0 {
            return self.default_chunk_size;
        }
        requested.clamp(self.min_chunk_size, self.max_chunk_size.max(self.min_chunk_size))
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            min_chunk_size: MIN_CHUNK_SIZE,
            max_chunk_size: MAX_CHUNK_SIZE,
            dump_batch_size: 1000,
            snapshot_ttl: Duration::from_secs(600),
            token_expiry: Duration::from_secs(3600),
            require_authentication: true,
            auth_secret: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = SourceConfig::default();
        assert_eq!(config.default_chunk_size, 16384);
        assert!(config.require_authentication);
        assert!(config.auth_secret.is_none());
    }

    #[test]
    fn chunk_sizes_are_clamped() {
        let config = SourceConfig::default();
        assert_eq!(config.clamp_chunk_size(0), DEFAULT_CHUNK_SIZE);
        assert_eq!(config.clamp_chunk_size(1), MIN_CHUNK_SIZE);
        assert_eq!(config.clamp_chunk_size(4096), 4096);
        assert_eq!(config.clamp_chunk_size(u64::MAX), MAX_CHUNK_SIZE);
    }

    #[test]
    fn config_builder() {
        let config = SourceConfig::default()
            .with_chunk_limits(1, 2, 3)
            .with_dump_batch_size(10)
            .with_authentication(false)
            .with_auth_secret(vec![1, 2, 3]);
        assert_eq!(config.clamp_chunk_size(0), 2);
        assert_eq!(config.clamp_chunk_size(9), 3);
        assert_eq!(config.dump_batch_size, 10);
        assert!(!config.require_authentication);
        assert_eq!(config.auth_secret, Some(vec![1, 2, 3]));
    }
}
