//! Configuration for the replica side.

use crate::error::{ApplierError, ApplierResult};
use logship_protocol::{FilterConfig, RestrictType};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Default chunk size requested from the source, in bytes.
pub const DEFAULT_CHUNK_SIZE: u64 = 16 * 1024;

/// Default bound on entries buffered across open transactions.
pub const DEFAULT_MAX_OPEN_TRANSACTION_ENTRIES: usize = 1_000_000;

/// Configuration of the initial sync and the applier.
///
/// Serialized in camelCase with durations as fractional seconds. Missing
/// fields take their defaults and unknown fields are ignored, so stored
/// configurations survive upgrades.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApplierConfig {
    /// Address of the source.
    pub endpoint: String,
    /// Replication user.
    pub username: String,
    /// Password of the replication user.
    pub password: String,
    /// Requested chunk size in bytes.
    pub chunk_size: u64,
    /// Whether system collections are replicated.
    pub include_system: bool,
    /// How `restrict_collections` is interpreted.
    pub restrict_type: RestrictType,
    /// Collection names the restriction refers to.
    pub restrict_collections: BTreeSet<String>,
    /// First idle wait after an empty chunk.
    #[serde(with = "seconds")]
    pub idle_min_wait_time: Duration,
    /// Longest idle wait.
    #[serde(with = "seconds")]
    pub idle_max_wait_time: Duration,
    /// Retries of a failed request before the applier gives up.
    pub max_connect_retries: u32,
    /// Base wait between retries.
    #[serde(with = "seconds")]
    pub connection_retry_wait_time: Duration,
    /// Fail when the start tick has already been pruned on the source.
    pub require_from_present: bool,
    /// Bound on entries buffered across open transactions.
    pub max_open_transaction_entries: usize,
}

impl ApplierConfig {
    /// Creates a configuration for `endpoint` with the given credentials.
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    /// Sets the chunk size.
    #[must_use]
    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Sets the collection filter.
    #[must_use]
    pub fn with_filter(mut self, filter: FilterConfig) -> Self {
        self.include_system = filter.include_system;
        self.restrict_type = filter.restrict_type;
        self.restrict_collections = filter.restrict_collections;
        self
    }

    /// Sets the idle wait bounds.
    #[must_use]
    pub fn with_idle_wait(mut self, min: Duration, max: Duration) -> Self {
        self.idle_min_wait_time = min;
        self.idle_max_wait_time = max;
        self
    }

    /// Sets the retry budget for failed requests.
    #[must_use]
    pub fn with_connect_retries(mut self, retries: u32, wait: Duration) -> Self {
        self.max_connect_retries = retries;
        self.connection_retry_wait_time = wait;
        self
    }

    /// Sets whether a pruned start tick is fatal.
    #[must_use]
    pub fn with_require_from_present(mut self, require: bool) -> Self {
        self.require_from_present = require;
        self
    }

    /// Sets the bound on buffered transaction entries.
    #[must_use]
    pub fn with_max_open_transaction_entries(mut self, limit: usize) -> Self {
        self.max_open_transaction_entries = limit;
        self
    }

    /// The collection filter.
    pub fn filter(&self) -> FilterConfig {
        FilterConfig {
            include_system: self.include_system,
            restrict_type: self.restrict_type,
            restrict_collections: self.restrict_collections.clone(),
        }
    }

    /// Retry schedule for failed requests.
    pub fn retry(&self) -> RetryConfig {
        RetryConfig::new(self.max_connect_retries)
            .with_initial_delay(self.connection_retry_wait_time)
            .with_max_delay(self.connection_retry_wait_time.max(self.idle_max_wait_time) * 10)
    }

    /// Idle schedule between empty chunks.
    pub fn idle_backoff(&self) -> IdleBackoff {
        IdleBackoff::new(self.idle_min_wait_time, self.idle_max_wait_time)
    }

    /// Checks that the configuration can be used to connect.
    pub fn validate(&self) -> ApplierResult<()> {
        if self.endpoint.trim().is_empty() {
            return Err(ApplierError::InvalidConfiguration("endpoint is empty".into()));
        }
        if self.chunk_size == 0 {
            return Err(ApplierError::InvalidConfiguration("chunk size is zero".into()));
        }
        if self.restrict_type != RestrictType::None && self.restrict_collections.is_empty() {
            return Err(ApplierError::InvalidConfiguration(format!(
                "restrict type '{}' needs at least one collection",
                self.restrict_type
            )));
        }
        if self.idle_min_wait_time > self.idle_max_wait_time {
            return Err(ApplierError::InvalidConfiguration(
                "idle min wait time exceeds idle max wait time".into(),
            ));
        }
        if self.max_open_transaction_entries == 0 {
            return Err(ApplierError::InvalidConfiguration(
                "max open transaction entries is zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            username: String::new(),
            password: String::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            include_system: true,
            restrict_type: RestrictType::None,
            restrict_collections: BTreeSet::new(),
            idle_min_wait_time: Duration::from_millis(10),
            idle_max_wait_time: Duration::from_millis(500),
            max_connect_retries: 10,
            connection_retry_wait_time: Duration::from_millis(50),
            require_from_present: true,
            max_open_transaction_entries: DEFAULT_MAX_OPEN_TRANSACTION_ENTRIES,
        }
    }
}

impl fmt::Debug for ApplierConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplierConfig")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("chunk_size", &self.chunk_size)
            .field("include_system", &self.include_system)
            .field("restrict_type", &self.restrict_type)
            .field("restrict_collections", &self.restrict_collections)
            .field("idle_min_wait_time", &self.idle_min_wait_time)
            .field("idle_max_wait_time", &self.idle_max_wait_time)
            .field("max_connect_retries", &self.max_connect_retries)
            .field("connection_retry_wait_time", &self.connection_retry_wait_time)
            .field("require_from_present", &self.require_from_present)
            .field("max_open_transaction_entries", &self.max_open_transaction_entries)
            .finish()
    }
}

mod seconds {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        let nanos = (secs * 1e9).round();
        if !nanos.is_finite() || nanos < 0.0 || nanos > u64::MAX as f64 {
            return Err(D::Error::custom(format!("invalid duration: {secs} seconds")));
        }
        // rounded to whole nanoseconds
        Ok(Duration::from_nanos(nanos as u64))
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the delay before retry `attempt` (0 is the first try).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Adaptive wait between empty chunks.
///
/// Each empty chunk doubles the wait, from `min` up to `max`; data resets it.
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl IdleBackoff {
    /// Creates a backoff between `min` and `max`.
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Returns the next wait and doubles the following one.
    pub fn next_wait(&mut self) -> Duration {
        let wait = self.current;
        self.current = (self.current * 2).clamp(self.min, self.max);
        if self.current.is_zero() {
            self.current = self.max;
        }
        wait
    }

    /// Starts over from the minimum.
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
