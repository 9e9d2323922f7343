//! Observable applier state.

use crate::error::ApplierError;
use logship_core::{ErrorCode, ServerId, Tick};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Lifecycle phase of the applier.
///
/// ```text
///            start()                 fatal error
///  Stopped ──────────▶ Running ──────────────────▶ Errored
///     ▲                   │                           │
///     └───── stop() ──────┴────────── stop() ─────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplierPhase {
    /// Not running.
    #[default]
    Stopped,
    /// Fetching and applying log entries.
    Running,
    /// Stopped by a fatal error; see [`ApplierState::last_error`].
    Errored,
}

impl ApplierPhase {
    /// Phase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Errored => "errored",
        }
    }
}

impl fmt::Display for ApplierPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error that stopped the applier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    /// Stable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// When it happened.
    pub time: SystemTime,
}

impl From<&ApplierError> for LastError {
    fn from(err: &ApplierError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            time: SystemTime::now(),
        }
    }
}

/// What the applier did last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// Description.
    pub message: String,
    /// When it was recorded.
    pub time: SystemTime,
}

/// Snapshot of the applier's state.
///
/// The three ticks are published together, so a reader always sees
/// `last_applied_tick <= last_processed_tick <= last_available_tick`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplierState {
    /// Lifecycle phase.
    pub phase: ApplierPhase,
    /// Tick of the last entry received and handled.
    pub last_processed_tick: Tick,
    /// Tick up to which the replica holds every in-scope effect.
    pub last_applied_tick: Tick,
    /// Highest tick the source reported.
    pub last_available_tick: Tick,
    /// The error that stopped the applier, if any.
    pub last_error: Option<LastError>,
    /// Last progress message.
    pub progress: Option<Progress>,
    /// Requests sent to the source.
    pub total_requests: u64,
    /// Requests that failed with a transient error.
    pub total_failed_connects: u64,
    /// Log entries received.
    pub total_events: u64,
    /// Log entries skipped by the collection filter.
    pub skipped_events: u64,
    /// Identity of the source.
    pub server_id: Option<ServerId>,
    /// Transactions begun on the source and not yet ended.
    pub open_transactions: usize,
}

impl Default for ApplierState {
    fn default() -> Self {
        Self {
            phase: ApplierPhase::Stopped,
            last_processed_tick: Tick::zero(),
            last_applied_tick: Tick::zero(),
            last_available_tick: Tick::zero(),
            last_error: None,
            progress: None,
            total_requests: 0,
            total_failed_connects: 0,
            total_events: 0,
            skipped_events: 0,
            server_id: None,
            open_transactions: 0,
        }
    }
}

impl ApplierState {
    /// Returns true while the applier runs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.phase == ApplierPhase::Running
    }

    /// Returns true if a fatal error stopped the applier.
    #[must_use]
    pub fn is_errored(&self) -> bool {
        self.phase == ApplierPhase::Errored
    }

    /// Code of the last error, if any.
    #[must_use]
    pub fn last_error_code(&self) -> Option<ErrorCode> {
        self.last_error.as_ref().map(|e| e.code)
    }

    /// Records a progress message.
    pub fn set_progress(&mut self, message: impl Into<String>) {
        self.progress = Some(Progress {
            message: message.into(),
            time: SystemTime::now(),
        });
    }

    /// Moves all three ticks to `tick`.
    pub fn reset_ticks(&mut self, tick: &Tick) {
        self.last_processed_tick = tick.clone();
        self.last_applied_tick = tick.clone();
        self.last_available_tick = tick.clone();
    }

    /// Publishes the outcome of one chunk.
    ///
    /// `available` is raised to at least `processed` so the ordering holds
    /// even when the source reports a tick below the replica's cursor.
    pub fn advance(&mut self, processed: Tick, applied: Tick, available: Tick) {
        let applied = applied.max_of(self.last_applied_tick.clone());
        let processed = processed.max_of(applied.clone());
        self.last_available_tick = available.max_of(processed.clone());
        self.last_processed_tick = processed;
        self.last_applied_tick = applied;
    }
}
