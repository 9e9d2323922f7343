//! Log positions.
//!
//! A [`Tick`] is an unbounded non-negative integer carried as a decimal
//! string without leading zeros. Ticks are compared by digit count first and
//! lexicographically second, which is numeric order for canonical decimal
//! strings and never overflows no matter how long a source has been running.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A position in a replication log.
///
/// The absent tick is represented by [`Tick::zero`].
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tick(String);

impl Tick {
    /// The tick that precedes every log entry.
    #[must_use]
    pub fn zero() -> Self {
        Self("0".to_string())
    }

    /// Parses a canonical decimal tick.
    ///
    /// Rejects empty strings, non-digit characters and leading zeros.
    pub fn parse(value: &str) -> CoreResult<Self> {
        if value.is_empty() {
            return Err(CoreError::invalid_tick(value, "empty"));
        }
        if !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CoreError::invalid_tick(value, "non-digit character"));
        }
        if value.len() > 1 && value.starts_with('0') {
            return Err(CoreError::invalid_tick(value, "leading zero"));
        }
        Ok(Self(value.to_string()))
    }

    /// Returns the decimal representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for the zero tick.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == "0"
    }

    /// Returns the tick as a `u64` when it fits.
    #[must_use]
    pub fn to_u64(&self) -> Option<u64> {
        self.0.parse().ok()
    }

    /// Returns the larger of two ticks.
    #[must_use]
    pub fn max_of(self, other: Self) -> Self {
        if other > self {
            other
        } else {
            self
        }
    }
}

/// Compares two optional tick strings.
///
/// An absent tick compares as `"0"` on either side. The strings are expected
/// to be canonical decimal numbers; the ordering is total over any strings.
#[must_use]
pub fn compare_ticks(a: Option<&str>, b: Option<&str>) -> Ordering {
    compare_digits(a.unwrap_or("0"), b.unwrap_or("0"))
}

fn compare_digits(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

impl Ord for Tick {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_digits(&self.0, &other.0)
    }
}

impl PartialOrd for Tick {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Default for Tick {
    fn default() -> Self {
        Self::zero()
    }
}

impl From<u64> for Tick {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl FromStr for Tick {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Tick {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Tick> for String {
    fn from(tick: Tick) -> Self {
        tick.0
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tick({})", self.0)
    }
}
