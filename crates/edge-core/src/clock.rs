//! Time sources for freshness decisions.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// A source of "now" for cache freshness decisions.
///
/// Every component that compares timestamps takes its time from a `Clock`
/// so tests can drive staleness and expiry deterministically.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Create a clock frozen at the current wall-clock time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = saturating_add(*now, by);
    }

    /// Jump to an absolute instant.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Add a duration to an instant, saturating at the latest representable time.
pub fn saturating_add(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    i64::try_from(by.as_secs())
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|secs| secs.checked_add(&TimeDelta::nanoseconds(i64::from(by.subsec_nanos()))))
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Add whole seconds to an instant, saturating at the latest representable time.
pub fn add_secs(at: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    saturating_add(at, Duration::from_secs(secs))
}

/// Non-negative span between two instants (`later - earlier`, zero if reversed).
pub fn span_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> Duration {
    (later - earlier).to_std().unwrap_or(Duration::ZERO)
}
