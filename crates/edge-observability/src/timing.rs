//! Per-render timing.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Timing breakdown for one render call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderTimings {
    /// Total call duration (microseconds).
    pub total_us: u64,
    /// Time spent executing the render unit, if it ran (microseconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_us: Option<u64>,
    /// Time spent in the fill pass over a cached shell (microseconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill_us: Option<u64>,
    /// Time spent waiting on another caller's computation (microseconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_us: Option<u64>,
}

impl RenderTimings {
    /// Whether the render unit executed during this call.
    pub fn computed(&self) -> bool {
        self.compute_us.is_some() || self.fill_us.is_some()
    }
}

/// Collector for render timings.
#[derive(Debug)]
pub struct RenderTimer {
    start: Instant,
    compute: Option<Duration>,
    fill: Option<Duration>,
    wait: Option<Duration>,
}

impl RenderTimer {
    /// Start timing a render call.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
            compute: None,
            fill: None,
            wait: None,
        }
    }

    /// Record time spent executing the unit.
    pub fn record_compute(&mut self, elapsed: Duration) {
        self.compute = Some(self.compute.unwrap_or_default() + elapsed);
    }

    /// Record time spent filling a cached shell.
    pub fn record_fill(&mut self, elapsed: Duration) {
        self.fill = Some(self.fill.unwrap_or_default() + elapsed);
    }

    /// Record time spent waiting on an in-flight computation.
    pub fn record_wait(&mut self, elapsed: Duration) {
        self.wait = Some(self.wait.unwrap_or_default() + elapsed);
    }

    /// Elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Timing record as of now.
    pub fn finish(&self) -> RenderTimings {
        RenderTimings {
            total_us: micros(self.start.elapsed()),
            compute_us: self.compute.map(micros),
            fill_us: self.fill.map(micros),
            wait_us: self.wait.map(micros),
        }
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}
