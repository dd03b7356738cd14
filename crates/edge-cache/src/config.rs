//! Cache configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::profile::DEFAULT_PROFILE;

/// `[cache]` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Profile applied when a render unit selects none.
    pub default_profile: String,
    /// How long invalidation marks are kept for in-flight computations.
    pub tag_marker_horizon_secs: u64,
    /// Interval between expiry sweeps; 0 disables the sweeper.
    pub sweep_interval_secs: u64,
    /// Serve stale entries while refreshing them in the background.
    /// When off, stale entries are recomputed in the foreground.
    pub revalidate_on_stale: bool,
}

impl CacheConfig {
    pub fn tag_marker_horizon(&self) -> Duration {
        Duration::from_secs(self.tag_marker_horizon_secs)
    }

    /// Sweep interval, if sweeping is enabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_profile: DEFAULT_PROFILE.to_string(),
            tag_marker_horizon_secs: 300,
            sweep_interval_secs: 60,
            revalidate_on_stale: true,
        }
    }
}
