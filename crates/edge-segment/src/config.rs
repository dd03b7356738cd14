//! Segment cache configuration.

use serde::{Deserialize, Serialize};

/// `[segments]` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Total payload bytes kept before evicting least recently used segments.
    pub max_bytes: usize,
    /// Allow prefetching `runtime` segments.
    pub prefetch_runtime: bool,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_bytes: 8 * 1024 * 1024,
            prefetch_runtime: false,
        }
    }
}
