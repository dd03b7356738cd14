//! Cache status reported with every render result.

use serde::{Deserialize, Serialize};

/// How a render result was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    /// Fresh cache hit.
    Hit,
    /// Stale hit (serving while revalidating).
    Stale,
    /// Cache miss, computed and cached.
    Miss,
    /// Computed per request; read dynamic input, not cached.
    Dynamic,
    /// Cached shell merged with a per-request remainder.
    Partial,
    /// Computed but could not be written to the store.
    Bypass,
}

impl CacheStatus {
    /// Whether the value came out of the cache without executing the unit.
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit | Self::Stale)
    }
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hit => write!(f, "HIT"),
            Self::Stale => write!(f, "STALE"),
            Self::Miss => write!(f, "MISS"),
            Self::Dynamic => write!(f, "DYNAMIC"),
            Self::Partial => write!(f, "PARTIAL"),
            Self::Bypass => write!(f, "BYPASS"),
        }
    }
}
