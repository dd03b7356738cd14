//! Prefetch eligibility.

use serde::{Deserialize, Serialize};

/// How eagerly a segment may be fetched ahead of navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefetchKind {
    /// Fully static; safe to fetch speculatively.
    #[default]
    Static,
    /// Needs a live per-request exchange; prefetched only on opt-in.
    Runtime,
    /// Always fetched on demand.
    Never,
}

impl PrefetchKind {
    /// Whether a segment of this kind may be prefetched.
    pub fn allows_prefetch(self, runtime_opt_in: bool) -> bool {
        match self {
            Self::Static => true,
            Self::Runtime => runtime_opt_in,
            Self::Never => false,
        }
    }
}
