//! Render results.

use std::collections::BTreeSet;

use bytes::Bytes;
use edge_cache::{CacheStatus, ResponseBounds, StalenessProfile};
use edge_observability::RenderTimings;

use crate::shell::PostponeMarker;

/// Output of a render call.
#[derive(Debug, Clone)]
pub struct RenderResult {
    /// Rendered bytes. For a shell pass: the shell with its hole empty.
    pub value: Bytes,
    pub status: CacheStatus,
    /// Effective freshness bounds, for cache-control derivation.
    pub bounds: ResponseBounds,
    /// Tags of every cache entry the output incorporates.
    pub tags: BTreeSet<String>,
    /// Set when the output is a shell, or was merged into one.
    pub postponed: Option<PostponeMarker>,
    /// Staleness profile the output was cached under.
    pub profile: StalenessProfile,
    pub timings: RenderTimings,
}

impl RenderResult {
    /// Output as UTF-8 text, if it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }

    /// Whether the output depends on per-request input.
    pub fn is_dynamic(&self) -> bool {
        self.bounds.dynamic
    }
}
