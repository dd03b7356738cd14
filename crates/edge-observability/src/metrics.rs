//! Counter names for cache and render outcomes.
//!
//! Counters are emitted through the `metrics` facade; installing a recorder
//! (Prometheus exporter, test recorder) is up to the embedding process.

use std::sync::Once;

use metrics::{counter, describe_counter, Unit};

/// Fresh cache hits.
pub const CACHE_HIT_TOTAL: &str = "edge_cache_hit_total";
/// Stale hits served while revalidating.
pub const CACHE_STALE_TOTAL: &str = "edge_cache_stale_total";
/// Lookups that found nothing usable.
pub const CACHE_MISS_TOTAL: &str = "edge_cache_miss_total";
/// Render unit executions.
pub const RENDER_COMPUTE_TOTAL: &str = "edge_render_compute_total";
/// Callers that waited on another caller's computation.
pub const RENDER_COLLAPSED_TOTAL: &str = "edge_render_collapsed_total";
/// Renders that read per-request input.
pub const RENDER_DYNAMIC_TOTAL: &str = "edge_render_dynamic_total";
/// Shell passes that stopped at a postpone marker.
pub const RENDER_POSTPONED_TOTAL: &str = "edge_render_postponed_total";
/// Backend read/write failures (served fail-open).
pub const STORE_FAILURE_TOTAL: &str = "edge_cache_store_failure_total";
/// Tag invalidations.
pub const TAG_INVALIDATION_TOTAL: &str = "edge_cache_tag_invalidation_total";
/// Background revalidations started.
pub const REVALIDATION_TOTAL: &str = "edge_cache_revalidation_total";
/// Background revalidations that failed.
pub const REVALIDATION_FAILURE_TOTAL: &str = "edge_cache_revalidation_failure_total";
/// Segment cache hits.
pub const SEGMENT_HIT_TOTAL: &str = "edge_segment_hit_total";
/// Segment cache misses.
pub const SEGMENT_MISS_TOTAL: &str = "edge_segment_miss_total";
/// Segment entries evicted for the byte budget.
pub const SEGMENT_EVICT_TOTAL: &str = "edge_segment_evict_total";

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Increment a counter by one.
pub fn increment(name: &'static str) {
    counter!(name).increment(1);
}

/// Register descriptions for every counter. Safe to call repeatedly.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(CACHE_HIT_TOTAL, Unit::Count, "Total number of fresh cache hits.");
        describe_counter!(
            CACHE_STALE_TOTAL,
            Unit::Count,
            "Total number of stale entries served while revalidating."
        );
        describe_counter!(CACHE_MISS_TOTAL, Unit::Count, "Total number of cache misses.");
        describe_counter!(
            RENDER_COMPUTE_TOTAL,
            Unit::Count,
            "Total number of render unit executions."
        );
        describe_counter!(
            RENDER_COLLAPSED_TOTAL,
            Unit::Count,
            "Total number of callers that joined an in-flight computation."
        );
        describe_counter!(
            RENDER_DYNAMIC_TOTAL,
            Unit::Count,
            "Total number of renders that read per-request input."
        );
        describe_counter!(
            RENDER_POSTPONED_TOTAL,
            Unit::Count,
            "Total number of shell passes stopped at a postpone marker."
        );
        describe_counter!(
            STORE_FAILURE_TOTAL,
            Unit::Count,
            "Total number of cache backend failures served fail-open."
        );
        describe_counter!(
            TAG_INVALIDATION_TOTAL,
            Unit::Count,
            "Total number of tag invalidations."
        );
        describe_counter!(
            REVALIDATION_TOTAL,
            Unit::Count,
            "Total number of background revalidations started."
        );
        describe_counter!(
            REVALIDATION_FAILURE_TOTAL,
            Unit::Count,
            "Total number of background revalidations that failed."
        );
        describe_counter!(SEGMENT_HIT_TOTAL, Unit::Count, "Total number of segment cache hits.");
        describe_counter!(
            SEGMENT_MISS_TOTAL,
            Unit::Count,
            "Total number of segment cache misses."
        );
        describe_counter!(
            SEGMENT_EVICT_TOTAL,
            Unit::Count,
            "Total number of segment entries evicted for the byte budget."
        );
    });
}
