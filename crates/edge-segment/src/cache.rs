//! Byte-bounded LRU of rendered route segments.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use edge_cache::{InvalidationListener, ResponseBounds, StalenessProfile};
use edge_core::{add_secs, Clock};
use edge_observability::metrics::{self, increment};
use lru::LruCache;
use tracing::{debug, warn};

use crate::config::SegmentConfig;
use crate::prefetch::PrefetchKind;
use crate::route::RouteKey;

/// A cached rendered segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub route: RouteKey,
    pub payload: Bytes,
    pub prefetch: PrefetchKind,
    /// Server tags covering this segment.
    pub tags: BTreeSet<String>,
    /// Profile the segment's render was cached under.
    pub profile: StalenessProfile,
    pub stored_at: DateTime<Utc>,
    /// After this the segment is refetched.
    pub stale_at: DateTime<Utc>,
    /// Bounds of the server response the segment was rendered from.
    pub bounds: ResponseBounds,
}

impl SegmentDescriptor {
    /// Describe a segment whose client staleness comes from `profile.stale`.
    pub fn new(
        route: RouteKey,
        payload: impl Into<Bytes>,
        prefetch: PrefetchKind,
        tags: impl IntoIterator<Item = String>,
        stored_at: DateTime<Utc>,
        profile: &StalenessProfile,
    ) -> Self {
        Self {
            route,
            payload: payload.into(),
            prefetch,
            tags: tags.into_iter().collect(),
            profile: *profile,
            stored_at,
            stale_at: add_secs(stored_at, profile.stale),
            bounds: ResponseBounds::unbounded(),
        }
    }

    /// Bound the segment by its server response.
    ///
    /// The segment never outlives the response's `expire_at`.
    pub fn with_bounds(mut self, bounds: ResponseBounds) -> Self {
        if let Some(expire_at) = bounds.expire_at {
            self.stale_at = self.stale_at.min(expire_at);
        }
        self.bounds = bounds;
        self
    }

    /// Bounds reported when the segment is served.
    pub fn response_bounds(&self) -> ResponseBounds {
        let mut bounds = self.bounds;
        bounds.stale_at.get_or_insert(self.stale_at);
        bounds
    }

    pub fn size_bytes(&self) -> usize {
        self.payload.len()
    }
}

struct SegmentState {
    entries: LruCache<RouteKey, Arc<SegmentDescriptor>>,
    by_tag: HashMap<String, HashSet<RouteKey>>,
    bytes: usize,
}

impl SegmentState {
    fn remove(&mut self, route: &RouteKey) -> Option<Arc<SegmentDescriptor>> {
        let removed = self.entries.pop(route)?;
        self.forget(&removed);
        Some(removed)
    }

    fn forget(&mut self, segment: &SegmentDescriptor) {
        self.bytes = self.bytes.saturating_sub(segment.size_bytes());
        for tag in &segment.tags {
            if let Some(routes) = self.by_tag.get_mut(tag) {
                routes.remove(&segment.route);
                if routes.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
    }
}

/// Segment cache consulted before any render.
pub struct SegmentCache {
    state: Mutex<SegmentState>,
    config: SegmentConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SegmentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentCache")
            .field("config", &self.config)
            .field("len", &self.len())
            .finish()
    }
}

impl SegmentCache {
    /// Create an empty cache.
    pub fn new(config: SegmentConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(SegmentState {
                entries: LruCache::unbounded(),
                by_tag: HashMap::new(),
                bytes: 0,
            }),
            config,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SegmentState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Recovered from poisoned segment cache lock");
            poisoned.into_inner()
        })
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    /// Get a segment that has not gone stale.
    pub fn get(&self, route: &RouteKey) -> Option<Arc<SegmentDescriptor>> {
        let now = self.clock.now();
        let mut state = self.lock();

        let stale = match state.entries.get(route) {
            Some(segment) if now < segment.stale_at => {
                increment(metrics::SEGMENT_HIT_TOTAL);
                return Some(Arc::clone(segment));
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            state.remove(route);
            debug!(route = %route, "Dropped stale segment");
        }
        increment(metrics::SEGMENT_MISS_TOTAL);
        None
    }

    /// Store a segment, evicting least recently used ones over the byte budget.
    ///
    /// Returns the number of segments evicted. A segment larger than the
    /// whole budget is not stored.
    pub fn insert(&self, segment: SegmentDescriptor) -> usize {
        if segment.size_bytes() > self.config.max_bytes {
            debug!(route = %segment.route, size = segment.size_bytes(), "Segment exceeds byte budget, not cached");
            return 0;
        }

        let segment = Arc::new(segment);
        let mut state = self.lock();
        state.remove(&segment.route);

        state.bytes += segment.size_bytes();
        for tag in &segment.tags {
            state
                .by_tag
                .entry(tag.clone())
                .or_default()
                .insert(segment.route.clone());
        }
        state.entries.put(segment.route.clone(), Arc::clone(&segment));

        let mut evicted = 0;
        while state.bytes > self.config.max_bytes {
            let Some((route, victim)) = state.entries.pop_lru() else {
                break;
            };
            state.forget(&victim);
            evicted += 1;
            increment(metrics::SEGMENT_EVICT_TOTAL);
            debug!(route = %route, "Evicted segment");
        }
        evicted
    }

    /// Drop a segment.
    pub fn remove(&self, route: &RouteKey) -> bool {
        self.lock().remove(route).is_some()
    }

    /// Drop every segment covered by `tag`. Returns how many were dropped.
    pub fn invalidate_tag(&self, tag: &str) -> usize {
        let mut state = self.lock();
        let routes: Vec<RouteKey> = state
            .by_tag
            .get(tag)
            .map(|routes| routes.iter().cloned().collect())
            .unwrap_or_default();
        for route in &routes {
            state.remove(route);
        }
        if !routes.is_empty() {
            debug!(tag, dropped = routes.len(), "Segments dropped for invalidated tag");
        }
        routes.len()
    }

    /// Whether a segment of `kind` may be prefetched.
    pub fn should_prefetch(&self, kind: PrefetchKind) -> bool {
        kind.allows_prefetch(self.config.prefetch_runtime)
    }

    /// Cached routes eligible for prefetch, most recently used first.
    pub fn prefetchable(&self) -> Vec<RouteKey> {
        let now = self.clock.now();
        self.lock()
            .entries
            .iter()
            .filter(|(_, segment)| now < segment.stale_at && self.should_prefetch(segment.prefetch))
            .map(|(route, _)| route.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total payload bytes held.
    pub fn total_bytes(&self) -> usize {
        self.lock().bytes
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.by_tag.clear();
        state.bytes = 0;
    }
}

impl InvalidationListener for SegmentCache {
    fn on_tag_invalidated(&self, tag: &str) {
        self.invalidate_tag(tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_core::ManualClock;
    use std::time::Duration;

    fn cache(max_bytes: usize) -> (SegmentCache, ManualClock) {
        let clock = ManualClock::starting_now();
        let config = SegmentConfig {
            max_bytes,
            prefetch_runtime: false,
        };
        (SegmentCache::new(config, Arc::new(clock.clone())), clock)
    }

    fn segment(path: &str, size: usize, tags: &[&str], clock: &ManualClock) -> SegmentDescriptor {
        SegmentDescriptor::new(
            RouteKey::new(path),
            vec![b'x'; size],
            PrefetchKind::Static,
            tags.iter().map(|t| t.to_string()),
            clock.now(),
            &StalenessProfile::new(30, 60, 600),
        )
    }

    // === Basic operations ===

    #[test]
    fn test_insert_and_get() {
        let (cache, clock) = cache(1024);
        cache.insert(segment("/a", 10, &[], &clock));

        let hit = cache.get(&RouteKey::new("/a")).unwrap();
        assert_eq!(hit.size_bytes(), 10);
        assert!(cache.get(&RouteKey::new("/b")).is_none());
        assert_eq!(cache.total_bytes(), 10);
    }

    #[test]
    fn test_replace_updates_bytes() {
        let (cache, clock) = cache(1024);
        cache.insert(segment("/a", 10, &[], &clock));
        cache.insert(segment("/a", 25, &[], &clock));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 25);
    }

    #[test]
    fn test_expires_by_time() {
        let (cache, clock) = cache(1024);
        cache.insert(segment("/a", 10, &[], &clock));
        clock.advance(Duration::from_secs(30));
        assert!(cache.get(&RouteKey::new("/a")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_server_expiry_caps_segment_lifetime() {
        let (cache, clock) = cache(1024);
        let now = clock.now();
        let bounds = ResponseBounds {
            stale_at: Some(add_secs(now, 5)),
            expire_at: Some(add_secs(now, 10)),
            dynamic: false,
        };
        // Client staleness of 30s outlives the server entry.
        let segment = segment("/a", 10, &[], &clock).with_bounds(bounds);
        assert_eq!(segment.stale_at, add_secs(now, 10));
        assert_eq!(segment.response_bounds(), bounds);
        cache.insert(segment);

        clock.advance(Duration::from_secs(9));
        assert!(cache.get(&RouteKey::new("/a")).is_some());
        clock.advance(Duration::from_secs(1));
        assert!(cache.get(&RouteKey::new("/a")).is_none());
    }

    #[test]
    fn test_unbounded_segment_reports_own_staleness() {
        let (_, clock) = cache(1024);
        let segment = segment("/a", 10, &[], &clock);
        let bounds = segment.response_bounds();
        assert_eq!(bounds.stale_at, Some(add_secs(clock.now(), 30)));
        assert_eq!(bounds.expire_at, None);
    }

    // === Eviction ===

    #[test]
    fn test_lru_eviction_by_bytes() {
        let (cache, clock) = cache(100);
        cache.insert(segment("/a", 40, &[], &clock));
        cache.insert(segment("/b", 40, &[], &clock));
        // Touch /a so /b is least recently used.
        cache.get(&RouteKey::new("/a"));

        let evicted = cache.insert(segment("/c", 40, &[], &clock));
        assert_eq!(evicted, 1);
        assert!(cache.get(&RouteKey::new("/b")).is_none());
        assert!(cache.get(&RouteKey::new("/a")).is_some());
        assert!(cache.get(&RouteKey::new("/c")).is_some());
        assert_eq!(cache.total_bytes(), 80);
    }

    #[test]
    fn test_oversized_segment_not_cached() {
        let (cache, clock) = cache(10);
        assert_eq!(cache.insert(segment("/big", 11, &[], &clock)), 0);
        assert!(cache.is_empty());
    }

    // === Invalidation ===

    #[test]
    fn test_invalidate_tag_drops_segments() {
        let (cache, clock) = cache(1024);
        cache.insert(segment("/p/1", 10, &["product:1", "products"], &clock));
        cache.insert(segment("/p/2", 10, &["product:2", "products"], &clock));
        cache.insert(segment("/about", 10, &["pages"], &clock));

        assert_eq!(cache.invalidate_tag("product:1"), 1);
        assert!(cache.get(&RouteKey::new("/p/1")).is_none());

        cache.on_tag_invalidated("products");
        assert!(cache.get(&RouteKey::new("/p/2")).is_none());
        assert!(cache.get(&RouteKey::new("/about")).is_some());
        assert_eq!(cache.invalidate_tag("unknown"), 0);
    }

    // === Prefetch ===

    #[test]
    fn test_prefetch_respects_opt_in() {
        let clock = ManualClock::starting_now();
        let cache = SegmentCache::new(
            SegmentConfig {
                max_bytes: 1024,
                prefetch_runtime: true,
            },
            Arc::new(clock.clone()),
        );
        assert!(cache.should_prefetch(PrefetchKind::Runtime));
        assert!(!cache.should_prefetch(PrefetchKind::Never));

        let mut never = segment("/never", 1, &[], &clock);
        never.prefetch = PrefetchKind::Never;
        cache.insert(never);
        cache.insert(segment("/static", 1, &[], &clock));
        assert_eq!(cache.prefetchable(), vec![RouteKey::new("/static")]);
    }
}
