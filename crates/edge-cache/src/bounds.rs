//! Effective freshness bounds of a rendered response.

use std::time::Duration;

use chrono::{DateTime, Utc};
use edge_core::span_between;
use serde::{Deserialize, Serialize};

use crate::entry::CacheEntry;

/// Minimum freshness bounds across every cache entry a response incorporated.
///
/// The transport layer turns these into cache-control headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseBounds {
    /// Earliest instant the response becomes stale. `None` means unbounded.
    pub stale_at: Option<DateTime<Utc>>,
    /// Earliest instant the response expires. `None` means unbounded.
    pub expire_at: Option<DateTime<Utc>>,
    /// Whether any part was computed from per-request input.
    pub dynamic: bool,
}

impl ResponseBounds {
    /// Bounds with no limits.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Bounds of a single entry.
    pub fn from_entry(entry: &CacheEntry) -> Self {
        let mut bounds = Self::unbounded();
        bounds.incorporate_entry(entry);
        bounds
    }

    /// Tighten with explicit instants.
    pub fn incorporate(&mut self, stale_at: DateTime<Utc>, expire_at: DateTime<Utc>) {
        self.stale_at = Some(self.stale_at.map_or(stale_at, |current| current.min(stale_at)));
        self.expire_at = Some(self.expire_at.map_or(expire_at, |current| current.min(expire_at)));
    }

    /// Tighten with an entry's bounds.
    pub fn incorporate_entry(&mut self, entry: &CacheEntry) {
        self.incorporate(entry.stale_at, entry.expire_at);
    }

    /// Combine with another response's bounds.
    pub fn merge(&mut self, other: &ResponseBounds) {
        if let Some(stale_at) = other.stale_at {
            self.stale_at = Some(self.stale_at.map_or(stale_at, |current| current.min(stale_at)));
        }
        if let Some(expire_at) = other.expire_at {
            self.expire_at = Some(self.expire_at.map_or(expire_at, |current| current.min(expire_at)));
        }
        self.dynamic |= other.dynamic;
    }

    /// Mark the response as per-request.
    pub fn mark_dynamic(&mut self) {
        self.dynamic = true;
    }

    /// Whether a shared cache may store the response.
    pub fn is_cacheable(&self) -> bool {
        !self.dynamic
    }

    /// How long the response stays fresh from `now`.
    ///
    /// Zero for dynamic responses; `None` when unbounded.
    pub fn max_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.dynamic {
            return Some(Duration::ZERO);
        }
        self.stale_at.map(|stale_at| span_between(now, stale_at))
    }

    /// How long the response may be served stale after it stops being fresh.
    pub fn stale_window(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.dynamic {
            return Some(Duration::ZERO);
        }
        let expire_at = self.expire_at?;
        let from = self.stale_at.map_or(now, |stale_at| stale_at.max(now));
        Some(span_between(from, expire_at))
    }
}
