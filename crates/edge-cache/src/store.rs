//! Fail-open cache store.
//!
//! `CacheStore` pairs a backend with the tag index. Backend failures are
//! logged and counted but never surfaced: a failed read is a miss and a
//! failed write leaves the value uncached.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use edge_core::Clock;
use edge_observability::metrics::{self, increment};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::CacheBackend;
use crate::entry::{CacheEntry, Freshness};
use crate::error::StoreResult;
use crate::key::CacheKey;
use crate::lock::{rw_read, rw_write};
use crate::profile::{ProfileRegistry, StalenessProfile};
use crate::tags::TagIndex;

const LOCK_TARGET: &str = "edge_cache::store";

/// Outcome of a store lookup.
#[derive(Debug, Clone)]
pub enum Lookup {
    /// Within its freshness window.
    Fresh(Arc<CacheEntry>),
    /// Past `stale_at` but not expired; may be served while refreshing.
    Stale(Arc<CacheEntry>),
    /// Absent, expired, invalidated, or unreadable.
    Miss,
}

impl Lookup {
    /// The entry, if usable.
    pub fn entry(&self) -> Option<&Arc<CacheEntry>> {
        match self {
            Self::Fresh(entry) | Self::Stale(entry) => Some(entry),
            Self::Miss => None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh(_))
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Miss)
    }
}

/// Receives tag invalidation notifications.
pub trait InvalidationListener: Send + Sync {
    /// Called after `tag` has been invalidated in the index.
    fn on_tag_invalidated(&self, tag: &str);
}

/// Backend plus tag index.
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    index: TagIndex,
    clock: Arc<dyn Clock>,
    profiles: ProfileRegistry,
    listeners: RwLock<Vec<Arc<dyn InvalidationListener>>>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("backend", &self.backend.name())
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl CacheStore {
    /// Create a store with the built-in profiles.
    pub fn new(backend: Arc<dyn CacheBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            index: TagIndex::default(),
            clock,
            profiles: ProfileRegistry::builtin(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Replace the profile registry.
    pub fn with_profiles(mut self, profiles: ProfileRegistry) -> Self {
        self.profiles = profiles;
        self
    }

    /// How long invalidation marks are kept for in-flight computations.
    pub fn with_marker_horizon(mut self, horizon: Duration) -> Self {
        self.index = TagIndex::new(horizon);
        self
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.profiles
    }

    pub fn index(&self) -> &TagIndex {
        &self.index
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Look up an entry and classify its freshness, applying invalidations.
    pub async fn lookup(&self, key: &CacheKey) -> Lookup {
        let entry = match self.backend.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                // Backends may drop expired entries on read.
                self.index.unindex_expired(key, self.clock.now());
                return Lookup::Miss;
            }
            Err(err) => {
                warn!(key = %key, backend = self.backend.name(), error = %err, "Cache read failed, treating as miss");
                increment(metrics::STORE_FAILURE_TOTAL);
                return Lookup::Miss;
            }
        };

        let entry = match self.index.effective_cap(&entry) {
            Some(cap) => Arc::new(entry.capped(cap)),
            None => entry,
        };

        match entry.freshness(self.clock.now()) {
            Freshness::Fresh => Lookup::Fresh(entry),
            Freshness::Stale => Lookup::Stale(entry),
            Freshness::Expired => {
                debug!(key = %key, "Cache entry expired or invalidated");
                Lookup::Miss
            }
        }
    }

    /// Get a usable (fresh or stale) entry.
    pub async fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.lookup(key).await.entry().cloned()
    }

    /// Store an entry and index its tags.
    pub async fn set(&self, entry: CacheEntry) -> StoreResult<()> {
        let entry = Arc::new(entry);
        if let Err(err) = self.backend.set(Arc::clone(&entry)).await {
            warn!(key = %entry.key, backend = self.backend.name(), error = %err, "Cache write failed");
            increment(metrics::STORE_FAILURE_TOTAL);
            return Err(err);
        }
        self.index.index_entry(&entry);
        debug!(key = %entry.key, tags = entry.tags.len(), "Cache entry stored");
        Ok(())
    }

    /// Store a value with explicit bounds, created now.
    pub async fn put(
        &self,
        key: CacheKey,
        value: impl Into<Bytes>,
        tags: impl IntoIterator<Item = String>,
        stale_at: DateTime<Utc>,
        expire_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let entry = CacheEntry::with_bounds(key, value, tags, self.now(), stale_at, expire_at);
        self.set(entry).await
    }

    /// Delete an entry and its index records.
    pub async fn delete(&self, key: &CacheKey) -> StoreResult<()> {
        self.index.unindex(key);
        self.backend.delete(key).await.inspect_err(|err| {
            warn!(key = %key, backend = self.backend.name(), error = %err, "Cache delete failed");
            increment(metrics::STORE_FAILURE_TOTAL);
        })
    }

    /// Expire every entry tagged `tag` immediately.
    pub async fn invalidate_tag(&self, tag: &str) -> usize {
        self.invalidate_tag_with(tag, None).await
    }

    /// Invalidate `tag` using a named profile instead of immediate expiry.
    pub async fn invalidate_tag_profile(&self, tag: &str, profile: &str) -> usize {
        let profile = self.profiles.resolve(profile);
        self.invalidate_tag_with(tag, Some(profile)).await
    }

    /// Invalidate `tag`; `None` expires immediately.
    ///
    /// Visible to every lookup issued after this returns. Returns the number
    /// of indexed keys affected.
    pub async fn invalidate_tag_with(&self, tag: &str, profile: Option<StalenessProfile>) -> usize {
        let effective = profile.unwrap_or(StalenessProfile::EXPIRE_NOW);
        let affected = self.index.invalidate(tag, &effective, self.clock.now());
        increment(metrics::TAG_INVALIDATION_TOTAL);

        if affected == 0 {
            debug!(tag, "Invalidated tag with no cached entries");
        } else {
            info!(tag, affected, "Invalidated cache tag");
        }

        if let Err(err) = self.backend.invalidate_tag(tag, profile.as_ref()).await {
            warn!(tag, backend = self.backend.name(), error = %err, "Backend tag invalidation failed");
            increment(metrics::STORE_FAILURE_TOTAL);
        }

        let listeners = rw_read(&self.listeners, LOCK_TARGET, "notify").clone();
        for listener in listeners {
            listener.on_tag_invalidated(tag);
        }

        affected
    }

    /// Subscribe to tag invalidations.
    pub fn subscribe(&self, listener: Arc<dyn InvalidationListener>) {
        rw_write(&self.listeners, LOCK_TARGET, "subscribe").push(listener);
    }

    /// Reclaim expired and invalidated entries. Returns the number removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed: BTreeSet<CacheKey> = BTreeSet::new();

        match self.backend.purge_expired(now).await {
            Ok(keys) => removed.extend(keys),
            Err(err) => {
                warn!(backend = self.backend.name(), error = %err, "Cache purge failed");
                increment(metrics::STORE_FAILURE_TOTAL);
            }
        }

        for key in self.index.expired_keys(now) {
            if self.backend.delete(&key).await.is_ok() {
                removed.insert(key);
            }
        }

        for key in &removed {
            self.index.unindex_expired(key, now);
        }
        self.index.prune_marks(now);

        if !removed.is_empty() {
            debug!(count = removed.len(), "Swept expired cache entries");
        }
        removed.len()
    }

    /// Run `purge_expired` every `interval` until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.purge_expired().await;
            }
        })
    }
}
