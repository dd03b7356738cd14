//! Pluggable cache storage.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use edge_core::Clock;
use tracing::debug;

use crate::entry::CacheEntry;
use crate::error::{StoreError, StoreResult};
use crate::key::CacheKey;
use crate::profile::StalenessProfile;

/// Storage backend contract.
///
/// Implementations must make `set` an atomic replace and must never return
/// an entry whose `expire_at` has passed.
#[async_trait]
pub trait CacheBackend: Send + Sync + fmt::Debug {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Get a live entry.
    async fn get(&self, key: &CacheKey) -> StoreResult<Option<Arc<CacheEntry>>>;

    /// Store an entry, replacing any previous one under the same key.
    async fn set(&self, entry: Arc<CacheEntry>) -> StoreResult<()>;

    /// Delete an entry.
    async fn delete(&self, key: &CacheKey) -> StoreResult<()>;

    /// Notification that a tag was invalidated.
    ///
    /// Tag state lives in the store's index, so local backends ignore this.
    /// Shared backends can forward it to peers.
    async fn invalidate_tag(&self, _tag: &str, _profile: Option<&StalenessProfile>) -> StoreResult<()> {
        Ok(())
    }

    /// Reclaim expired entries, returning the removed keys.
    async fn purge_expired(&self, _now: DateTime<Utc>) -> StoreResult<Vec<CacheKey>> {
        Ok(Vec::new())
    }
}

/// In-memory backend holding shared immutable entries.
#[derive(Debug)]
pub struct InMemoryBackend {
    entries: DashMap<CacheKey, Arc<CacheEntry>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryBackend {
    /// Create an empty backend.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of stored entries, including expired ones not yet reclaimed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the backend is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &CacheKey) -> StoreResult<Option<Arc<CacheEntry>>> {
        let now = self.clock.now();
        let entry = self.entries.get(key).map(|entry| Arc::clone(entry.value()));
        match entry {
            Some(entry) if entry.is_expired(now) => {
                self.entries
                    .remove_if(key, |_, stored| Arc::ptr_eq(stored, &entry));
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn set(&self, entry: Arc<CacheEntry>) -> StoreResult<()> {
        self.entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> StoreResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<CacheKey>> {
        let mut removed = Vec::new();
        self.entries.retain(|key, entry| {
            let keep = !entry.is_expired(now);
            if !keep {
                removed.push(key.clone());
            }
            keep
        });
        if !removed.is_empty() {
            debug!(count = removed.len(), backend = "memory", "Purged expired cache entries");
        }
        Ok(removed)
    }
}

/// Backend that stores each entry in its serialized wire shape.
///
/// Stands in for remote key/value stores: every read decodes and every
/// write encodes.
#[derive(Debug)]
pub struct EncodedKvBackend {
    entries: DashMap<CacheKey, Bytes>,
    clock: Arc<dyn Clock>,
}

impl EncodedKvBackend {
    /// Create an empty backend.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Raw stored bytes for a key.
    pub fn raw(&self, key: &CacheKey) -> Option<Bytes> {
        self.entries.get(key).map(|bytes| bytes.value().clone())
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the backend is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheBackend for EncodedKvBackend {
    fn name(&self) -> &'static str {
        "encoded-kv"
    }

    async fn get(&self, key: &CacheKey) -> StoreResult<Option<Arc<CacheEntry>>> {
        let Some(raw) = self.raw(key) else {
            return Ok(None);
        };
        let entry = CacheEntry::decode(&raw)?;
        if entry.key != *key {
            return Err(StoreError::Storage(format!(
                "stored entry key '{}' does not match '{}'",
                entry.key, key
            )));
        }
        if entry.is_expired(self.clock.now()) {
            return Ok(None);
        }
        Ok(Some(Arc::new(entry)))
    }

    async fn set(&self, entry: Arc<CacheEntry>) -> StoreResult<()> {
        let encoded = entry.encode()?;
        self.entries.insert(entry.key.clone(), Bytes::from(encoded));
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> StoreResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<CacheKey>> {
        let mut removed = Vec::new();
        self.entries.retain(|key, raw| match CacheEntry::decode(raw) {
            Ok(entry) if !entry.is_expired(now) => true,
            _ => {
                removed.push(key.clone());
                false
            }
        });
        Ok(removed)
    }
}
