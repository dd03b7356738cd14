//! Reverse tag index with lazy invalidation.
//!
//! Invalidating a tag never touches storage. It records a freshness cap
//! against every key indexed under the tag, and the store applies the cap
//! when it next reads the entry. Each invalidation also leaves a short-lived
//! mark so entries whose computation started before the invalidation, but
//! were indexed after it, are capped as well.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use edge_core::add_secs;
use tracing::debug;

use crate::entry::CacheEntry;
use crate::key::CacheKey;
use crate::lock::{rw_read, rw_write};
use crate::profile::StalenessProfile;

const LOCK_TARGET: &str = "edge_cache::tags";

/// Upper bounds imposed on an entry by invalidations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessCap {
    pub stale_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
}

impl FreshnessCap {
    /// Cap for an invalidation at `at` using `profile`.
    pub fn from_profile(at: DateTime<Utc>, profile: &StalenessProfile) -> Self {
        let expire_at = add_secs(at, profile.expire);
        Self {
            stale_at: add_secs(at, profile.revalidate).min(expire_at),
            expire_at,
        }
    }

    /// Cap that expires at `at`.
    pub fn expired_at(at: DateTime<Utc>) -> Self {
        Self {
            stale_at: at,
            expire_at: at,
        }
    }

    /// The stricter of two caps.
    pub fn tighten(self, other: Self) -> Self {
        Self {
            stale_at: self.stale_at.min(other.stale_at),
            expire_at: self.expire_at.min(other.expire_at),
        }
    }
}

#[derive(Debug)]
struct KeyRecord {
    tags: BTreeSet<String>,
    created_at: DateTime<Utc>,
    expire_at: DateTime<Utc>,
    cap: Option<FreshnessCap>,
}

impl KeyRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let cap_expire = self.cap.map_or(self.expire_at, |cap| cap.expire_at);
        self.expire_at.min(cap_expire) <= now
    }
}

#[derive(Debug, Clone, Copy)]
struct TagMark {
    at: DateTime<Utc>,
    cap: FreshnessCap,
}

#[derive(Debug, Default)]
struct IndexState {
    by_tag: HashMap<String, HashSet<CacheKey>>,
    by_key: HashMap<CacheKey, KeyRecord>,
    marks: HashMap<String, Vec<TagMark>>,
}

impl IndexState {
    fn remove_key_from_tags(&mut self, key: &CacheKey, tags: &BTreeSet<String>) {
        for tag in tags {
            if let Some(keys) = self.by_tag.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
    }

    fn marks_cap<'a>(
        &self,
        tags: impl IntoIterator<Item = &'a String>,
        created_at: DateTime<Utc>,
    ) -> Option<FreshnessCap> {
        tags.into_iter()
            .filter_map(|tag| self.marks.get(tag))
            .flatten()
            .filter(|mark| mark.at >= created_at)
            .map(|mark| mark.cap)
            .reduce(FreshnessCap::tighten)
    }
}

/// Index from tag to the keys cached under it.
#[derive(Debug)]
pub struct TagIndex {
    state: RwLock<IndexState>,
    marker_horizon: Duration,
}

impl TagIndex {
    /// Create an index keeping invalidation marks for `marker_horizon`.
    pub fn new(marker_horizon: Duration) -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            marker_horizon,
        }
    }

    /// Record `key` under each of `tags`, replacing any previous generation.
    ///
    /// The record has no expiry of its own; it leaves the index through
    /// `unindex` or an invalidation cap.
    pub fn index_tags(
        &self,
        key: &CacheKey,
        tags: &BTreeSet<String>,
        created_at: DateTime<Utc>,
    ) {
        self.insert_record(key, tags, created_at, DateTime::<Utc>::MAX_UTC);
    }

    /// Record `entry` under its tags, remembering when it expires.
    pub fn index_entry(&self, entry: &CacheEntry) {
        self.insert_record(&entry.key, &entry.tags, entry.created_at, entry.expire_at);
    }

    /// A generation created earlier than the one already indexed is ignored.
    fn insert_record(
        &self,
        key: &CacheKey,
        tags: &BTreeSet<String>,
        created_at: DateTime<Utc>,
        expire_at: DateTime<Utc>,
    ) {
        let mut state = rw_write(&self.state, LOCK_TARGET, "index_tags");

        if let Some(existing) = state.by_key.get(key) {
            if existing.created_at > created_at {
                debug!(key = %key, "Skipping index of superseded cache generation");
                return;
            }
        }

        if let Some(previous) = state.by_key.remove(key) {
            state.remove_key_from_tags(key, &previous.tags);
        }

        for tag in tags {
            state
                .by_tag
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }

        let cap = state.marks_cap(tags, created_at);
        state.by_key.insert(
            key.clone(),
            KeyRecord {
                tags: tags.clone(),
                created_at,
                expire_at,
                cap,
            },
        );
    }

    /// Drop every trace of `key`.
    pub fn unindex(&self, key: &CacheKey) {
        let mut state = rw_write(&self.state, LOCK_TARGET, "unindex");
        if let Some(record) = state.by_key.remove(key) {
            state.remove_key_from_tags(key, &record.tags);
        }
    }

    /// Drop `key` if its indexed generation has expired at `now`.
    ///
    /// Returns whether a record was removed. A newer, live generation
    /// indexed in the meantime is kept.
    pub fn unindex_expired(&self, key: &CacheKey, now: DateTime<Utc>) -> bool {
        let mut state = rw_write(&self.state, LOCK_TARGET, "unindex_expired");
        if !state.by_key.get(key).is_some_and(|record| record.is_expired(now)) {
            return false;
        }
        if let Some(record) = state.by_key.remove(key) {
            state.remove_key_from_tags(key, &record.tags);
        }
        true
    }

    /// Cap every key under `tag` with `profile` applied at `now`.
    ///
    /// Returns the number of keys affected; zero for an unknown tag.
    /// Keys that become expired leave the tag's key set; their cap is kept
    /// until the entry is deleted or replaced.
    pub fn invalidate(&self, tag: &str, profile: &StalenessProfile, now: DateTime<Utc>) -> usize {
        let cap = FreshnessCap::from_profile(now, profile);
        let mut state = rw_write(&self.state, LOCK_TARGET, "invalidate");

        self.prune_locked(&mut state, now);
        state
            .marks
            .entry(tag.to_string())
            .or_default()
            .push(TagMark { at: now, cap });

        let keys: Vec<CacheKey> = match state.by_tag.get(tag) {
            Some(keys) => keys.iter().cloned().collect(),
            None => return 0,
        };

        let hard_expired = cap.expire_at <= now;
        for key in &keys {
            if let Some(record) = state.by_key.get_mut(key) {
                if record.created_at <= now {
                    record.cap = Some(record.cap.map_or(cap, |existing| existing.tighten(cap)));
                }
                if hard_expired {
                    record.tags.remove(tag);
                }
            }
        }
        if hard_expired {
            state.by_tag.remove(tag);
        }

        keys.len()
    }

    /// Caps that apply to `entry`, if any.
    ///
    /// An entry older than the generation currently indexed for its key is
    /// reported as expired at its creation time.
    pub fn effective_cap(&self, entry: &CacheEntry) -> Option<FreshnessCap> {
        let state = rw_read(&self.state, LOCK_TARGET, "effective_cap");

        let record_cap = match state.by_key.get(&entry.key) {
            Some(record) if record.created_at > entry.created_at => {
                return Some(FreshnessCap::expired_at(entry.created_at));
            }
            Some(record) if record.created_at == entry.created_at => record.cap,
            _ => None,
        };
        let marks_cap = state.marks_cap(&entry.tags, entry.created_at);

        match (record_cap, marks_cap) {
            (Some(a), Some(b)) => Some(a.tighten(b)),
            (a, b) => a.or(b),
        }
    }

    /// Keys whose indexed generation has expired at `now`, by time or by
    /// an invalidation cap.
    pub fn expired_keys(&self, now: DateTime<Utc>) -> Vec<CacheKey> {
        let state = rw_read(&self.state, LOCK_TARGET, "expired_keys");
        state
            .by_key
            .iter()
            .filter(|(_, record)| record.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Drop invalidation marks older than the horizon.
    pub fn prune_marks(&self, now: DateTime<Utc>) {
        let mut state = rw_write(&self.state, LOCK_TARGET, "prune_marks");
        self.prune_locked(&mut state, now);
    }

    fn prune_locked(&self, state: &mut IndexState, now: DateTime<Utc>) {
        let horizon = TimeDelta::from_std(self.marker_horizon).unwrap_or(TimeDelta::MAX);
        let cutoff = now.checked_sub_signed(horizon).unwrap_or(DateTime::<Utc>::MIN_UTC);
        state.marks.retain(|_, marks| {
            marks.retain(|mark| mark.at >= cutoff);
            !marks.is_empty()
        });
    }

    /// Keys currently indexed under `tag`.
    pub fn keys_for_tag(&self, tag: &str) -> Vec<CacheKey> {
        let state = rw_read(&self.state, LOCK_TARGET, "keys_for_tag");
        state
            .by_tag
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Tags currently recorded for `key`.
    pub fn tags_for_key(&self, key: &CacheKey) -> BTreeSet<String> {
        let state = rw_read(&self.state, LOCK_TARGET, "tags_for_key");
        state
            .by_key
            .get(key)
            .map(|record| record.tags.clone())
            .unwrap_or_default()
    }

    /// Number of indexed keys.
    pub fn key_count(&self) -> usize {
        rw_read(&self.state, LOCK_TARGET, "key_count").by_key.len()
    }

    /// Number of tags with at least one key.
    pub fn tag_count(&self) -> usize {
        rw_read(&self.state, LOCK_TARGET, "tag_count").by_tag.len()
    }

    /// Drop everything.
    pub fn clear(&self) {
        *rw_write(&self.state, LOCK_TARGET, "clear") = IndexState::default();
    }
}

impl Default for TagIndex {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}
