//! Cached render output.

use std::collections::BTreeSet;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use edge_core::{add_secs, span_between};
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::key::CacheKey;
use crate::profile::StalenessProfile;
use crate::tags::FreshnessCap;

/// Freshness of an entry at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
}

/// An immutable cached value.
///
/// Entries are never mutated after creation; a refresh replaces the whole
/// entry. The serialized form is the wire shape exchanged with backends:
/// `{ key, value, tags, createdAt, staleAt, expireAt }` with `value` base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: CacheKey,
    #[serde(with = "base64_bytes")]
    pub value: Bytes,
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub stale_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
    /// Background refresh interval once stale (seconds).
    #[serde(default)]
    pub revalidate_secs: u64,
    /// How long clients may reuse the value without asking again (seconds).
    #[serde(default)]
    pub stale_secs: u64,
}

impl CacheEntry {
    /// Create an entry whose bounds come from a staleness profile.
    pub fn new(
        key: CacheKey,
        value: impl Into<Bytes>,
        tags: impl IntoIterator<Item = String>,
        created_at: DateTime<Utc>,
        profile: &StalenessProfile,
    ) -> Self {
        let mut entry = Self::with_bounds(
            key,
            value,
            tags,
            created_at,
            add_secs(created_at, profile.revalidate),
            add_secs(created_at, profile.expire),
        );
        entry.revalidate_secs = profile.revalidate;
        entry.stale_secs = profile.stale;
        entry
    }

    /// Create an entry with explicit bounds. `stale_at` is clamped to `expire_at`.
    pub fn with_bounds(
        key: CacheKey,
        value: impl Into<Bytes>,
        tags: impl IntoIterator<Item = String>,
        created_at: DateTime<Utc>,
        stale_at: DateTime<Utc>,
        expire_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            value: value.into(),
            tags: tags.into_iter().collect(),
            created_at,
            stale_at: stale_at.min(expire_at),
            expire_at,
            revalidate_secs: span_between(created_at, stale_at.min(expire_at)).as_secs(),
            stale_secs: 0,
        }
    }

    /// Freshness at `now`.
    pub fn freshness(&self, now: DateTime<Utc>) -> Freshness {
        if now >= self.expire_at {
            Freshness::Expired
        } else if now >= self.stale_at {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }

    /// Whether the entry has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.freshness(now) == Freshness::Expired
    }

    /// A copy with bounds tightened by `cap`.
    pub fn capped(&self, cap: FreshnessCap) -> Self {
        let expire_at = self.expire_at.min(cap.expire_at);
        Self {
            stale_at: self.stale_at.min(cap.stale_at).min(expire_at),
            expire_at,
            ..self.clone()
        }
    }

    /// The profile these bounds correspond to.
    pub fn profile(&self) -> StalenessProfile {
        StalenessProfile::new(
            self.stale_secs,
            self.revalidate_secs,
            span_between(self.created_at, self.expire_at).as_secs(),
        )
    }

    /// Age at `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        span_between(self.created_at, now)
    }

    /// Time left before expiry at `now`.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        span_between(now, self.expire_at)
    }

    /// Size of the cached value.
    pub fn size_bytes(&self) -> usize {
        self.value.len()
    }

    /// Encode to the JSON wire shape.
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from the JSON wire shape.
    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Serde adapter encoding `Bytes` as a base64 string.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
