//! Named staleness profiles.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Seconds used for "never expires".
pub const FOREVER_SECS: u64 = 0xFFFF_FFFE;

/// Name of the profile used when none is selected.
pub const DEFAULT_PROFILE: &str = "default";

/// Freshness durations, in seconds.
///
/// - `stale`: how long a client may reuse the value without asking again
/// - `revalidate`: after this, the server serves the value stale and refreshes it
/// - `expire`: after this, the value is never served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StalenessProfile {
    pub stale: u64,
    pub revalidate: u64,
    pub expire: u64,
}

impl StalenessProfile {
    /// Expire immediately.
    pub const EXPIRE_NOW: Self = Self::new(0, 0, 0);

    /// Create a profile.
    pub const fn new(stale: u64, revalidate: u64, expire: u64) -> Self {
        Self {
            stale,
            revalidate,
            expire,
        }
    }

    pub fn stale_duration(&self) -> Duration {
        Duration::from_secs(self.stale)
    }

    pub fn revalidate_duration(&self) -> Duration {
        Duration::from_secs(self.revalidate)
    }

    pub fn expire_duration(&self) -> Duration {
        Duration::from_secs(self.expire)
    }

    /// Whether `expire` means "never".
    pub fn never_expires(&self) -> bool {
        self.expire >= FOREVER_SECS
    }

    /// Field-wise minimum of two profiles.
    pub fn tightest(self, other: Self) -> Self {
        Self {
            stale: self.stale.min(other.stale),
            revalidate: self.revalidate.min(other.revalidate),
            expire: self.expire.min(other.expire),
        }
    }
}

impl Default for StalenessProfile {
    fn default() -> Self {
        Self::new(300, 900, FOREVER_SECS)
    }
}

/// Named profiles available to render units and invalidation calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, StalenessProfile>,
    default_name: String,
}

impl ProfileRegistry {
    /// Registry with the built-in profiles.
    pub fn builtin() -> Self {
        let profiles = [
            (DEFAULT_PROFILE, StalenessProfile::default()),
            ("seconds", StalenessProfile::new(30, 1, 60)),
            ("minutes", StalenessProfile::new(300, 60, 3_600)),
            ("hours", StalenessProfile::new(300, 3_600, 86_400)),
            ("days", StalenessProfile::new(300, 86_400, 604_800)),
            ("weeks", StalenessProfile::new(300, 604_800, 2_592_000)),
            ("max", StalenessProfile::new(300, 2_592_000, FOREVER_SECS)),
        ]
        .into_iter()
        .map(|(name, profile)| (name.to_string(), profile))
        .collect();

        Self {
            profiles,
            default_name: DEFAULT_PROFILE.to_string(),
        }
    }

    /// Add or replace a profile.
    pub fn insert(&mut self, name: impl Into<String>, profile: StalenessProfile) {
        self.profiles.insert(name.into(), profile);
    }

    /// Builder form of `insert`.
    pub fn with_profile(mut self, name: impl Into<String>, profile: StalenessProfile) -> Self {
        self.insert(name, profile);
        self
    }

    /// Select which profile applies when none is named.
    ///
    /// An unknown name is ignored with a warning.
    pub fn with_default(mut self, name: &str) -> Self {
        if self.profiles.contains_key(name) {
            self.default_name = name.to_string();
        } else {
            warn!(profile = name, "Unknown default cache profile, keeping '{}'", self.default_name);
        }
        self
    }

    /// Look up a profile by name.
    pub fn get(&self, name: &str) -> Option<StalenessProfile> {
        self.profiles.get(name).copied()
    }

    /// Resolve a name, falling back to the default profile.
    pub fn resolve(&self, name: &str) -> StalenessProfile {
        match self.get(name) {
            Some(profile) => profile,
            None => {
                warn!(profile = name, "Unknown cache profile, using default");
                self.default_profile()
            }
        }
    }

    /// The default profile.
    pub fn default_profile(&self) -> StalenessProfile {
        self.get(&self.default_name).unwrap_or_default()
    }

    /// Name of the default profile.
    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(|name| name.as_str())
    }
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
