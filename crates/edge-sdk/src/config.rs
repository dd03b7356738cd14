//! Engine configuration.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use edge_cache::{CacheConfig, ProfileRegistry, StalenessProfile};
use edge_observability::LoggingConfig;
use edge_segment::SegmentConfig;
use serde::{Deserialize, Serialize};

/// Engine configuration file (`edge.toml` or JSON).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Render cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Named staleness profiles, merged over the built-in set.
    #[serde(default)]
    pub profiles: BTreeMap<String, StalenessProfile>,

    /// Segment cache settings.
    #[serde(default)]
    pub segments: SegmentConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load config from a file. `.json` files are parsed as JSON, anything
    /// else as TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        if is_json(path) {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))
        } else {
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
        }
    }

    /// Save config to a file, in the format implied by its extension.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_json(path) {
            serde_json::to_string_pretty(self)?
        } else {
            toml::to_string_pretty(self)?
        };

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Built-in profiles overlaid with the configured ones.
    pub fn profile_registry(&self) -> ProfileRegistry {
        let mut registry = ProfileRegistry::builtin();
        for (name, profile) in &self.profiles {
            registry.insert(name.clone(), *profile);
        }
        registry.with_default(&self.cache.default_profile)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let registry = self.profile_registry();
        if registry.get(&self.cache.default_profile).is_none() {
            bail!(
                "default profile '{}' is not defined (known: {})",
                self.cache.default_profile,
                registry.names().collect::<Vec<_>>().join(", ")
            );
        }
        if self.segments.max_bytes == 0 {
            bail!("segments.max_bytes must be greater than zero");
        }
        Ok(())
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

/// Generate a default `edge.toml`.
pub fn generate_default_config() -> String {
    r#"# Incremental render cache configuration

[cache]
default_profile = "default"
tag_marker_horizon_secs = 300
sweep_interval_secs = 60
revalidate_on_stale = true

# Custom staleness profiles, in seconds. Built-ins: default, seconds,
# minutes, hours, days, weeks, max.
[profiles.catalog]
stale = 60
revalidate = 600
expire = 86400

[segments]
max_bytes = 8388608
prefetch_runtime = false

[logging]
level = "info"
format = "json"
"#
    .to_string()
}
