//! Render cache for the incremental render engine.
//!
//! This crate provides:
//! - `derive_key` - Deterministic fingerprints over unit identity + arguments
//! - `CacheEntry` - Immutable cached render output and its wire shape
//! - `StalenessProfile` / `ProfileRegistry` - Named freshness profiles
//! - `TagIndex` - Reverse tag index with lazy invalidation
//! - `CacheBackend` - Pluggable storage (`InMemoryBackend`, `EncodedKvBackend`)
//! - `CacheStore` - Fail-open store combining a backend with the tag index
//! - `SingleFlight` - At most one concurrent computation per key
//! - `ResponseBounds` - Effective freshness bounds of a merged response
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use edge_cache::{CacheStore, InMemoryBackend, RenderArgs, UnitId, derive_key, KeyVariant};
//! use edge_core::SystemClock;
//!
//! let clock = Arc::new(SystemClock);
//! let store = CacheStore::new(Arc::new(InMemoryBackend::new(clock.clone())), clock);
//!
//! let key = derive_key(&UnitId::new("product-card"), &RenderArgs::new().with(&42), KeyVariant::Full)?;
//! let hit = store.lookup(&key).await;
//! store.invalidate_tag("product:42").await;
//! ```

mod backend;
mod bounds;
mod config;
mod entry;
mod error;
mod flight;
mod key;
mod lock;
mod profile;
mod status;
mod store;
mod tags;

pub use backend::*;
pub use bounds::*;
pub use config::*;
pub use entry::*;
pub use error::*;
pub use flight::*;
pub use key::*;
pub use profile::*;
pub use status::*;
pub use store::*;
pub use tags::*;
