//! Observability infrastructure for the incremental render cache.
//!
//! This crate provides:
//! - `init_logging` - Installs the `tracing` subscriber (JSON or compact)
//! - `metrics` - Counter names for cache and render outcomes
//! - `RenderTimer` / `RenderTimings` - Per-render timing

mod logging;
pub mod metrics;
mod timing;

pub use logging::*;
pub use timing::*;
