//! Public SDK for the incremental render cache.
//!
//! This crate re-exports the engine and wires it together from config:
//!
//! ```ignore
//! use edge_sdk::prelude::*;
//!
//! struct ProductCard;
//!
//! #[async_trait]
//! impl RenderUnit for ProductCard {
//!     fn id(&self) -> UnitId {
//!         UnitId::new("product-card")
//!     }
//!
//!     async fn render(&self, scope: &mut RenderScope, args: &RenderArgs) -> anyhow::Result<()> {
//!         let id: u64 = args.get(0).context("missing product id")?;
//!         scope.tag(format!("product:{id}"));
//!         scope.cache_life("hours");
//!         scope.write(format!("<div class=\"card\">{id}</div>"));
//!         Ok(())
//!     }
//! }
//!
//! let engine = EngineBuilder::from_file("edge.toml")?.with_logging().build()?;
//! let result = engine
//!     .render(Arc::new(ProductCard), RenderArgs::new().with(&42), RequestContext::new("/p/42"))
//!     .await?;
//! engine.invalidate_tag("product:42").await;
//! ```

mod config;
mod engine;

pub use config::*;
pub use engine::*;

pub use edge_cache;
pub use edge_core;
pub use edge_observability;
pub use edge_prerender;
pub use edge_segment;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{Engine, EngineBuilder, EngineConfig};
    pub use async_trait::async_trait;
    pub use edge_cache::*;
    pub use edge_core::*;
    pub use edge_observability::{init_logging, LogFormat, LogLevel, LoggingConfig, RenderTimings};
    pub use edge_prerender::*;
    pub use edge_segment::*;
}
