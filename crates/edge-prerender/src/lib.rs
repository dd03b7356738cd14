//! Partial prerendering for the incremental render cache.
//!
//! This crate provides:
//! - `RenderScope` - Per-invocation dynamic boundary tracker and output buffer
//! - `RenderUnit` - Trait implemented by cacheable render functions
//! - `ShellPayload` - Static shell with its postpone marker, and the merge
//! - `Orchestrator` - Cache lookup, single-flight compute, shell/fill passes
//! - `RenderResult` - Output plus status, tags and freshness bounds
//!
//! # Example
//!
//! ```ignore
//! use edge_prerender::{RenderScope, RenderUnit};
//!
//! struct Greeting;
//!
//! #[async_trait::async_trait]
//! impl RenderUnit for Greeting {
//!     fn id(&self) -> UnitId {
//!         UnitId::new("greeting")
//!     }
//!
//!     async fn render(&self, scope: &mut RenderScope, args: &RenderArgs) -> anyhow::Result<()> {
//!         scope.tag("greetings");
//!         scope.write("<h1>Hello</h1>");
//!         if let Some(name) = scope.cookie("name").granted().flatten() {
//!             scope.write(format!("<p>Welcome back, {name}</p>"));
//!         }
//!         Ok(())
//!     }
//! }
//! ```

mod error;
mod orchestrator;
mod result;
mod scope;
mod shell;
mod unit;

pub use error::*;
pub use orchestrator::*;
pub use result::*;
pub use scope::*;
pub use shell::*;
pub use unit::*;
