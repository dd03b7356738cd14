//! Render unit abstraction.

use async_trait::async_trait;
use edge_cache::{RenderArgs, UnitId};

use crate::scope::RenderScope;

/// How a scope reacts to dynamic access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderMode {
    /// Static artifact generation: the first dynamic access stops the
    /// render and leaves a postpone marker.
    ShellOnly,
    /// Per-request rendering: dynamic access is recorded and allowed.
    Full,
}

/// A cacheable render function.
///
/// Implementations write output, tags and cache life through the scope and
/// reach per-request input only through the scope's dynamic accessors.
#[async_trait]
pub trait RenderUnit: Send + Sync {
    /// Stable identity used in the cache key.
    fn id(&self) -> UnitId;

    /// Render into `scope`.
    async fn render(&self, scope: &mut RenderScope, args: &RenderArgs) -> anyhow::Result<()>;
}
