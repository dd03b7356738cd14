//! Engine wiring.
//!
//! `EngineBuilder` turns an `EngineConfig` into a running engine: one cache
//! store with its tag index, a segment cache subscribed to tag
//! invalidations, and the render orchestrator on top.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use edge_cache::{CacheBackend, CacheStore, InMemoryBackend, RenderArgs};
use edge_core::{Clock, RequestContext, SystemClock};
use edge_observability::init_logging;
use edge_prerender::{Orchestrator, RenderError, RenderResult, RenderUnit};
use edge_segment::{PrefetchKind, RouteKey, SegmentCache};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::EngineConfig;

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    backend: Option<Arc<dyn CacheBackend>>,
    clock: Option<Arc<dyn Clock>>,
    logging: bool,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            backend: None,
            clock: None,
            logging: false,
        }
    }

    /// Start from a config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(EngineConfig::load(path)?))
    }

    /// Use this backend instead of the in-memory default.
    pub fn backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use this clock instead of the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Install the global tracing subscriber from `[logging]` on build.
    pub fn with_logging(mut self) -> Self {
        self.logging = true;
        self
    }

    pub fn build(self) -> Result<Engine> {
        let Self {
            config,
            backend,
            clock,
            logging,
        } = self;

        if logging {
            init_logging(&config.logging).context("Failed to initialize logging")?;
        }
        config.validate().context("Invalid engine config")?;

        let clock: Arc<dyn Clock> = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let backend: Arc<dyn CacheBackend> =
            backend.unwrap_or_else(|| Arc::new(InMemoryBackend::new(Arc::clone(&clock))));
        let backend_name = backend.name();

        let store = Arc::new(
            CacheStore::new(backend, Arc::clone(&clock))
                .with_profiles(config.profile_registry())
                .with_marker_horizon(config.cache.tag_marker_horizon()),
        );
        let segments = Arc::new(SegmentCache::new(config.segments.clone(), clock));
        store.subscribe(segments.clone());

        let orchestrator = Orchestrator::builder(Arc::clone(&store))
            .segments(Arc::clone(&segments))
            .revalidate_on_stale(config.cache.revalidate_on_stale)
            .build();

        let sweeper = match config.cache.sweep_interval() {
            Some(interval) if tokio::runtime::Handle::try_current().is_ok() => {
                Some(store.spawn_sweeper(interval))
            }
            Some(_) => {
                warn!("No async runtime running, expiry sweeper not started");
                None
            }
            None => None,
        };

        info!(
            backend = backend_name,
            default_profile = %config.cache.default_profile,
            sweeper = sweeper.is_some(),
            "Render engine ready"
        );

        Ok(Engine {
            config,
            store,
            segments,
            orchestrator,
            sweeper,
        })
    }
}

/// The incremental render engine.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    store: Arc<CacheStore>,
    segments: Arc<SegmentCache>,
    orchestrator: Orchestrator,
    sweeper: Option<JoinHandle<()>>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn segments(&self) -> &Arc<SegmentCache> {
        &self.segments
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Render a unit for a request.
    pub async fn render(
        &self,
        unit: Arc<dyn RenderUnit>,
        args: RenderArgs,
        request: RequestContext,
    ) -> Result<RenderResult, RenderError> {
        self.orchestrator.render(unit, args, Arc::new(request)).await
    }

    /// Render a route segment through the segment cache.
    pub async fn render_segment(
        &self,
        route: &RouteKey,
        prefetch: PrefetchKind,
        unit: Arc<dyn RenderUnit>,
        args: RenderArgs,
        request: RequestContext,
    ) -> Result<RenderResult, RenderError> {
        self.orchestrator
            .render_segment(route, prefetch, unit, args, Arc::new(request))
            .await
    }

    /// Build and store the static shell of a unit.
    pub async fn prerender(
        &self,
        unit: Arc<dyn RenderUnit>,
        args: RenderArgs,
    ) -> Result<RenderResult, RenderError> {
        self.orchestrator.prerender(unit, args).await
    }

    /// Expire everything tagged `tag`. Returns the number of entries affected.
    pub async fn invalidate_tag(&self, tag: &str) -> usize {
        self.store.invalidate_tag(tag).await
    }

    /// Invalidate `tag` with a named profile's bounds instead of expiring it.
    pub async fn invalidate_tag_profile(&self, tag: &str, profile: &str) -> usize {
        self.store.invalidate_tag_profile(tag, profile).await
    }

    /// Reclaim expired and invalidated entries now.
    pub async fn purge_expired(&self) -> usize {
        self.store.purge_expired().await
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}
