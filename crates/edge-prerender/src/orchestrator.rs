//! Render orchestration.
//!
//! The orchestrator resolves a render unit invocation against the cache:
//! a fresh entry is served as is, a stale entry is served while one
//! background refresh runs, and a miss is computed once no matter how many
//! callers ask for the same key at the same time.
//!
//! Units that read per-request input are never cached whole. A shell pass
//! (`prerender`) stores their static prefix; later requests run a fill pass
//! and splice its per-request remainder into the cached shell.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use edge_cache::{
    derive_key, CacheEntry, CacheKey, CacheStatus, CacheStore, FlightRole, FreshnessCap, KeyVariant,
    Lookup, RenderArgs, ResponseBounds, SingleFlight, StalenessProfile, UnitId,
};
use edge_core::RequestContext;
use edge_observability::metrics::{self, increment};
use edge_observability::RenderTimer;
use edge_segment::{PrefetchKind, RouteKey, SegmentCache, SegmentDescriptor};
use tracing::{debug, info_span, warn, Instrument};

use crate::error::RenderError;
use crate::result::RenderResult;
use crate::scope::{RenderScope, Rendered};
use crate::shell::ShellPayload;
use crate::unit::{RenderMode, RenderUnit};

/// One completed computation, shared by every caller that waited on it.
struct Computed {
    rendered: Rendered,
    /// The entry written for this output, if it was cacheable.
    entry: Option<Arc<CacheEntry>>,
    stored: bool,
    compute: Duration,
}

type Flights = SingleFlight<Arc<Computed>, RenderError>;

struct Inner {
    store: Arc<CacheStore>,
    segments: Option<Arc<SegmentCache>>,
    flights: Flights,
    revalidate_on_stale: bool,
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    store: Arc<CacheStore>,
    segments: Option<Arc<SegmentCache>>,
    revalidate_on_stale: bool,
}

impl OrchestratorBuilder {
    /// Consult and fill this segment cache in `render_segment`.
    pub fn segments(mut self, segments: Arc<SegmentCache>) -> Self {
        self.segments = Some(segments);
        self
    }

    /// Serve stale entries while refreshing in the background (default).
    /// When disabled, stale entries are recomputed before responding.
    pub fn revalidate_on_stale(mut self, enabled: bool) -> Self {
        self.revalidate_on_stale = enabled;
        self
    }

    pub fn build(self) -> Orchestrator {
        Orchestrator {
            inner: Arc::new(Inner {
                store: self.store,
                segments: self.segments,
                flights: SingleFlight::new(),
                revalidate_on_stale: self.revalidate_on_stale,
            }),
        }
    }
}

/// Entry point for rendering units through the cache.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("store", &self.inner.store)
            .field("in_flight", &self.inner.flights.len())
            .field("revalidate_on_stale", &self.inner.revalidate_on_stale)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self::builder(store).build()
    }

    pub fn builder(store: Arc<CacheStore>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            store,
            segments: None,
            revalidate_on_stale: true,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }

    pub fn segments(&self) -> Option<&Arc<SegmentCache>> {
        self.inner.segments.as_ref()
    }

    /// Number of computations currently running, foreground or background.
    pub fn in_flight(&self) -> usize {
        self.inner.flights.len()
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.store.now()
    }

    // === Public render operations ===

    /// Render a unit for a request.
    pub async fn render(
        &self,
        unit: Arc<dyn RenderUnit>,
        args: RenderArgs,
        request: Arc<RequestContext>,
    ) -> Result<RenderResult, RenderError> {
        let span = info_span!("render", unit = %unit.id(), path = %request.path);
        async move {
            let result = self.resolve(unit, args, request, Vec::new()).await?;
            debug!(status = %result.status, bytes = result.value.len(), "Render complete");
            Ok(result)
        }
        .instrument(span)
        .await
    }

    /// Produce and store the static shell of a unit.
    ///
    /// Runs the unit in shell-only mode without a request. A unit that never
    /// touches per-request input is stored whole under its full key;
    /// otherwise the prefix and tail are stored as a shell for later fills.
    pub async fn prerender(
        &self,
        unit: Arc<dyn RenderUnit>,
        args: RenderArgs,
    ) -> Result<RenderResult, RenderError> {
        let id = unit.id();
        let span = info_span!("prerender", unit = %id);
        async move {
            let mut timer = RenderTimer::start();
            let key = derive_key(&id, &args, KeyVariant::Full)?;
            let shell_key = derive_key(&id, &args, KeyVariant::Shell)?;

            let this = self.clone();
            let flight_key = shell_key.clone();
            let (outcome, role) = self
                .inner
                .flights
                .run(&shell_key, move || {
                    spawn_compute(id, async move {
                        this.compute_shell(unit, args, key, flight_key).await
                    })
                })
                .await;
            let computed = outcome?;
            record_role(&mut timer, role, computed.compute);

            let rendered = &computed.rendered;
            let mut bounds = match &computed.entry {
                Some(entry) if rendered.marker.is_none() => ResponseBounds::from_entry(entry),
                _ => rendered.bounds,
            };
            if rendered.marker.is_some() {
                bounds.mark_dynamic();
            }
            let status = if computed.stored {
                CacheStatus::Miss
            } else {
                CacheStatus::Bypass
            };

            debug!(
                status = %status,
                postponed = rendered.marker.is_some(),
                "Prerender complete"
            );
            Ok(RenderResult {
                value: Bytes::from(rendered.output()),
                status,
                bounds,
                tags: rendered.tags.clone(),
                postponed: rendered.marker.clone(),
                profile: self.profile_of(rendered),
                timings: timer.finish(),
            })
        }
        .instrument(span)
        .await
    }

    /// Render a route segment, consulting the segment cache first.
    ///
    /// Static results are kept in the segment cache until their profile's
    /// client staleness elapses or one of their tags is invalidated.
    pub async fn render_segment(
        &self,
        route: &RouteKey,
        prefetch: PrefetchKind,
        unit: Arc<dyn RenderUnit>,
        args: RenderArgs,
        request: Arc<RequestContext>,
    ) -> Result<RenderResult, RenderError> {
        let Some(segments) = self.inner.segments.clone() else {
            return self.render(unit, args, request).await;
        };

        let timer = RenderTimer::start();
        if let Some(segment) = segments.get(route) {
            debug!(route = %route, "Segment cache hit");
            return Ok(RenderResult {
                value: segment.payload.clone(),
                status: CacheStatus::Hit,
                bounds: segment.response_bounds(),
                tags: segment.tags.clone(),
                postponed: None,
                profile: segment.profile,
                timings: timer.finish(),
            });
        }

        let result = self.render(unit, args, request).await?;
        if matches!(result.status, CacheStatus::Hit | CacheStatus::Miss) && !result.is_dynamic() {
            segments.insert(
                SegmentDescriptor::new(
                    route.clone(),
                    result.value.clone(),
                    prefetch,
                    result.tags.iter().cloned(),
                    self.now(),
                    &result.profile,
                )
                .with_bounds(result.bounds),
            );
        }
        Ok(result)
    }

    // === Nested includes ===

    pub(crate) async fn include_full(
        &self,
        unit: Arc<dyn RenderUnit>,
        args: RenderArgs,
        request: Arc<RequestContext>,
        stack: Vec<UnitId>,
    ) -> Result<Rendered, RenderError> {
        let result = self.resolve(unit, args, request, stack).await?;
        let dynamic = result.is_dynamic();
        Ok(Rendered {
            body: result.value.to_vec(),
            tail: Vec::new(),
            tags: result.tags,
            profile: (!dynamic).then_some(result.profile),
            bounds: result.bounds,
            marker: None,
            dynamic,
        })
    }

    /// Include a child during a shell pass.
    ///
    /// A cached full entry is reused. Otherwise the child runs in shell-only
    /// mode; when it finishes without a marker its output is cached whole.
    pub(crate) async fn include_shell(
        &self,
        unit: Arc<dyn RenderUnit>,
        args: RenderArgs,
        stack: Vec<UnitId>,
    ) -> Result<Rendered, RenderError> {
        let key = derive_key(&unit.id(), &args, KeyVariant::Full)?;
        if let Some(entry) = self.inner.store.lookup(&key).await.entry() {
            return Ok(rendered_from_entry(entry));
        }

        let started_at = self.now();
        let rendered = self
            .execute(&unit, &args, detached(), RenderMode::ShellOnly, stack)
            .await?;
        if rendered.marker.is_none() {
            self.write_full(key, &rendered, started_at).await;
        }
        Ok(rendered)
    }

    // === Resolution ===

    async fn resolve(
        &self,
        unit: Arc<dyn RenderUnit>,
        args: RenderArgs,
        request: Arc<RequestContext>,
        stack: Vec<UnitId>,
    ) -> Result<RenderResult, RenderError> {
        let mut timer = RenderTimer::start();
        let id = unit.id();
        let key = derive_key(&id, &args, KeyVariant::Full)?;

        match self.inner.store.lookup(&key).await {
            Lookup::Fresh(entry) => {
                increment(metrics::CACHE_HIT_TOTAL);
                debug!(unit = %id, key = %key, "Cache hit");
                return Ok(entry_result(&entry, CacheStatus::Hit, &timer));
            }
            Lookup::Stale(entry) if self.inner.revalidate_on_stale => {
                increment(metrics::CACHE_STALE_TOTAL);
                debug!(unit = %id, key = %key, "Serving stale entry");
                self.spawn_revalidation(unit, args, key);
                return Ok(entry_result(&entry, CacheStatus::Stale, &timer));
            }
            Lookup::Stale(_) | Lookup::Miss => {}
        }
        increment(metrics::CACHE_MISS_TOTAL);

        if let Some(result) = self
            .fill_from_shell(&unit, &args, &request, &stack, &key, &mut timer)
            .await?
        {
            return Ok(result);
        }

        let this = self.clone();
        let (compute_unit, compute_args) = (Arc::clone(&unit), args.clone());
        let (compute_request, compute_stack) = (Arc::clone(&request), stack.clone());
        let flight_key = key.clone();
        let (outcome, role) = self
            .inner
            .flights
            .run(&key, move || {
                spawn_compute(id, async move {
                    this.compute_full(compute_unit, compute_args, compute_request, compute_stack, flight_key)
                        .await
                })
            })
            .await;
        let computed = outcome?;
        record_role(&mut timer, role, computed.compute);

        if computed.rendered.dynamic {
            if role == FlightRole::Follower {
                // The shared output was rendered with the leader's request.
                let started = Instant::now();
                let rendered = self
                    .execute(&unit, &args, request, RenderMode::Full, stack)
                    .await?;
                timer.record_compute(started.elapsed());
                return Ok(self.dynamic_result(rendered, &timer));
            }
            return Ok(self.dynamic_result(computed.rendered.clone(), &timer));
        }

        let status = if computed.stored {
            CacheStatus::Miss
        } else {
            CacheStatus::Bypass
        };
        Ok(match &computed.entry {
            Some(entry) => entry_result(entry, status, &timer),
            None => self.dynamic_result(computed.rendered.clone(), &timer),
        })
    }

    /// Serve from a cached shell plus a fill pass, if a shell exists.
    async fn fill_from_shell(
        &self,
        unit: &Arc<dyn RenderUnit>,
        args: &RenderArgs,
        request: &Arc<RequestContext>,
        stack: &[UnitId],
        key: &CacheKey,
        timer: &mut RenderTimer,
    ) -> Result<Option<RenderResult>, RenderError> {
        let id = unit.id();
        let shell_key = derive_key(&id, args, KeyVariant::Shell)?;
        let shell_entry = match self.inner.store.lookup(&shell_key).await {
            Lookup::Fresh(entry) => entry,
            Lookup::Stale(entry) => {
                if self.inner.revalidate_on_stale {
                    self.spawn_shell_revalidation(Arc::clone(unit), args.clone(), shell_key);
                }
                entry
            }
            Lookup::Miss => return Ok(None),
        };
        let shell = match ShellPayload::decode(&shell_entry.value) {
            Ok(shell) => shell,
            Err(err) => {
                warn!(unit = %id, error = %err, "Cached shell is unreadable, rendering in full");
                return Ok(None);
            }
        };

        let started_at = self.now();
        let started = Instant::now();
        let rendered = self
            .execute(unit, args, Arc::clone(request), RenderMode::Full, stack.to_vec())
            .await?;
        timer.record_fill(started.elapsed());

        if !rendered.dynamic {
            debug!(unit = %id, "Fill pass read no request input, caching full output");
            let (entry, stored) = self.write_full(key.clone(), &rendered, started_at).await;
            let status = if stored {
                CacheStatus::Miss
            } else {
                CacheStatus::Bypass
            };
            return Ok(Some(entry_result(&entry, status, timer)));
        }

        let fill = rendered.output();
        match shell.merge(&fill) {
            Some(merged) => {
                let mut bounds = ResponseBounds::from_entry(&shell_entry);
                bounds.merge(&rendered.bounds);
                let mut tags = shell_entry.tags.clone();
                tags.extend(rendered.tags);
                debug!(unit = %id, position = shell.marker.position, "Filled cached shell");
                Ok(Some(RenderResult {
                    value: merged,
                    status: CacheStatus::Partial,
                    bounds,
                    tags,
                    postponed: Some(shell.marker),
                    profile: shell_entry.profile(),
                    timings: timer.finish(),
                }))
            }
            None => {
                warn!(
                    unit = %id,
                    position = shell.marker.position,
                    "Fill output does not match cached shell, serving full render"
                );
                increment(metrics::RENDER_DYNAMIC_TOTAL);
                Ok(Some(self.dynamic_result(rendered, timer)))
            }
        }
    }

    // === Computation ===

    async fn compute_full(
        &self,
        unit: Arc<dyn RenderUnit>,
        args: RenderArgs,
        request: Arc<RequestContext>,
        stack: Vec<UnitId>,
        key: CacheKey,
    ) -> Result<Arc<Computed>, RenderError> {
        let started_at = self.now();
        let started = Instant::now();
        let rendered = self
            .execute(&unit, &args, request, RenderMode::Full, stack)
            .await?;
        let compute = started.elapsed();

        if rendered.dynamic {
            increment(metrics::RENDER_DYNAMIC_TOTAL);
            debug!(unit = %unit.id(), "Output depends on request input, not cached");
            return Ok(Arc::new(Computed {
                rendered,
                entry: None,
                stored: false,
                compute,
            }));
        }

        let (entry, stored) = self.write_full(key, &rendered, started_at).await;
        Ok(Arc::new(Computed {
            rendered,
            entry: Some(Arc::new(entry)),
            stored,
            compute,
        }))
    }

    async fn compute_shell(
        &self,
        unit: Arc<dyn RenderUnit>,
        args: RenderArgs,
        key: CacheKey,
        shell_key: CacheKey,
    ) -> Result<Arc<Computed>, RenderError> {
        let started_at = self.now();
        let started = Instant::now();
        let rendered = self
            .execute(&unit, &args, detached(), RenderMode::ShellOnly, Vec::new())
            .await?;
        let compute = started.elapsed();

        let Some(marker) = rendered.marker.clone() else {
            let (entry, stored) = self.write_full(key, &rendered, started_at).await;
            return Ok(Arc::new(Computed {
                rendered,
                entry: Some(Arc::new(entry)),
                stored,
                compute,
            }));
        };

        increment(metrics::RENDER_POSTPONED_TOTAL);
        let payload = ShellPayload {
            prefix: Bytes::from(rendered.body.clone()),
            tail: Bytes::from(rendered.tail.clone()),
            marker,
        };
        let (entry, stored) = match payload.encode() {
            Ok(encoded) => {
                let entry = self.build_entry(shell_key, Bytes::from(encoded), &rendered, started_at);
                let stored = self.inner.store.set(entry.clone()).await.is_ok();
                (Some(Arc::new(entry)), stored)
            }
            Err(err) => {
                warn!(unit = %unit.id(), error = %err, "Failed to encode shell");
                (None, false)
            }
        };
        Ok(Arc::new(Computed {
            rendered,
            entry,
            stored,
            compute,
        }))
    }

    async fn execute(
        &self,
        unit: &Arc<dyn RenderUnit>,
        args: &RenderArgs,
        request: Arc<RequestContext>,
        mode: RenderMode,
        stack: Vec<UnitId>,
    ) -> Result<Rendered, RenderError> {
        let id = unit.id();
        let mut scope = RenderScope::new(self.clone(), id.clone(), mode, request, stack);
        increment(metrics::RENDER_COMPUTE_TOTAL);
        debug!(unit = %id, mode = ?mode, "Executing render unit");

        if let Err(err) = unit.render(&mut scope, args).await {
            let err = RenderError::from_unit(id.as_str(), err);
            warn!(unit = %id, error = %err, "Render unit failed");
            return Err(err);
        }
        Ok(scope.finish())
    }

    // === Background refresh ===

    fn spawn_revalidation(&self, unit: Arc<dyn RenderUnit>, args: RenderArgs, key: CacheKey) {
        if self.inner.flights.in_flight(&key) {
            debug!(key = %key, "Revalidation already in flight");
            return;
        }

        let this = self.clone();
        let id = unit.id();
        tokio::spawn(
            async move {
                if this.inner.store.lookup(&key).await.is_fresh() {
                    debug!(unit = %id, "Entry already refreshed");
                    return;
                }

                let task = this.clone();
                let flight_key = key.clone();
                let (outcome, role) = this
                    .inner
                    .flights
                    .run(&key, move || {
                        spawn_compute(unit.id(), async move {
                            task.compute_full(unit, args, detached(), Vec::new(), flight_key).await
                        })
                    })
                    .await;

                if role != FlightRole::Leader {
                    debug!(unit = %id, "Joined in-flight revalidation");
                    return;
                }
                increment(metrics::REVALIDATION_TOTAL);

                match outcome {
                    Ok(computed) if computed.rendered.dynamic => {
                        debug!(unit = %id, "Revalidation read request input, stale entry kept until expiry");
                    }
                    Ok(computed) if !computed.stored => {
                        warn!(unit = %id, "Revalidated output could not be stored");
                    }
                    Ok(_) => debug!(unit = %id, "Background revalidation complete"),
                    Err(err) => {
                        increment(metrics::REVALIDATION_FAILURE_TOTAL);
                        warn!(
                            unit = %id,
                            error = %err,
                            "Background revalidation failed, serving stale until expiry"
                        );
                    }
                }
            }
            .in_current_span(),
        );
    }

    fn spawn_shell_revalidation(&self, unit: Arc<dyn RenderUnit>, args: RenderArgs, shell_key: CacheKey) {
        if self.inner.flights.in_flight(&shell_key) {
            return;
        }

        let this = self.clone();
        tokio::spawn(
            async move {
                let id = unit.id();
                if let Err(err) = this.prerender(unit, args).await {
                    increment(metrics::REVALIDATION_FAILURE_TOTAL);
                    warn!(unit = %id, error = %err, "Background shell refresh failed");
                }
            }
            .in_current_span(),
        );
    }

    // === Entries ===

    fn build_entry(
        &self,
        key: CacheKey,
        value: Bytes,
        rendered: &Rendered,
        created_at: DateTime<Utc>,
    ) -> CacheEntry {
        let profile = self.profile_of(rendered);
        let entry = CacheEntry::new(key, value, rendered.tags.iter().cloned(), created_at, &profile);
        match (rendered.bounds.stale_at, rendered.bounds.expire_at) {
            (Some(stale_at), Some(expire_at)) => entry.capped(FreshnessCap { stale_at, expire_at }),
            _ => entry,
        }
    }

    /// Store a static output under its full key. Returns the entry and
    /// whether the write succeeded.
    async fn write_full(
        &self,
        key: CacheKey,
        rendered: &Rendered,
        created_at: DateTime<Utc>,
    ) -> (CacheEntry, bool) {
        let entry = self.build_entry(key, Bytes::from(rendered.output()), rendered, created_at);
        let stored = self.inner.store.set(entry.clone()).await.is_ok();
        (entry, stored)
    }

    fn profile_of(&self, rendered: &Rendered) -> StalenessProfile {
        rendered
            .profile
            .unwrap_or_else(|| self.inner.store.profiles().default_profile())
    }

    fn dynamic_result(&self, rendered: Rendered, timer: &RenderTimer) -> RenderResult {
        let profile = self.profile_of(&rendered);
        let value = Bytes::from(rendered.output());
        RenderResult {
            value,
            status: CacheStatus::Dynamic,
            bounds: rendered.bounds,
            tags: rendered.tags,
            postponed: None,
            profile,
            timings: timer.finish(),
        }
    }
}

/// Start a computation on its own task so it completes even if every
/// caller waiting on it goes away.
fn spawn_compute<Fut>(unit: UnitId, work: Fut) -> impl Future<Output = Result<Arc<Computed>, RenderError>> + Send + 'static
where
    Fut: Future<Output = Result<Arc<Computed>, RenderError>> + Send + 'static,
{
    let task = tokio::spawn(work.in_current_span());
    async move {
        match task.await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(unit = %unit, error = %err, "Render task did not complete");
                Err(RenderError::ComputationFailure {
                    unit: unit.to_string(),
                    message: format!("render task aborted: {err}"),
                })
            }
        }
    }
}

fn detached() -> Arc<RequestContext> {
    Arc::new(RequestContext::detached())
}

fn record_role(timer: &mut RenderTimer, role: FlightRole, compute: Duration) {
    match role {
        FlightRole::Leader => timer.record_compute(compute),
        FlightRole::Follower => {
            increment(metrics::RENDER_COLLAPSED_TOTAL);
            timer.record_wait(timer.elapsed());
        }
    }
}

fn entry_result(entry: &CacheEntry, status: CacheStatus, timer: &RenderTimer) -> RenderResult {
    RenderResult {
        value: entry.value.clone(),
        status,
        bounds: ResponseBounds::from_entry(entry),
        tags: entry.tags.clone(),
        postponed: None,
        profile: entry.profile(),
        timings: timer.finish(),
    }
}

fn rendered_from_entry(entry: &CacheEntry) -> Rendered {
    Rendered {
        body: entry.value.to_vec(),
        tail: Vec::new(),
        tags: entry.tags.clone(),
        profile: Some(entry.profile()),
        bounds: ResponseBounds::from_entry(entry),
        marker: None,
        dynamic: false,
    }
}
