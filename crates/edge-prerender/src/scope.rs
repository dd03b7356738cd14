//! Dynamic boundary tracking.
//!
//! A `RenderScope` lives for one render unit invocation. It buffers output,
//! collects tags and cache life, and records every access to per-request
//! input. In `ShellOnly` mode the first such access stops the render: the
//! scope moves to `Aborted`, records a postpone marker at the current output
//! position, and drops everything written afterwards.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use edge_cache::{RenderArgs, ResponseBounds, StalenessProfile, UnitId};
use edge_core::RequestContext;
use futures::future::{BoxFuture, FutureExt};
use tracing::debug;

use crate::error::RenderError;
use crate::orchestrator::Orchestrator;
use crate::shell::PostponeMarker;
use crate::unit::{RenderMode, RenderUnit};

/// Boundary tracker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    /// No dynamic access observed.
    Idle,
    /// Dynamic access observed; rendering continued.
    DynamicDetected,
    /// Dynamic access in a shell-only render; rendering stopped.
    Aborted,
}

/// One recorded access to per-request input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicAccessEvent {
    pub reason: String,
    /// Output position at the time of access.
    pub position: usize,
}

/// Result of a dynamic access.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum DynamicAccess<T> {
    /// The value is available; the render is now dynamic.
    Granted(T),
    /// Shell-only render: the access stopped the render here.
    Postponed(PostponeMarker),
}

impl<T> DynamicAccess<T> {
    /// The granted value, if any.
    pub fn granted(self) -> Option<T> {
        match self {
            Self::Granted(value) => Some(value),
            Self::Postponed(_) => None,
        }
    }

    pub fn is_postponed(&self) -> bool {
        matches!(self, Self::Postponed(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> DynamicAccess<U> {
        match self {
            Self::Granted(value) => DynamicAccess::Granted(f(value)),
            Self::Postponed(marker) => DynamicAccess::Postponed(marker),
        }
    }
}

/// Everything a finished scope produced.
#[derive(Debug, Clone)]
pub(crate) struct Rendered {
    pub body: Vec<u8>,
    pub tail: Vec<u8>,
    pub tags: BTreeSet<String>,
    pub profile: Option<StalenessProfile>,
    pub bounds: ResponseBounds,
    pub marker: Option<PostponeMarker>,
    pub dynamic: bool,
}

impl Rendered {
    /// Body followed by tail.
    pub fn output(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + self.tail.len());
        out.extend_from_slice(&self.body);
        out.extend_from_slice(&self.tail);
        out
    }
}

/// Per-invocation render state.
pub struct RenderScope {
    unit: UnitId,
    mode: RenderMode,
    state: ScopeState,
    body: Vec<u8>,
    tail: Vec<u8>,
    marker: Option<PostponeMarker>,
    events: Vec<DynamicAccessEvent>,
    tags: BTreeSet<String>,
    profile: Option<StalenessProfile>,
    bounds: ResponseBounds,
    request: Arc<RequestContext>,
    stack: Vec<UnitId>,
    orchestrator: Orchestrator,
}

impl std::fmt::Debug for RenderScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderScope")
            .field("unit", &self.unit)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("written", &self.body.len())
            .finish_non_exhaustive()
    }
}

impl RenderScope {
    /// `stack` lists the units enclosing this one, outermost first.
    pub(crate) fn new(
        orchestrator: Orchestrator,
        unit: UnitId,
        mode: RenderMode,
        request: Arc<RequestContext>,
        mut stack: Vec<UnitId>,
    ) -> Self {
        stack.push(unit.clone());
        Self {
            unit,
            mode,
            state: ScopeState::Idle,
            body: Vec::new(),
            tail: Vec::new(),
            marker: None,
            events: Vec::new(),
            tags: BTreeSet::new(),
            profile: None,
            bounds: ResponseBounds::unbounded(),
            request,
            stack,
            orchestrator,
        }
    }

    pub fn unit(&self) -> &UnitId {
        &self.unit
    }

    pub fn mode(&self) -> RenderMode {
        self.mode
    }

    /// Current boundary state.
    pub fn state(&self) -> ScopeState {
        self.state
    }

    /// Where a shell-only render stopped.
    pub fn postpone_marker(&self) -> Option<&PostponeMarker> {
        self.marker.as_ref()
    }

    /// Dynamic accesses in the order they happened.
    pub fn dynamic_accesses(&self) -> &[DynamicAccessEvent] {
        &self.events
    }

    /// Whether the render was stopped at a postpone marker.
    pub fn is_aborted(&self) -> bool {
        self.state == ScopeState::Aborted
    }

    /// Bytes written so far.
    pub fn position(&self) -> usize {
        self.body.len()
    }

    // === Output ===

    /// Append output. Ignored once aborted.
    pub fn write(&mut self, bytes: impl AsRef<[u8]>) {
        if !self.is_aborted() {
            self.body.extend_from_slice(bytes.as_ref());
        }
    }

    /// Register closing content that follows all later output.
    ///
    /// Tails nest: the most recently registered tail closes first. A tail
    /// registered before a dynamic access is part of the static shell.
    pub fn write_tail(&mut self, bytes: impl AsRef<[u8]>) {
        if !self.is_aborted() {
            let mut tail = bytes.as_ref().to_vec();
            tail.extend_from_slice(&self.tail);
            self.tail = tail;
        }
    }

    /// Attach an invalidation tag to this output.
    pub fn tag(&mut self, tag: impl Into<String>) {
        if !self.is_aborted() {
            self.tags.insert(tag.into());
        }
    }

    /// Tags collected so far.
    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Select a named staleness profile. The tightest selection wins.
    pub fn cache_life(&mut self, profile: &str) {
        let profile = self.orchestrator.store().profiles().resolve(profile);
        self.cache_life_profile(profile);
    }

    /// Select explicit staleness durations. The tightest selection wins.
    pub fn cache_life_profile(&mut self, profile: StalenessProfile) {
        self.profile = Some(match self.profile {
            Some(current) => current.tightest(profile),
            None => profile,
        });
    }

    // === Dynamic access ===

    /// Record an access to per-request input.
    ///
    /// Full mode: the scope becomes `DynamicDetected` and the access is
    /// granted. Shell-only mode: the scope becomes `Aborted` with a marker at
    /// the current position, and the access is postponed.
    pub fn mark_dynamic_access(&mut self, reason: impl Into<String>) -> DynamicAccess<()> {
        let reason = reason.into();
        match (self.mode, self.state) {
            (_, ScopeState::Aborted) => match &self.marker {
                Some(marker) => DynamicAccess::Postponed(marker.clone()),
                None => DynamicAccess::Postponed(PostponeMarker {
                    position: self.position(),
                    reason,
                }),
            },
            (RenderMode::Full, _) => {
                self.events.push(DynamicAccessEvent {
                    reason,
                    position: self.position(),
                });
                self.state = ScopeState::DynamicDetected;
                DynamicAccess::Granted(())
            }
            (RenderMode::ShellOnly, _) => {
                let marker = PostponeMarker {
                    position: self.position(),
                    reason: reason.clone(),
                };
                debug!(unit = %self.unit, position = marker.position, reason = %reason, "Shell render postponed");
                self.events.push(DynamicAccessEvent {
                    reason,
                    position: marker.position,
                });
                self.state = ScopeState::Aborted;
                self.marker = Some(marker.clone());
                DynamicAccess::Postponed(marker)
            }
        }
    }

    /// The request being served.
    pub fn request(&mut self) -> DynamicAccess<Arc<RequestContext>> {
        let request = Arc::clone(&self.request);
        self.mark_dynamic_access("request").map(|_| request)
    }

    /// A request header.
    pub fn header(&mut self, name: &str) -> DynamicAccess<Option<String>> {
        let value = self.request.header(name).map(str::to_string);
        self.mark_dynamic_access(format!("header:{}", name.to_ascii_lowercase()))
            .map(|_| value)
    }

    /// A request cookie.
    pub fn cookie(&mut self, name: &str) -> DynamicAccess<Option<String>> {
        let value = self.request.cookie(name).map(str::to_string);
        self.mark_dynamic_access(format!("cookie:{name}"))
            .map(|_| value)
    }

    /// A query parameter.
    pub fn query_param(&mut self, name: &str) -> DynamicAccess<Option<String>> {
        let value = self.request.query_param(name).map(str::to_string);
        self.mark_dynamic_access(format!("query:{name}"))
            .map(|_| value)
    }

    /// Current wall-clock time.
    pub fn now(&mut self) -> DynamicAccess<DateTime<Utc>> {
        let now = self.orchestrator.store().now();
        self.mark_dynamic_access("time").map(|_| now)
    }

    // === Nesting ===

    /// Render another unit in place, through the cache.
    ///
    /// The child's tags, cache life and freshness bounds propagate to this
    /// scope. Dynamic access in the child makes this scope dynamic; a child
    /// shell that stopped at a marker stops this scope at the same point.
    pub fn include(
        &mut self,
        unit: Arc<dyn RenderUnit>,
        args: RenderArgs,
    ) -> BoxFuture<'_, Result<(), RenderError>> {
        async move {
            if self.is_aborted() {
                return Ok(());
            }

            let child_id = unit.id();
            if self.stack.contains(&child_id) {
                let mut path: Vec<String> = self.stack.iter().map(UnitId::to_string).collect();
                path.push(child_id.to_string());
                return Err(RenderError::Cycle {
                    unit: child_id.to_string(),
                    path,
                });
            }

            let child = match self.mode {
                RenderMode::Full => {
                    self.orchestrator
                        .include_full(unit, args, Arc::clone(&self.request), self.stack.clone())
                        .await?
                }
                RenderMode::ShellOnly => {
                    self.orchestrator
                        .include_shell(unit, args, self.stack.clone())
                        .await?
                }
            };
            self.absorb(&child_id, child);
            Ok(())
        }
        .boxed()
    }

    fn absorb(&mut self, child_id: &UnitId, child: Rendered) {
        self.body.extend_from_slice(&child.body);
        self.tags.extend(child.tags);
        self.bounds.merge(&child.bounds);
        if let Some(profile) = child.profile {
            self.cache_life_profile(profile);
        }

        match child.marker {
            Some(marker) => {
                let mut tail = child.tail;
                tail.extend_from_slice(&self.tail);
                self.tail = tail;
                let _ = self.mark_dynamic_access(format!("include:{child_id}:{}", marker.reason));
            }
            None => {
                self.body.extend_from_slice(&child.tail);
                if child.dynamic {
                    let _ = self.mark_dynamic_access(format!("include:{child_id}"));
                }
            }
        }
    }

    pub(crate) fn finish(self) -> Rendered {
        let mut bounds = self.bounds;
        let dynamic = self.state != ScopeState::Idle;
        if dynamic {
            bounds.mark_dynamic();
        }
        Rendered {
            body: self.body,
            tail: self.tail,
            tags: self.tags,
            profile: self.profile,
            bounds,
            marker: self.marker,
            dynamic,
        }
    }
}
