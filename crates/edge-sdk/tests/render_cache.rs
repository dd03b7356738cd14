//! End-to-end behavior of the render cache through the public engine API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use edge_sdk::prelude::*;

// === Fixtures ===

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.cache.sweep_interval_secs = 0;
    config
        .profiles
        .insert("short".into(), StalenessProfile::new(1, 10, 100));
    config
}

fn engine() -> (Engine, ManualClock) {
    let clock = ManualClock::starting_now();
    let engine = Engine::builder(config())
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    (engine, clock)
}

fn request(user: &str) -> RequestContext {
    RequestContext::new("/").with_cookie("user", user)
}

fn card_args(id: u64) -> RenderArgs {
    RenderArgs::new().with(&id)
}

/// Product card counting its executions.
struct ProductCard {
    runs: AtomicUsize,
    delay: Duration,
    profile: Option<&'static str>,
}

impl ProductCard {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            runs: AtomicUsize::new(0),
            delay: Duration::ZERO,
            profile: None,
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            runs: AtomicUsize::new(0),
            delay,
            profile: None,
        })
    }

    fn with_profile(profile: &'static str) -> Arc<Self> {
        Arc::new(Self {
            runs: AtomicUsize::new(0),
            delay: Duration::ZERO,
            profile: Some(profile),
        })
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RenderUnit for ProductCard {
    fn id(&self) -> UnitId {
        UnitId::new("product-card")
    }

    async fn render(&self, scope: &mut RenderScope, args: &RenderArgs) -> anyhow::Result<()> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let id: u64 = args.get(0).context("missing product id")?;
        scope.tag(format!("product:{id}"));
        scope.tag("products");
        if let Some(profile) = self.profile {
            scope.cache_life(profile);
        }
        scope.write(format!("<div class=\"card\" data-id=\"{id}\">render {run}</div>"));
        Ok(())
    }
}

/// Layout with a per-user greeting in the middle.
struct Layout {
    runs: AtomicUsize,
    delay: Duration,
}

impl Layout {
    fn new() -> Arc<Self> {
        Self::slow(Duration::ZERO)
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            runs: AtomicUsize::new(0),
            delay,
        })
    }
}

const LAYOUT_PREFIX: &str = "<html><body><nav>Shop</nav>";
const LAYOUT_TAIL: &str = "</body></html>";

#[async_trait]
impl RenderUnit for Layout {
    fn id(&self) -> UnitId {
        UnitId::new("layout")
    }

    async fn render(&self, scope: &mut RenderScope, _args: &RenderArgs) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        scope.tag("layout");
        scope.write(LAYOUT_PREFIX);
        scope.write_tail(LAYOUT_TAIL);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(user) = scope.cookie("user").granted() {
            scope.write(format!("<p>Signed in as {}</p>", user.unwrap_or_else(|| "guest".into())));
        }
        scope.write("<main>catalog</main>");
        Ok(())
    }
}

/// Page wrapping a product card.
struct ProductPage {
    card: Arc<ProductCard>,
}

#[async_trait]
impl RenderUnit for ProductPage {
    fn id(&self) -> UnitId {
        UnitId::new("product-page")
    }

    async fn render(&self, scope: &mut RenderScope, args: &RenderArgs) -> anyhow::Result<()> {
        scope.tag("pages");
        scope.write("<article>");
        scope.write_tail("</article>");
        scope.include(self.card.clone(), args.clone()).await?;
        Ok(())
    }
}

struct Flaky {
    runs: AtomicUsize,
}

#[async_trait]
impl RenderUnit for Flaky {
    fn id(&self) -> UnitId {
        UnitId::new("flaky")
    }

    async fn render(&self, _scope: &mut RenderScope, _args: &RenderArgs) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        anyhow::bail!("inventory service unavailable")
    }
}

#[derive(Debug)]
struct UnreachableBackend;

#[async_trait]
impl CacheBackend for UnreachableBackend {
    fn name(&self) -> &'static str {
        "unreachable"
    }

    async fn get(&self, _key: &CacheKey) -> StoreResult<Option<Arc<CacheEntry>>> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn set(&self, _entry: Arc<CacheEntry>) -> StoreResult<()> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn delete(&self, _key: &CacheKey) -> StoreResult<()> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// === Caching ===

#[tokio::test]
async fn test_second_call_served_from_cache_without_rerun() {
    let (engine, _clock) = engine();
    let card = ProductCard::new();

    let first = engine.render(card.clone(), card_args(7), request("ada")).await.unwrap();
    let second = engine.render(card.clone(), card_args(7), request("bob")).await.unwrap();

    assert_eq!(first.status, CacheStatus::Miss);
    assert_eq!(second.status, CacheStatus::Hit);
    assert_eq!(first.value, second.value);
    assert_eq!(card.runs(), 1);
    assert!(second.tags.contains("product:7"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cold_calls_execute_once() {
    let (engine, _clock) = engine();
    let engine = Arc::new(engine);
    let card = ProductCard::slow(Duration::from_millis(50));

    let mut handles = Vec::new();
    for _ in 0..50 {
        let engine = Arc::clone(&engine);
        let card = Arc::clone(&card);
        handles.push(tokio::spawn(async move {
            engine.render(card, card_args(1), request("ada")).await
        }));
    }

    let mut values = Vec::new();
    for handle in handles {
        values.push(handle.await.unwrap().unwrap().value);
    }

    assert_eq!(card.runs(), 1);
    assert!(values.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(engine.orchestrator().in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_shared_by_waiters_and_not_cached() {
    let (engine, _clock) = engine();
    let engine = Arc::new(engine);
    let flaky = Arc::new(Flaky {
        runs: AtomicUsize::new(0),
    });

    let mut handles = Vec::new();
    for _ in 0..10 {
        let engine = Arc::clone(&engine);
        let flaky = Arc::clone(&flaky);
        handles.push(tokio::spawn(async move {
            engine.render(flaky, RenderArgs::new(), request("ada")).await
        }));
    }
    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("inventory service unavailable"));
    }
    assert_eq!(flaky.runs.load(Ordering::SeqCst), 1);

    engine
        .render(flaky.clone(), RenderArgs::new(), request("ada"))
        .await
        .unwrap_err();
    assert_eq!(flaky.runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unreachable_backend_fails_open() {
    let clock = ManualClock::starting_now();
    let engine = Engine::builder(config())
        .clock(Arc::new(clock))
        .backend(Arc::new(UnreachableBackend))
        .build()
        .unwrap();
    let card = ProductCard::new();

    let first = engine.render(card.clone(), card_args(3), request("ada")).await.unwrap();
    let second = engine.render(card.clone(), card_args(3), request("ada")).await.unwrap();

    assert_eq!(first.status, CacheStatus::Bypass);
    assert_eq!(second.status, CacheStatus::Bypass);
    assert_eq!(second.text(), Some("<div class=\"card\" data-id=\"3\">render 2</div>"));
}

#[tokio::test]
async fn test_encoded_backend_serves_identical_bytes() {
    let clock = ManualClock::starting_now();
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let backend = Arc::new(EncodedKvBackend::new(Arc::clone(&shared)));
    let engine = Engine::builder(config())
        .clock(shared)
        .backend(backend.clone())
        .build()
        .unwrap();
    let card = ProductCard::new();

    let first = engine.render(card.clone(), card_args(9), request("ada")).await.unwrap();
    let second = engine.render(card.clone(), card_args(9), request("ada")).await.unwrap();
    assert_eq!(second.status, CacheStatus::Hit);
    assert_eq!(first.value, second.value);
    assert_eq!(first.bounds, second.bounds);

    let key = derive_key(&UnitId::new("product-card"), &card_args(9), KeyVariant::Full).unwrap();
    let stored = CacheEntry::decode(&backend.raw(&key).unwrap()).unwrap();
    assert_eq!(stored.value, first.value);
    assert_eq!(stored.tags, first.tags);
    assert_eq!(Some(stored.stale_at), first.bounds.stale_at);
    assert_eq!(Some(stored.expire_at), first.bounds.expire_at);
}

// === Invalidation ===

#[tokio::test]
async fn test_invalidate_tag_forces_recompute() {
    let (engine, clock) = engine();
    let card = ProductCard::new();
    engine.render(card.clone(), card_args(7), request("ada")).await.unwrap();

    assert_eq!(engine.invalidate_tag("product:7").await, 1);
    let key = derive_key(&UnitId::new("product-card"), &card_args(7), KeyVariant::Full).unwrap();
    assert!(engine.store().lookup(&key).await.is_miss());

    clock.advance(Duration::from_secs(1));
    let after = engine.render(card.clone(), card_args(7), request("ada")).await.unwrap();
    assert_eq!(after.status, CacheStatus::Miss);
    assert_eq!(after.text(), Some("<div class=\"card\" data-id=\"7\">render 2</div>"));

    let again = engine.render(card.clone(), card_args(7), request("ada")).await.unwrap();
    assert_eq!(again.status, CacheStatus::Hit);
    assert_eq!(card.runs(), 2);
}

#[tokio::test]
async fn test_invalidate_unknown_tag_is_noop() {
    let (engine, _clock) = engine();
    let card = ProductCard::new();
    engine.render(card.clone(), card_args(1), request("ada")).await.unwrap();

    assert_eq!(engine.invalidate_tag("product:999").await, 0);
    let result = engine.render(card.clone(), card_args(1), request("ada")).await.unwrap();
    assert_eq!(result.status, CacheStatus::Hit);
}

#[tokio::test]
async fn test_invalidate_with_profile_caps_freshness() {
    let (engine, clock) = engine();
    let card = ProductCard::new();
    engine.render(card.clone(), card_args(5), request("ada")).await.unwrap();

    // "seconds": revalidate after 1s, expire after 60s.
    assert_eq!(engine.invalidate_tag_profile("products", "seconds").await, 1);
    let still_fresh = engine.render(card.clone(), card_args(5), request("ada")).await.unwrap();
    assert_eq!(still_fresh.status, CacheStatus::Hit);

    clock.advance(Duration::from_secs(2));
    let stale = engine.render(card.clone(), card_args(5), request("ada")).await.unwrap();
    assert_eq!(stale.status, CacheStatus::Stale);
    assert_eq!(stale.value, still_fresh.value);
}

#[tokio::test]
async fn test_child_invalidation_reaches_parent() {
    let (engine, clock) = engine();
    let card = ProductCard::with_profile("seconds");
    let page = Arc::new(ProductPage { card: card.clone() });

    let first = engine.render(page.clone(), card_args(2), request("ada")).await.unwrap();
    assert_eq!(
        first.text(),
        Some("<article><div class=\"card\" data-id=\"2\">render 1</div></article>")
    );
    assert!(first.tags.contains("pages"));
    assert!(first.tags.contains("product:2"));
    // The child's "seconds" profile bounds the page.
    assert_eq!(first.bounds.expire_at, Some(add_secs(clock.now(), 60)));

    engine.invalidate_tag("product:2").await;
    clock.advance(Duration::from_secs(1));

    let second = engine.render(page.clone(), card_args(2), request("ada")).await.unwrap();
    assert_eq!(second.status, CacheStatus::Miss);
    assert_eq!(
        second.text(),
        Some("<article><div class=\"card\" data-id=\"2\">render 2</div></article>")
    );
}

// === Stale-while-revalidate ===

#[tokio::test]
async fn test_stale_entry_served_while_one_refresh_runs() {
    let (engine, clock) = engine();
    let card = ProductCard::with_profile("short");

    let first = engine.render(card.clone(), card_args(4), request("ada")).await.unwrap();
    assert_eq!(first.text(), Some("<div class=\"card\" data-id=\"4\">render 1</div>"));

    // Past revalidate (10s), before expire (100s).
    clock.advance(Duration::from_secs(15));
    let stale = engine.render(card.clone(), card_args(4), request("ada")).await.unwrap();
    let stale_again = engine.render(card.clone(), card_args(4), request("ada")).await.unwrap();
    assert_eq!(stale.status, CacheStatus::Stale);
    assert_eq!(stale_again.status, CacheStatus::Stale);
    assert_eq!(stale.value, first.value);

    let orchestrator = engine.orchestrator().clone();
    let refreshed = Arc::clone(&card);
    wait_until(move || refreshed.runs() >= 2 && orchestrator.in_flight() == 0).await;

    let fresh = engine.render(card.clone(), card_args(4), request("ada")).await.unwrap();
    assert_eq!(fresh.status, CacheStatus::Hit);
    assert_eq!(fresh.text(), Some("<div class=\"card\" data-id=\"4\">render 2</div>"));
    assert_eq!(card.runs(), 2);
}

#[tokio::test]
async fn test_expired_entry_recomputed_in_foreground() {
    let (engine, clock) = engine();
    let card = ProductCard::with_profile("short");
    engine.render(card.clone(), card_args(4), request("ada")).await.unwrap();

    clock.advance(Duration::from_secs(100));
    let result = engine.render(card.clone(), card_args(4), request("ada")).await.unwrap();
    assert_eq!(result.status, CacheStatus::Miss);
    assert_eq!(card.runs(), 2);
}

#[tokio::test]
async fn test_stale_recomputed_in_foreground_when_background_refresh_disabled() {
    let clock = ManualClock::starting_now();
    let mut config = config();
    config.cache.revalidate_on_stale = false;
    let engine = Engine::builder(config)
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    let card = ProductCard::with_profile("short");
    engine.render(card.clone(), card_args(4), request("ada")).await.unwrap();

    clock.advance(Duration::from_secs(15));
    let result = engine.render(card.clone(), card_args(4), request("ada")).await.unwrap();
    assert_eq!(result.status, CacheStatus::Miss);
    assert_eq!(result.text(), Some("<div class=\"card\" data-id=\"4\">render 2</div>"));
}

// === Partial prerendering ===

#[tokio::test]
async fn test_shell_never_contains_output_after_dynamic_access() {
    let (engine, _clock) = engine();
    let layout = Layout::new();

    let shell = engine.prerender(layout.clone(), RenderArgs::new()).await.unwrap();
    let marker = shell.postponed.clone().unwrap();

    assert_eq!(marker.position, LAYOUT_PREFIX.len());
    assert_eq!(marker.reason, "cookie:user");
    assert_eq!(shell.value, format!("{LAYOUT_PREFIX}{LAYOUT_TAIL}").into_bytes());
    assert!(!shell.text().unwrap().contains("Signed in"));
    assert!(!shell.text().unwrap().contains("<main>"));

    let shell_key = derive_key(&UnitId::new("layout"), &RenderArgs::new(), KeyVariant::Shell).unwrap();
    let stored = engine.store().get(&shell_key).await.unwrap();
    let payload = ShellPayload::decode(&stored.value).unwrap();
    assert_eq!(payload.prefix, LAYOUT_PREFIX.as_bytes());
    assert_eq!(payload.tail, LAYOUT_TAIL.as_bytes());
    assert_eq!(payload.marker, marker);
}

#[tokio::test]
async fn test_fill_splices_request_content_into_shell() {
    let (engine, _clock) = engine();
    let layout = Layout::new();
    engine.prerender(layout.clone(), RenderArgs::new()).await.unwrap();

    let ada = engine.render(layout.clone(), RenderArgs::new(), request("ada")).await.unwrap();
    let bob = engine.render(layout.clone(), RenderArgs::new(), request("bob")).await.unwrap();

    assert_eq!(ada.status, CacheStatus::Partial);
    assert_eq!(
        ada.text(),
        Some("<html><body><nav>Shop</nav><p>Signed in as ada</p><main>catalog</main></body></html>")
    );
    assert!(bob.text().unwrap().contains("Signed in as bob"));
    assert!(ada.is_dynamic());
    assert_eq!(ada.bounds.max_age(engine.store().now()), Some(Duration::ZERO));
}

#[tokio::test]
async fn test_dynamic_render_without_shell_is_never_cached() {
    let (engine, _clock) = engine();
    let layout = Layout::new();

    let ada = engine.render(layout.clone(), RenderArgs::new(), request("ada")).await.unwrap();
    let bob = engine.render(layout.clone(), RenderArgs::new(), request("bob")).await.unwrap();

    assert_eq!(ada.status, CacheStatus::Dynamic);
    assert_eq!(bob.status, CacheStatus::Dynamic);
    assert!(bob.text().unwrap().contains("Signed in as bob"));
    assert_eq!(layout.runs.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dynamic_renders_keep_their_own_request() {
    let (engine, _clock) = engine();
    let engine = Arc::new(engine);
    let layout = Layout::slow(Duration::from_millis(50));

    let mut handles = Vec::new();
    for user in ["ada", "bob", "cyd"] {
        let engine = Arc::clone(&engine);
        let layout = Arc::clone(&layout);
        handles.push(tokio::spawn(async move {
            let result = engine
                .render(layout, RenderArgs::new(), request(user))
                .await
                .unwrap();
            (user, result)
        }));
    }

    for handle in handles {
        let (user, result) = handle.await.unwrap();
        assert_eq!(result.status, CacheStatus::Dynamic);
        assert!(result.text().unwrap().contains(&format!("Signed in as {user}")));
    }
}

// === Segments ===

#[tokio::test]
async fn test_segment_cache_serves_and_drops_on_invalidation() {
    let (engine, clock) = engine();
    let card = ProductCard::new();
    let route = RouteKey::new("/products").with_param("id", "8");

    let first = engine
        .render_segment(&route, PrefetchKind::Static, card.clone(), card_args(8), request("ada"))
        .await
        .unwrap();
    assert_eq!(first.status, CacheStatus::Miss);
    assert_eq!(engine.segments().prefetchable(), vec![route.clone()]);

    let second = engine
        .render_segment(&route, PrefetchKind::Static, card.clone(), card_args(8), request("ada"))
        .await
        .unwrap();
    assert_eq!(second.status, CacheStatus::Hit);
    assert_eq!(second.value, first.value);

    engine.invalidate_tag("product:8").await;
    assert!(engine.segments().is_empty());

    clock.advance(Duration::from_secs(1));
    let third = engine
        .render_segment(&route, PrefetchKind::Static, card.clone(), card_args(8), request("ada"))
        .await
        .unwrap();
    assert_eq!(third.status, CacheStatus::Miss);
    assert_eq!(card.runs(), 2);
}

#[tokio::test]
async fn test_segment_hit_keeps_server_bounds() {
    let clock = ManualClock::starting_now();
    let mut config = config();
    // Client staleness longer than the server entry lives.
    config
        .profiles
        .insert("sticky".into(), StalenessProfile::new(600, 10, 30));
    let engine = Engine::builder(config)
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    let card = ProductCard::with_profile("sticky");
    let route = RouteKey::new("/products").with_param("id", "9");

    let first = engine
        .render_segment(&route, PrefetchKind::Static, card.clone(), card_args(9), request("ada"))
        .await
        .unwrap();
    let second = engine
        .render_segment(&route, PrefetchKind::Static, card.clone(), card_args(9), request("ada"))
        .await
        .unwrap();
    assert_eq!(second.status, CacheStatus::Hit);
    assert_eq!(second.bounds, first.bounds);
    assert_eq!(second.bounds.expire_at, Some(add_secs(clock.now(), 30)));

    // Past the server expiry the segment is gone too.
    clock.advance(Duration::from_secs(30));
    let third = engine
        .render_segment(&route, PrefetchKind::Static, card.clone(), card_args(9), request("ada"))
        .await
        .unwrap();
    assert_eq!(third.status, CacheStatus::Miss);
    assert_eq!(card.runs(), 2);
}

#[tokio::test]
async fn test_dynamic_segment_not_kept() {
    let (engine, _clock) = engine();
    let route = RouteKey::new("/");

    let result = engine
        .render_segment(&route, PrefetchKind::Runtime, Layout::new(), RenderArgs::new(), request("ada"))
        .await
        .unwrap();
    assert_eq!(result.status, CacheStatus::Dynamic);
    assert!(engine.segments().is_empty());
}

// === Sweeping ===

#[tokio::test]
async fn test_purge_reclaims_invalidated_entries() {
    let (engine, _clock) = engine();
    let card = ProductCard::new();
    engine.render(card.clone(), card_args(1), request("ada")).await.unwrap();
    engine.render(card.clone(), card_args(2), request("ada")).await.unwrap();

    engine.invalidate_tag("product:1").await;
    assert_eq!(engine.purge_expired().await, 1);
    assert_eq!(engine.store().index().key_count(), 1);
}
