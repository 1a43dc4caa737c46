//! Page runtime integration tests: activity flow, stored state, stats and
//! determinism, including property tests over random activity streams.

use catfield_engine::prelude::*;
use catfield_engine::store::{BLACKLIST_KEY, QUANTUM_STATE_KEY};
use proptest::prelude::*;
use serde_json::json;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type Echo = fn(&Request) -> Result<Response, ChannelError>;

fn echo(req: &Request) -> Result<Response, ChannelError> {
    match req {
        Request::LivenessProbe { timestamp } => Ok(Response::Pong {
            pong: true,
            timestamp: *timestamp,
        }),
        _ => Ok(Response::acknowledged()),
    }
}

fn page_with(config: EngineConfig, seed: u64, store: &MemoryStore) -> PageRuntime<Echo, LiveHost> {
    PageRuntime::new("tab", "example.org", config, seed, store, echo as Echo, LiveHost).unwrap()
}

fn event(kind: ActivityKind, at: u64, target: Option<String>) -> PageEvent {
    let anchor = ObservationContext {
        x: (at % 997) as f64,
        y: (at % 613) as f64,
        width: 64.0,
        height: 48.0,
    };
    let mut ev = ActivityEvent::new(kind, anchor, at);
    ev.target = target;
    PageEvent::Activity(ev)
}

fn kind_strategy() -> impl Strategy<Value = ActivityKind> {
    prop_oneof![
        Just(ActivityKind::Image),
        Just(ActivityKind::Video),
        Just(ActivityKind::Picture),
        Just(ActivityKind::Canvas),
        Just(ActivityKind::Attribute),
        Just(ActivityKind::Other),
    ]
}

// ---------------------------------------------------------------------------
// 1. Stored state and blacklist
// ---------------------------------------------------------------------------

#[test]
fn page_starts_from_background_seeded_state() {
    let mut bg = BackgroundCoordinator::new(Box::new(MemoryStore::new()), BackgroundConfig::default(), 0);
    bg.on_installed().unwrap();
    bg.advance_to(60_000);

    let mut store = MemoryStore::new();
    store
        .set(QUANTUM_STATE_KEY, serde_json::to_value(bg.stored_parameters().unwrap()).unwrap())
        .unwrap();
    let page = page_with(EngineConfig::default(), 1, &store);
    let c = page.parameters().unwrap().coherence;
    assert!((c - 0.92 * 0.99).abs() < 1e-12);
}

#[test]
fn stored_values_are_clamped_on_load() {
    let mut store = MemoryStore::new();
    store
        .set(
            QUANTUM_STATE_KEY,
            json!({"coherence": 0.05, "manifestationProbability": 0.99, "realityDistortion": -2.0}),
        )
        .unwrap();
    let page = page_with(EngineConfig::default(), 1, &store);
    let p = page.parameters().unwrap();
    assert_eq!(p.coherence, 0.3);
    assert_eq!(p.manifestation_probability, 0.75);
    assert_eq!(p.reality_distortion, 0.0);
}

#[test]
fn stored_blacklist_overrides_config() {
    let mut store = MemoryStore::new();
    store.set(BLACKLIST_KEY, json!(["example.org"])).unwrap();
    let result = PageRuntime::new(
        "tab",
        "www.example.org",
        EngineConfig::default(),
        1,
        &store,
        echo as Echo,
        LiveHost,
    );
    assert!(matches!(result, Err(EngineError::Blacklisted { .. })));

    // cnn.com is only on the default list, which the override replaced.
    let ok = PageRuntime::new("tab", "cnn.com", EngineConfig::default(), 1, &store, echo as Echo, LiveHost);
    assert!(ok.is_ok());
}

// ---------------------------------------------------------------------------
// 2. Activity flow
// ---------------------------------------------------------------------------

#[test]
fn only_media_manifests_by_default() {
    let mut config = EngineConfig::default();
    config.admission.policy = AdmissionPolicy::FixedThreshold { threshold: 1.0 };
    let mut page = page_with(config, 4, &MemoryStore::new());
    page.start();
    page.observe(event(ActivityKind::Attribute, 100, Some("a".into())));
    page.observe(event(ActivityKind::Other, 200, Some("b".into())));
    page.observe(event(ActivityKind::Canvas, 300, Some("c".into())));
    page.advance_to(1_000);
    let rendered = page.drain_render_requests();
    assert_eq!(rendered.len(), 1);
    assert_eq!(rendered[0].target.as_deref(), Some("c"));
    assert!(page.admission().is_marked("c"));
}

#[test]
fn ready_report_counts_recent_activity() {
    let mut page = page_with(EngineConfig::default(), 4, &MemoryStore::new());
    page.start();
    for t in [500, 1_500, 2_500, 3_000, 3_500] {
        page.observe(event(ActivityKind::Other, t, None));
    }
    page.advance_to(4_000);
    let report = page.report();
    assert_eq!(report.recent_activity_count, 5);
    page.advance_to(14_000);
    assert_eq!(page.report().recent_activity_count, 0);
}

#[test]
fn stats_query_matches_registry() {
    let mut config = EngineConfig::default();
    config.admission.policy = AdmissionPolicy::FixedThreshold { threshold: 1.0 };
    let mut page = page_with(config, 8, &MemoryStore::new());
    page.start();
    for i in 0..5u64 {
        page.observe(event(ActivityKind::Image, 1_000 + i, Some(format!("img-{i}"))));
    }
    page.advance_to(2_000);
    let reply = page.handle_request(&Request::StatsQuery).unwrap();
    let Response::Stats(stats) = reply else {
        panic!("expected stats, got {reply:?}");
    };
    assert_eq!(stats.shards, 5);
    assert_eq!(stats.cats, 5);
    assert_eq!(stats.stability, page.stats().stability);
}

// ---------------------------------------------------------------------------
// 3. Properties
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn field_stays_in_bounds(
        events in prop::collection::vec((kind_strategy(), 0u64..600_000, 0u32..50), 0..200),
        seed in any::<u64>(),
    ) {
        let mut page = page_with(EngineConfig::default(), seed, &MemoryStore::new());
        page.start();
        for (kind, at, target) in &events {
            page.observe(event(*kind, *at, Some(format!("el-{target}"))));
        }

        let mut t = 0;
        while t < 600_000 {
            t += 30_000;
            page.advance_to(t);
            let p = page.parameters().unwrap();
            prop_assert!(p.coherence >= 0.3 && p.coherence <= 1.0);
            prop_assert!(p.manifestation_probability <= 0.75);
            for e in page.registry().snapshot() {
                prop_assert!(e.age_ms(t) <= 300_000);
                prop_assert!(e.coherence_at_birth >= 0.1);
            }
            // A target hosts at most one live manifestation.
            prop_assert!(page.registry().count() <= 50);
            prop_assert_eq!(page.admission().marked_count(), page.registry().count());
        }
    }

    #[test]
    fn runs_are_reproducible(
        events in prop::collection::vec((kind_strategy(), 0u64..120_000), 0..60),
        seed in any::<u64>(),
    ) {
        let run = || {
            let mut page = page_with(EngineConfig::default(), seed, &MemoryStore::new());
            page.start();
            for (i, (kind, at)) in events.iter().enumerate() {
                page.observe(event(*kind, *at, Some(format!("el-{i}"))));
            }
            page.advance_to(150_000);
            page.capture_snapshot()
        };
        let a = run();
        let b = run();
        prop_assert_eq!(&a.hash, &b.hash);
        prop_assert_eq!(a, b);
    }
}
