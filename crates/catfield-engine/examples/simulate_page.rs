//! Headless page simulation.
//!
//! Runs one page against an in-process background for five simulated
//! minutes: synthetic image loads, a dropped link in the middle, recovery,
//! then a stats report.
//!
//! Run with:
//! ```sh
//! RUST_LOG=catfield_engine=info cargo run -p catfield-engine --example simulate_page [config.json]
//! ```

use catfield_engine::prelude::*;
use catfield_engine::store::QUANTUM_STATE_KEY;

const SEED: u64 = 0x00ca_7f1e_1d;
const STEP_MS: u64 = 500;
const END_MS: u64 = 300_000;
const OUTAGE: std::ops::Range<u64> = 60_000..75_000;

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    let background = BackgroundCoordinator::shared(
        Box::new(MemoryStore::new()),
        config.background.clone(),
        0,
    );
    background.borrow_mut().on_installed()?;

    // The page reads the same stored state the background seeded.
    let mut page_store = MemoryStore::new();
    if let Some(params) = background.borrow().stored_parameters() {
        page_store.set(QUANTUM_STATE_KEY, serde_json::to_value(params)?)?;
    }

    let (channel, link) = LoopbackChannel::new(background.clone());
    let mut page = PageRuntime::new(
        "tab-1",
        "example.org",
        config,
        SEED,
        &page_store,
        channel,
        LiveHost,
    )?;
    page.start();

    let mut rendered = 0usize;
    let mut now = 0;
    while now < END_MS {
        now += STEP_MS;

        if now == OUTAGE.start {
            println!("[{now:>6} ms] link down");
            link.fail_with(ChannelError::Timeout { waited_ms: 1_000 });
        }
        if now == OUTAGE.end {
            println!("[{now:>6} ms] link restored");
            link.heal();
        }

        // Bursty image loads: a handful every few seconds.
        if now % 4_000 == 0 {
            for i in 0..3u64 {
                let anchor = ObservationContext {
                    x: ((now / 10) % 1_200 + i * 80) as f64,
                    y: ((now / 7) % 800) as f64,
                    width: 160.0,
                    height: 120.0,
                };
                let kind = if i == 2 { ActivityKind::Other } else { ActivityKind::Image };
                let event = ActivityEvent::new(kind, anchor, now).with_target(format!("el-{now}-{i}"));
                page.observe(PageEvent::Activity(event));
            }
        }

        page.advance_to(now);
        background.borrow_mut().advance_to(now);

        for request in page.drain_render_requests() {
            rendered += 1;
            tracing::debug!(id = %request.id, size = request.parameters.size, "render");
        }

        if now % 30_000 == 0 {
            let stats = page.stats();
            println!(
                "[{now:>6} ms] {:?}: shards={} cats={} stability={}%",
                page.connection_state(),
                stats.shards,
                stats.cats,
                stats.stability
            );
        }
    }

    page.observe(PageEvent::Request(Request::StatsQuery));
    page.advance_to(END_MS);
    for response in page.drain_responses() {
        println!("stats query -> {}", serde_json::to_string(&response)?);
    }

    let snapshot = page.capture_snapshot();
    snapshot.verify()?;
    println!();
    println!("rendered:        {rendered}");
    println!("channel:         {:?}", page.channel_state());
    println!("background seen: {:?}", background.borrow().latest_report().map(|r| r.timestamp));
    println!("state hash:      {}", snapshot.hash);

    page.health()?;
    page.teardown();
    Ok(())
}
