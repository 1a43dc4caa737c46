//! End-to-end connection scenarios: a page runtime talking to a background
//! coordinator over a loopback channel whose link can be broken and healed.

use std::cell::RefCell;
use std::rc::Rc;

use catfield_engine::prelude::*;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    background: Rc<RefCell<BackgroundCoordinator>>,
    link: LinkControl,
    page: PageRuntime<LoopbackChannel, HostHandle>,
    host: HostHandle,
}

fn harness() -> Harness {
    let background = BackgroundCoordinator::shared(
        Box::new(MemoryStore::new()),
        BackgroundConfig::default(),
        0,
    );
    let (channel, link) = LoopbackChannel::new(background.clone());
    let host = HostHandle::new();
    let page = PageRuntime::new(
        "tab-7",
        "example.org",
        EngineConfig::default(),
        99,
        &MemoryStore::new(),
        channel,
        host.clone(),
    )
    .unwrap();
    Harness {
        background,
        link,
        page,
        host,
    }
}

/// Advance in 1 s steps, recording every connection state change.
fn trace_states(h: &mut Harness, until: u64) -> Vec<(u64, ConnectionState)> {
    let mut out = vec![(h.page.now_ms(), h.page.connection_state())];
    let mut t = h.page.now_ms();
    while t < until {
        t += 1_000;
        h.page.advance_to(t);
        let state = h.page.connection_state();
        if out.last().map(|(_, s)| *s) != Some(state) {
            out.push((t, state));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// 1. Happy path
// ---------------------------------------------------------------------------

#[test]
fn connects_and_reports() {
    let mut h = harness();
    h.page.start();
    h.page.advance_to(2_000);
    assert_eq!(h.page.connection_state(), ConnectionState::Connected);
    assert_eq!(h.background.borrow().probes_answered(), 1);

    // Next heartbeat carries a ready report.
    h.page.advance_to(4_000);
    let bg = h.background.borrow();
    let report = bg.report_for("tab-7").unwrap();
    assert_eq!(report.timestamp, 4_000);
    assert_eq!(report.coherence_percent, 92);
    assert_eq!(report.active_entity_count, 0);
}

#[test]
fn heartbeat_cadence_is_two_seconds() {
    let mut h = harness();
    h.page.start();
    h.page.advance_to(20_000);
    assert_eq!(h.link.sends(), 10);
    assert_eq!(
        h.page.scheduler().fire_count(TimerKind::Heartbeat),
        10
    );
}

// ---------------------------------------------------------------------------
// 2. Always-failing channel
// ---------------------------------------------------------------------------

#[test]
fn always_timeout_walks_the_full_budget() {
    let mut h = harness();
    h.link.fail_with(ChannelError::Timeout { waited_ms: 1_000 });
    h.page.start();

    let states = trace_states(&mut h, 60_000);
    assert_eq!(
        states,
        vec![
            (0, ConnectionState::Connecting),
            (6_000, ConnectionState::Disconnected),
            (11_000, ConnectionState::Connecting),
            (17_000, ConnectionState::Disconnected),
            (22_000, ConnectionState::Connecting),
            (28_000, ConnectionState::Disconnected),
            (33_000, ConnectionState::Connecting),
            (39_000, ConnectionState::PermanentlyDisabled),
        ]
    );
    assert_eq!(h.link.sends(), 12);
    assert_eq!(h.page.channel_state().recovery_attempts, 3);
    assert!(!h.page.is_manifesting());
    assert!(h.page.health().is_err());
}

#[test]
fn no_listener_keeps_trying_forever() {
    let mut h = harness();
    h.link.fail_with(ChannelError::NoListener);
    h.page.start();
    h.page.advance_to(120_000);
    assert_eq!(h.page.connection_state(), ConnectionState::Connecting);
    assert_eq!(h.page.channel_state().consecutive_failures, 0);
    assert_eq!(h.link.sends(), 60);
    assert!(h.page.is_manifesting());
}

// ---------------------------------------------------------------------------
// 3. Transient outages
// ---------------------------------------------------------------------------

#[test]
fn two_failures_do_not_disconnect() {
    let mut h = harness();
    h.page.start();
    h.page.advance_to(2_000);
    h.link.fail_times(2, ChannelError::Closed);
    h.page.advance_to(6_000);
    assert_eq!(h.page.connection_state(), ConnectionState::Connected);
    assert_eq!(h.page.channel_state().consecutive_failures, 2);
    h.page.advance_to(8_000);
    assert_eq!(h.page.channel_state().consecutive_failures, 0);
}

#[test]
fn outage_then_recovery_reconnects() {
    let mut h = harness();
    h.page.start();
    h.page.advance_to(2_000);
    h.link.fail_with(ChannelError::Timeout { waited_ms: 500 });
    h.page.advance_to(8_000);
    assert_eq!(h.page.connection_state(), ConnectionState::Disconnected);
    assert!(h.page.scheduler().is_scheduled(TimerKind::Recovery));
    assert_eq!(h.page.scheduler().due_at(TimerKind::Recovery), Some(13_000));

    h.link.heal();
    h.page.advance_to(15_000);
    assert_eq!(h.page.connection_state(), ConnectionState::Connected);
    assert_eq!(h.page.channel_state(), ChannelState {
        connected: true,
        consecutive_failures: 0,
        recovery_attempts: 0,
    });
}

#[test]
fn manual_handshake_cuts_recovery_short() {
    let mut h = harness();
    h.page.start();
    h.link.fail_with(ChannelError::Closed);
    h.page.advance_to(7_000);
    assert_eq!(h.page.connection_state(), ConnectionState::Disconnected);

    h.link.heal();
    h.page.handshake();
    assert_eq!(h.page.connection_state(), ConnectionState::Connected);
    assert!(!h.page.scheduler().is_scheduled(TimerKind::Recovery));
    assert!(h.page.scheduler().is_scheduled(TimerKind::Heartbeat));
}

// ---------------------------------------------------------------------------
// 4. Context invalidation
// ---------------------------------------------------------------------------

#[test]
fn invalidation_forces_disconnect_then_recovers() {
    let mut h = harness();
    h.page.start();
    h.page.advance_to(4_000);
    assert_eq!(h.page.connection_state(), ConnectionState::Connected);

    h.host.invalidate();
    h.page.advance_to(6_000);
    assert_eq!(h.page.connection_state(), ConnectionState::Disconnected);
    assert_eq!(h.page.channel_state().consecutive_failures, 0);

    h.host.revive();
    h.page.advance_to(11_000);
    assert_eq!(h.page.connection_state(), ConnectionState::Connecting);
    h.page.advance_to(13_000);
    assert_eq!(h.page.connection_state(), ConnectionState::Connected);
}

#[test]
fn invalidated_send_is_not_counted() {
    let mut h = harness();
    h.page.start();
    h.page.advance_to(2_000);
    h.link.fail_with(ChannelError::ContextInvalidated);
    h.page.advance_to(4_000);
    assert_eq!(h.page.connection_state(), ConnectionState::Disconnected);
    assert_eq!(h.page.channel_state().consecutive_failures, 0);
    assert_eq!(h.page.scheduler().due_at(TimerKind::Recovery), Some(9_000));
}

// ---------------------------------------------------------------------------
// 5. Re-entry
// ---------------------------------------------------------------------------

#[test]
fn teardown_and_restart() {
    let mut h = harness();
    h.page.start();
    h.page.advance_to(4_000);
    h.page.teardown();
    let sends = h.link.sends();
    h.page.advance_to(20_000);
    assert_eq!(h.link.sends(), sends);

    h.page.start();
    h.page.advance_to(22_000);
    assert_eq!(h.page.connection_state(), ConnectionState::Connected);
}
