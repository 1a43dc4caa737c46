//! Single cooperative timeline for one execution context.
//!
//! The [`Scheduler`] owns a virtual millisecond clock, a table of timers keyed
//! by [`TimerKind`] and a queue of inbound events. The owner drives it with
//! [`pop_due`](Scheduler::pop_due): every call yields the earliest due
//! occurrence and moves the clock to its timestamp. Occurrences are handed out
//! one at a time, so a handler always finishes before the next one starts and
//! nothing overlaps.
//!
//! At most one timer of each kind exists. Starting a timer of a kind that is
//! already scheduled tears the old one down first, so repeated initialisation
//! never accumulates duplicate intervals.
//!
//! # Example
//!
//! ```
//! use catfield_engine::scheduler::{Due, Scheduler, TimerKind};
//!
//! let mut scheduler: Scheduler<&str> = Scheduler::new(0);
//! scheduler.start_interval(TimerKind::Heartbeat, 2_000);
//! scheduler.enqueue(3_000, "mutation");
//!
//! let mut seen = Vec::new();
//! while let Some(due) = scheduler.pop_due(5_000) {
//!     seen.push(due);
//! }
//! assert_eq!(
//!     seen,
//!     vec![
//!         Due::Timer(TimerKind::Heartbeat),
//!         Due::Event("mutation"),
//!         Due::Timer(TimerKind::Heartbeat),
//!     ]
//! );
//! assert_eq!(scheduler.now_ms(), 5_000);
//! ```

use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// TimerKind
// ---------------------------------------------------------------------------

/// The kinds of timer a context runs. One slot per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    /// Decay tick plus stale-entity eviction.
    Maintenance,
    /// Liveness probe or ready report to the other context.
    Heartbeat,
    /// Delayed reconnection attempt.
    Recovery,
    /// Background-side decay of the stored coherence.
    StoredDecay,
}

// ---------------------------------------------------------------------------
// Due
// ---------------------------------------------------------------------------

/// One occurrence handed out by [`Scheduler::pop_due`].
#[derive(Debug, Clone, PartialEq)]
pub enum Due<E> {
    Timer(TimerKind),
    Event(E),
}

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Timer {
    due_ms: u64,
    /// `Some` for intervals, `None` for one-shots.
    period_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Virtual clock, timer table and inbound event queue.
#[derive(Debug)]
pub struct Scheduler<E> {
    now_ms: u64,
    timers: BTreeMap<TimerKind, Timer>,
    /// Keyed by `(timestamp, arrival sequence)` so equal timestamps stay FIFO.
    events: BTreeMap<(u64, u64), E>,
    next_event_seq: u64,
    fire_counts: BTreeMap<TimerKind, u64>,
}

impl<E> Scheduler<E> {
    /// Create a scheduler whose clock starts at `start_ms`.
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: start_ms,
            timers: BTreeMap::new(),
            events: BTreeMap::new(),
            next_event_seq: 0,
            fire_counts: BTreeMap::new(),
        }
    }

    /// Start a repeating timer firing every `period_ms`, first at
    /// `now + period_ms`. Replaces any timer of the same kind.
    ///
    /// # Panics
    ///
    /// Panics if `period_ms` is zero.
    pub fn start_interval(&mut self, kind: TimerKind, period_ms: u64) {
        assert!(period_ms > 0, "interval period must be positive, got {period_ms}");
        self.teardown_existing(kind);
        self.timers.insert(
            kind,
            Timer {
                due_ms: self.now_ms + period_ms,
                period_ms: Some(period_ms),
            },
        );
    }

    /// Schedule a single firing at `now + delay_ms`. Replaces any timer of
    /// the same kind.
    pub fn schedule_once(&mut self, kind: TimerKind, delay_ms: u64) {
        self.teardown_existing(kind);
        self.timers.insert(
            kind,
            Timer {
                due_ms: self.now_ms + delay_ms,
                period_ms: None,
            },
        );
    }

    /// Stop the timer of `kind`. Returns `true` if one was scheduled.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.timers.remove(&kind).is_some()
    }

    /// Stop every timer. Queued events are kept.
    pub fn cancel_all(&mut self) {
        if !self.timers.is_empty() {
            tracing::debug!(timers = self.timers.len(), "tearing down all timers");
        }
        self.timers.clear();
    }

    /// Queue an inbound event for `at_ms`. Events stamped in the past are
    /// delivered at the current time on the next [`pop_due`](Self::pop_due).
    pub fn enqueue(&mut self, at_ms: u64, event: E) {
        let seq = self.next_event_seq;
        self.next_event_seq += 1;
        self.events.insert((at_ms.max(self.now_ms), seq), event);
    }

    /// Yield the earliest occurrence due at or before `until_ms`, advancing
    /// the clock to it.
    ///
    /// Events win ties against timers. Intervals are re-armed one period
    /// after their due time, so if the clock jumps across several periods
    /// the missed firings are delivered one per call. When nothing is due
    /// the clock moves to `until_ms` and `None` is returned.
    pub fn pop_due(&mut self, until_ms: u64) -> Option<Due<E>> {
        let next_event = self.events.keys().next().copied();
        let next_timer = self
            .timers
            .iter()
            .map(|(kind, t)| (t.due_ms, *kind))
            .min();

        let take_event = match (next_event, next_timer) {
            (Some((ev_at, _)), Some((t_at, _))) => ev_at <= t_at,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => {
                self.now_ms = self.now_ms.max(until_ms);
                return None;
            }
        };

        if take_event {
            let key = next_event?;
            if key.0 > until_ms {
                self.now_ms = self.now_ms.max(until_ms);
                return None;
            }
            self.now_ms = self.now_ms.max(key.0);
            return self.events.remove(&key).map(Due::Event);
        }

        let (due_ms, kind) = next_timer?;
        if due_ms > until_ms {
            self.now_ms = self.now_ms.max(until_ms);
            return None;
        }
        self.now_ms = self.now_ms.max(due_ms);
        let rearm = self.timers.get(&kind).and_then(|t| t.period_ms);
        match rearm {
            Some(period) => {
                if let Some(t) = self.timers.get_mut(&kind) {
                    t.due_ms = due_ms + period;
                }
            }
            None => {
                self.timers.remove(&kind);
            }
        }
        *self.fire_counts.entry(kind).or_insert(0) += 1;
        tracing::trace!(?kind, now_ms = self.now_ms, "timer fired");
        Some(Due::Timer(kind))
    }

    // -- accessors ----------------------------------------------------------

    /// The current time on this timeline.
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Whether a timer of `kind` is scheduled.
    pub fn is_scheduled(&self, kind: TimerKind) -> bool {
        self.timers.contains_key(&kind)
    }

    /// When the timer of `kind` fires next.
    pub fn due_at(&self, kind: TimerKind) -> Option<u64> {
        self.timers.get(&kind).map(|t| t.due_ms)
    }

    /// How many times timers of `kind` have fired.
    pub fn fire_count(&self, kind: TimerKind) -> u64 {
        self.fire_counts.get(&kind).copied().unwrap_or(0)
    }

    /// Number of scheduled timers.
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Number of queued, undelivered events.
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    fn teardown_existing(&mut self, kind: TimerKind) {
        if self.timers.remove(&kind).is_some() {
            tracing::debug!(?kind, "tearing down existing timer before restart");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(s: &mut Scheduler<u32>, until: u64) -> Vec<(u64, Due<u32>)> {
        let mut out = Vec::new();
        while let Some(due) = s.pop_due(until) {
            out.push((s.now_ms(), due));
        }
        out
    }

    // -- 1. Construction ----------------------------------------------------

    #[test]
    fn new_scheduler_is_idle() {
        let s: Scheduler<u32> = Scheduler::new(500);
        assert_eq!(s.now_ms(), 500);
        assert_eq!(s.timer_count(), 0);
        assert_eq!(s.pending_events(), 0);
    }

    #[test]
    #[should_panic(expected = "interval period must be positive")]
    fn zero_period_panics() {
        let mut s: Scheduler<u32> = Scheduler::new(0);
        s.start_interval(TimerKind::Maintenance, 0);
    }

    // -- 2. Intervals -------------------------------------------------------

    #[test]
    fn interval_fires_on_period() {
        let mut s = Scheduler::new(0);
        s.start_interval(TimerKind::Heartbeat, 2_000);
        let fired = drain(&mut s, 7_000);
        let times: Vec<u64> = fired.iter().map(|(t, _)| *t).collect();
        assert_eq!(times, vec![2_000, 4_000, 6_000]);
        assert_eq!(s.now_ms(), 7_000);
        assert_eq!(s.fire_count(TimerKind::Heartbeat), 3);
        assert_eq!(s.due_at(TimerKind::Heartbeat), Some(8_000));
    }

    #[test]
    fn restarting_interval_replaces_old_one() {
        let mut s: Scheduler<u32> = Scheduler::new(0);
        s.start_interval(TimerKind::Heartbeat, 2_000);
        s.start_interval(TimerKind::Heartbeat, 2_000);
        s.start_interval(TimerKind::Heartbeat, 2_000);
        assert_eq!(s.timer_count(), 1);
        let fired = drain(&mut s, 2_000);
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn missed_periods_are_delivered_sequentially() {
        let mut s: Scheduler<u32> = Scheduler::new(0);
        s.start_interval(TimerKind::Maintenance, 30_000);
        let fired = drain(&mut s, 95_000);
        let times: Vec<u64> = fired.iter().map(|(t, _)| *t).collect();
        assert_eq!(times, vec![30_000, 60_000, 90_000]);
    }

    // -- 3. One-shots and cancellation -------------------------------------

    #[test]
    fn one_shot_fires_once() {
        let mut s: Scheduler<u32> = Scheduler::new(1_000);
        s.schedule_once(TimerKind::Recovery, 5_000);
        let fired = drain(&mut s, 100_000);
        assert_eq!(fired, vec![(6_000, Due::Timer(TimerKind::Recovery))]);
        assert!(!s.is_scheduled(TimerKind::Recovery));
    }

    #[test]
    fn cancel_stops_individual_kinds() {
        let mut s: Scheduler<u32> = Scheduler::new(0);
        s.start_interval(TimerKind::Heartbeat, 2_000);
        s.start_interval(TimerKind::Maintenance, 3_000);
        assert!(s.cancel(TimerKind::Heartbeat));
        assert!(!s.cancel(TimerKind::Heartbeat));
        let fired = drain(&mut s, 6_000);
        assert!(fired
            .iter()
            .all(|(_, d)| *d == Due::Timer(TimerKind::Maintenance)));
        assert_eq!(fired.len(), 2);
    }

    #[test]
    fn cancel_all_keeps_events() {
        let mut s: Scheduler<u32> = Scheduler::new(0);
        s.start_interval(TimerKind::Heartbeat, 2_000);
        s.enqueue(1_000, 7);
        s.cancel_all();
        assert_eq!(drain(&mut s, 10_000), vec![(1_000, Due::Event(7))]);
    }

    // -- 4. Events ----------------------------------------------------------

    #[test]
    fn events_interleave_with_timers_in_time_order() {
        let mut s = Scheduler::new(0);
        s.start_interval(TimerKind::Heartbeat, 2_000);
        s.enqueue(2_000, 1);
        s.enqueue(1_500, 2);
        s.enqueue(2_500, 3);
        let fired = drain(&mut s, 3_000);
        assert_eq!(
            fired,
            vec![
                (1_500, Due::Event(2)),
                (2_000, Due::Event(1)),
                (2_000, Due::Timer(TimerKind::Heartbeat)),
                (2_500, Due::Event(3)),
            ]
        );
    }

    #[test]
    fn past_events_are_delivered_now() {
        let mut s: Scheduler<u32> = Scheduler::new(10_000);
        s.enqueue(5, 9);
        assert_eq!(s.pop_due(10_000), Some(Due::Event(9)));
        assert_eq!(s.now_ms(), 10_000);
    }

    #[test]
    fn future_events_wait() {
        let mut s: Scheduler<u32> = Scheduler::new(0);
        s.enqueue(5_000, 1);
        assert_eq!(s.pop_due(4_999), None);
        assert_eq!(s.now_ms(), 4_999);
        assert_eq!(s.pending_events(), 1);
        assert_eq!(s.pop_due(5_000), Some(Due::Event(1)));
    }

    #[test]
    fn clock_never_moves_backwards() {
        let mut s: Scheduler<u32> = Scheduler::new(10_000);
        assert_eq!(s.pop_due(5_000), None);
        assert_eq!(s.now_ms(), 10_000);
    }
}
