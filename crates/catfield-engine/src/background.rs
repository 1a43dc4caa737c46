//! The persistent background context.
//!
//! One coordinator serves every page. It answers liveness probes, keeps the
//! latest ready report per page until that page goes quiet, applies parameter overrides to the store and
//! slowly decays the stored coherence so that fresh pages start a little less
//! coherent than the last.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use catfield_core::decay::{ParameterUpdate, QuantumParameters};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::messages::{ReadyReport, Request, Response, StatsReport};
use crate::scheduler::{Due, Scheduler, TimerKind};
use crate::store::{self, KeyValueStore};
use crate::{ChannelError, EngineError};

// ---------------------------------------------------------------------------
// BackgroundConfig
// ---------------------------------------------------------------------------

/// Stored-state decay and report retention settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    pub stored_decay_interval_ms: u64,
    pub stored_decay_factor: f64,
    pub coherence_floor: f64,
    /// Reports not refreshed for longer than this are dropped.
    pub report_ttl_ms: u64,
    /// What `on_installed` writes to the store.
    pub initial: QuantumParameters,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            stored_decay_interval_ms: 60_000,
            stored_decay_factor: 0.99,
            coherence_floor: 0.3,
            report_ttl_ms: 120_000,
            initial: QuantumParameters::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// BackgroundCoordinator
// ---------------------------------------------------------------------------

/// A ready report and the background time it arrived at.
#[derive(Debug, Clone)]
struct PageRecord {
    received_ms: u64,
    report: ReadyReport,
}

/// Background-side message handler and stored-state keeper.
pub struct BackgroundCoordinator {
    config: BackgroundConfig,
    store: Box<dyn KeyValueStore>,
    scheduler: Scheduler<()>,
    reports: BTreeMap<String, PageRecord>,
    last_reporter: Option<String>,
    probes_answered: u64,
}

impl BackgroundCoordinator {
    /// Create a coordinator whose clock starts at `now_ms`. The stored decay
    /// interval starts immediately.
    pub fn new(store: Box<dyn KeyValueStore>, config: BackgroundConfig, now_ms: u64) -> Self {
        let mut scheduler = Scheduler::new(now_ms);
        scheduler.start_interval(TimerKind::StoredDecay, config.stored_decay_interval_ms);
        Self {
            config,
            store,
            scheduler,
            reports: BTreeMap::new(),
            last_reporter: None,
            probes_answered: 0,
        }
    }

    /// [`new`](Self::new) behind a shared handle, for channels.
    pub fn shared(
        store: Box<dyn KeyValueStore>,
        config: BackgroundConfig,
        now_ms: u64,
    ) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::new(store, config, now_ms)))
    }

    /// First-install hook: seed the stored parameters.
    pub fn on_installed(&mut self) -> Result<(), EngineError> {
        info!(params = ?self.config.initial, "seeding stored field state");
        store::save_parameters(self.store.as_mut(), &self.config.initial)
    }

    /// Answer one request.
    pub fn handle(&mut self, request: &Request) -> Result<Response, ChannelError> {
        debug!(kind = request.kind(), "background received message");
        match request {
            Request::LivenessProbe { timestamp } => {
                self.probes_answered += 1;
                Ok(Response::Pong {
                    pong: true,
                    timestamp: *timestamp,
                })
            }
            Request::Heartbeat(report) => {
                self.last_reporter = Some(report.page.clone());
                self.reports.insert(
                    report.page.clone(),
                    PageRecord {
                        received_ms: self.scheduler.now_ms(),
                        report: report.clone(),
                    },
                );
                Ok(Response::acknowledged())
            }
            Request::StatsQuery => Ok(Response::Stats(self.stats())),
            Request::ParameterOverride {
                parameter_name,
                value,
            } => Ok(self.apply_override(parameter_name, value)),
        }
    }

    /// Answer one request given as JSON text.
    pub fn handle_json(&mut self, wire: &str) -> Result<String, ChannelError> {
        let request: Request =
            serde_json::from_str(wire).map_err(|e| ChannelError::Codec(e.to_string()))?;
        let response = self.handle(&request)?;
        serde_json::to_string(&response).map_err(|e| ChannelError::Codec(e.to_string()))
    }

    /// Run the background timeline up to `until_ms`, then drop reports from
    /// pages that have gone quiet.
    pub fn advance_to(&mut self, until_ms: u64) {
        while let Some(due) = self.scheduler.pop_due(until_ms) {
            match due {
                Due::Timer(TimerKind::StoredDecay) => self.decay_stored(),
                other => debug!(?other, "background ignoring occurrence"),
            }
        }
        self.prune_reports();
    }

    /// Stats as seen from the most recent ready report.
    pub fn stats(&self) -> StatsReport {
        self.latest_report()
            .map(|r| StatsReport {
                shards: r.active_entity_count,
                cats: u32::try_from(r.total_manifested).unwrap_or(u32::MAX),
                stability: r.coherence_percent,
            })
            .unwrap_or_default()
    }

    // -- accessors ----------------------------------------------------------

    /// The most recently received ready report.
    pub fn latest_report(&self) -> Option<&ReadyReport> {
        self.last_reporter
            .as_ref()
            .and_then(|page| self.report_for(page))
    }

    pub fn report_for(&self, page: &str) -> Option<&ReadyReport> {
        self.reports.get(page).map(|r| &r.report)
    }

    /// Number of pages with a retained report.
    pub fn tracked_pages(&self) -> usize {
        self.reports.len()
    }

    /// Stored parameters, if any decode.
    pub fn stored_parameters(&self) -> Option<QuantumParameters> {
        store::load_parameters(self.store.as_ref(), self.config.initial)
    }

    pub fn store(&self) -> &dyn KeyValueStore {
        self.store.as_ref()
    }

    pub fn probes_answered(&self) -> u64 {
        self.probes_answered
    }

    pub fn now_ms(&self) -> u64 {
        self.scheduler.now_ms()
    }

    // -- internals ----------------------------------------------------------

    fn prune_reports(&mut self) {
        let now = self.scheduler.now_ms();
        let ttl = self.config.report_ttl_ms;
        let before = self.reports.len();
        self.reports
            .retain(|_, r| now.saturating_sub(r.received_ms) <= ttl);
        let dropped = before - self.reports.len();
        if dropped > 0 {
            debug!(dropped, remaining = self.reports.len(), "dropped quiet page reports");
        }
        let reporter_gone = self
            .last_reporter
            .as_ref()
            .is_some_and(|page| !self.reports.contains_key(page));
        if reporter_gone {
            self.last_reporter = None;
        }
    }

    fn decay_stored(&mut self) {
        let Some(mut params) = self.stored_parameters() else {
            return;
        };
        params.coherence =
            (params.coherence * self.config.stored_decay_factor).max(self.config.coherence_floor);
        if let Err(e) = store::save_parameters(self.store.as_mut(), &params) {
            warn!(error = %e, "failed to persist decayed coherence");
            return;
        }
        debug!(coherence = params.coherence, "stored coherence decayed");
    }

    fn apply_override(&mut self, name: &str, value: &serde_json::Value) -> Response {
        let update = match ParameterUpdate::from_override(name, value) {
            Ok(u) if !u.is_empty() => u,
            Ok(_) => {
                warn!(parameter = name, %value, "ignoring non-numeric override");
                return ignored();
            }
            Err(e) => {
                warn!(error = %e, "ignoring override");
                return ignored();
            }
        };
        let mut params = self.stored_parameters().unwrap_or(self.config.initial);
        if let Some(c) = update.coherence.filter(|v| v.is_finite()) {
            params.coherence = c.clamp(self.config.coherence_floor, 1.0);
        }
        if let Some(p) = update.manifestation_probability.filter(|v| v.is_finite()) {
            params.manifestation_probability = p.clamp(0.0, 1.0);
        }
        if let Some(d) = update.reality_distortion.filter(|v| v.is_finite()) {
            params.reality_distortion = d.max(0.0);
        }
        match store::save_parameters(self.store.as_mut(), &params) {
            Ok(()) => Response::acknowledged(),
            Err(e) => {
                warn!(error = %e, "failed to persist override");
                ignored()
            }
        }
    }
}

fn ignored() -> Response {
    Response::Ack {
        status: "ignored".to_owned(),
    }
}

impl std::fmt::Debug for BackgroundCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundCoordinator")
            .field("now_ms", &self.scheduler.now_ms())
            .field("pages", &self.reports.len())
            .field("probes_answered", &self.probes_answered)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn coordinator() -> BackgroundCoordinator {
        BackgroundCoordinator::new(Box::new(MemoryStore::new()), BackgroundConfig::default(), 0)
    }

    fn report(page: &str, active: u32, coherence: u8, total: u64) -> ReadyReport {
        ReadyReport {
            active_entity_count: active,
            coherence_percent: coherence,
            recent_activity_count: 0,
            page: page.to_owned(),
            timestamp: 0,
            total_manifested: total,
        }
    }

    // -- 1. Install and stored decay ----------------------------------------

    #[test]
    fn install_seeds_defaults() {
        let mut bg = coordinator();
        assert_eq!(bg.stored_parameters(), None);
        bg.on_installed().unwrap();
        assert_eq!(bg.stored_parameters(), Some(QuantumParameters::default()));
    }

    #[test]
    fn stored_coherence_decays_every_minute() {
        let mut bg = coordinator();
        bg.on_installed().unwrap();
        bg.advance_to(59_999);
        assert_eq!(bg.stored_parameters().unwrap().coherence, 0.92);
        bg.advance_to(120_000);
        let c = bg.stored_parameters().unwrap().coherence;
        assert!((c - 0.92 * 0.99 * 0.99).abs() < 1e-12);
    }

    #[test]
    fn stored_coherence_floors() {
        let mut bg = coordinator();
        bg.on_installed().unwrap();
        // 0.92 * 0.99^n < 0.3 after ~112 minutes.
        bg.advance_to(200 * 60_000);
        assert_eq!(bg.stored_parameters().unwrap().coherence, 0.3);
    }

    #[test]
    fn decay_without_stored_state_is_noop() {
        let mut bg = coordinator();
        bg.advance_to(600_000);
        assert_eq!(bg.stored_parameters(), None);
        assert_eq!(bg.now_ms(), 600_000);
    }

    // -- 2. Messages --------------------------------------------------------

    #[test]
    fn probe_is_echoed() {
        let mut bg = coordinator();
        let reply = bg.handle(&Request::LivenessProbe { timestamp: 5 }).unwrap();
        assert!(reply.is_pong_for(5));
        assert_eq!(bg.probes_answered(), 1);
    }

    #[test]
    fn reports_are_kept_per_page() {
        let mut bg = coordinator();
        assert_eq!(bg.stats(), StatsReport::default());
        bg.handle(&Request::Heartbeat(report("a", 2, 80, 9))).unwrap();
        bg.handle(&Request::Heartbeat(report("b", 1, 40, 3))).unwrap();
        assert_eq!(bg.report_for("a").unwrap().active_entity_count, 2);
        assert_eq!(
            bg.stats(),
            StatsReport {
                shards: 1,
                cats: 3,
                stability: 40
            }
        );
    }

    #[test]
    fn quiet_pages_are_forgotten() {
        let mut bg = coordinator();
        for n in 0..10_000 {
            bg.handle(&Request::Heartbeat(report(&format!("tab-{n}"), 1, 90, 1)))
                .unwrap();
        }
        assert_eq!(bg.tracked_pages(), 10_000);

        bg.advance_to(100_000);
        bg.handle(&Request::Heartbeat(report("fresh", 4, 70, 6))).unwrap();
        bg.advance_to(120_000);
        assert_eq!(bg.tracked_pages(), 10_001, "exactly the ttl is retained");

        bg.advance_to(120_001);
        assert_eq!(bg.tracked_pages(), 1);
        assert!(bg.report_for("tab-0").is_none());
        assert_eq!(bg.latest_report().unwrap().page, "fresh");

        bg.advance_to(220_001);
        assert_eq!(bg.tracked_pages(), 0);
        assert!(bg.latest_report().is_none());
        assert_eq!(bg.stats(), StatsReport::default());
    }

    #[test]
    fn json_entry_point() {
        let mut bg = coordinator();
        let reply = bg.handle_json(r#"{"type":"ping","timestamp":3}"#).unwrap();
        assert_eq!(reply, r#"{"type":"pong","pong":true,"timestamp":3}"#);
        assert!(matches!(
            bg.handle_json(r#"{"type":"nonsense"}"#),
            Err(ChannelError::Codec(_))
        ));
    }

    // -- 3. Overrides -------------------------------------------------------

    #[test]
    fn override_writes_store() {
        let mut bg = coordinator();
        bg.on_installed().unwrap();
        let reply = bg
            .handle(&Request::ParameterOverride {
                parameter_name: "stability".to_owned(),
                value: json!(55),
            })
            .unwrap();
        assert_eq!(reply, Response::acknowledged());
        assert!((bg.stored_parameters().unwrap().coherence - 0.55).abs() < 1e-12);
    }

    #[test]
    fn bad_overrides_are_ignored() {
        let mut bg = coordinator();
        bg.on_installed().unwrap();
        for (name, value) in [("catDensity", json!(1)), ("coherence", json!("lots"))] {
            let reply = bg
                .handle(&Request::ParameterOverride {
                    parameter_name: name.to_owned(),
                    value,
                })
                .unwrap();
            assert_eq!(
                reply,
                Response::Ack {
                    status: "ignored".to_owned()
                }
            );
        }
        assert_eq!(bg.stored_parameters(), Some(QuantumParameters::default()));
    }
}
