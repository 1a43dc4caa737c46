//! The per-page runtime.
//!
//! A [`PageRuntime`] owns everything one page context needs: the decay model,
//! the entity registry, the admission controller, the resilience protocol and
//! the scheduler that drives them. Host callbacks become [`PageEvent`]s on the
//! scheduler's queue, so activity, maintenance and heartbeats are handled one
//! at a time in timestamp order.
//!
//! # Lifecycle
//!
//! 1. [`PageRuntime::new`] refuses blacklisted hosts and seeds the decay
//!    model from the store.
//! 2. [`start`](PageRuntime::start) arms maintenance and begins connecting.
//! 3. The host feeds [`observe`](PageRuntime::observe) and calls
//!    [`advance_to`](PageRuntime::advance_to) as its clock moves.
//! 4. Admitted manifestations are collected with
//!    [`drain_render_requests`](PageRuntime::drain_render_requests).
//! 5. [`teardown`](PageRuntime::teardown) on navigation. Re-entering a page
//!    builds a fresh runtime.

use catfield_core::admission::{
    ActivityEvent, AdmissionController, AdmissionOutcome, RenderRequest,
};
use catfield_core::decay::{DecayModel, ParameterUpdate, QuantumParameters};
use catfield_core::registry::EntityRegistry;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use tracing::{debug, info, warn};

use crate::channel::{HostContext, MessageChannel};
use crate::config::EngineConfig;
use crate::messages::{ReadyReport, Request, Response, StatsReport};
use crate::resilience::{ChannelState, ConnectionState, ProtocolAction, ResilienceProtocol};
use crate::scheduler::{Due, Scheduler, TimerKind};
use crate::store::{self, KeyValueStore};
use crate::EngineError;

// ---------------------------------------------------------------------------
// PageEvent
// ---------------------------------------------------------------------------

/// Inbound occurrences a host hands to the page.
#[derive(Debug, Clone, PartialEq)]
pub enum PageEvent {
    /// A DOM mutation or media load.
    Activity(ActivityEvent),
    /// A message from the background or the UI.
    Request(Request),
}

// ---------------------------------------------------------------------------
// PageRuntime
// ---------------------------------------------------------------------------

/// One page context, end to end.
pub struct PageRuntime<C: MessageChannel, H: HostContext> {
    page_id: String,
    host_domain: String,
    config: EngineConfig,
    /// `None` once recovery is exhausted; admission then rejects everything.
    field: Option<DecayModel>,
    registry: EntityRegistry,
    admission: AdmissionController,
    protocol: ResilienceProtocol,
    scheduler: Scheduler<PageEvent>,
    channel: C,
    host: H,
    outbox: Vec<RenderRequest>,
    responses: Vec<Response>,
    started: bool,
}

impl<C: MessageChannel, H: HostContext> PageRuntime<C, H> {
    /// Build a runtime for `host_domain`.
    ///
    /// The decay model starts from the parameters in `store` when they
    /// decode, and from `config.decay.initial` otherwise. `seed` fixes every
    /// random draw the page makes.
    ///
    /// # Errors
    ///
    /// [`EngineError::Blacklisted`] if the host is on the blacklist (the
    /// stored override wins over `config.blacklist`), and
    /// [`EngineError::Config`] if the configuration does not validate.
    pub fn new(
        page_id: impl Into<String>,
        host_domain: &str,
        config: EngineConfig,
        seed: u64,
        store: &dyn KeyValueStore,
        channel: C,
        host: H,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let blacklist = config.blacklist.clone().from_store_or(store);
        if blacklist.is_blocked(host_domain) {
            info!(host = host_domain, "host is blacklisted; not starting");
            return Err(EngineError::Blacklisted {
                host: host_domain.to_owned(),
            });
        }

        let initial = store::load_parameters(store, config.decay.initial)
            .unwrap_or(config.decay.initial);

        let mut seeder = Pcg64::seed_from_u64(seed);
        let field_seed: u64 = seeder.gen();
        let admission_seed: u64 = seeder.gen();

        let field = DecayModel::with_parameters(config.decay.clone(), initial, field_seed);
        let registry = EntityRegistry::new(config.registry.clone());
        let admission = AdmissionController::new(config.admission.clone(), admission_seed);
        let protocol = ResilienceProtocol::new(config.resilience.clone());

        let page_id = page_id.into();
        debug!(page = %page_id, host = host_domain, seed, coherence = initial.coherence, "page runtime created");

        Ok(Self {
            page_id,
            host_domain: host_domain.to_owned(),
            config,
            field: Some(field),
            registry,
            admission,
            protocol,
            scheduler: Scheduler::new(0),
            channel,
            host,
            outbox: Vec::new(),
            responses: Vec::new(),
            started: false,
        })
    }

    /// [`new`](Self::new) with a seed drawn from the thread RNG.
    pub fn from_entropy(
        page_id: impl Into<String>,
        host_domain: &str,
        config: EngineConfig,
        store: &dyn KeyValueStore,
        channel: C,
        host: H,
    ) -> Result<Self, EngineError> {
        let seed: u64 = rand::random();
        Self::new(page_id, host_domain, config, seed, store, channel, host)
    }

    /// Arm maintenance and begin the first connection cycle.
    ///
    /// Calling this again tears every timer down first, so repeated starts
    /// never stack intervals.
    pub fn start(&mut self) {
        self.scheduler.cancel_all();
        self.scheduler
            .start_interval(TimerKind::Maintenance, self.config.maintenance_interval_ms);
        let now = self.scheduler.now_ms();
        let actions = self.protocol.start(&self.host, now);
        self.apply(actions);
        self.started = true;
        info!(page = %self.page_id, now_ms = now, "page runtime started");
    }

    /// Queue an inbound event. Activity is stamped with its own timestamp;
    /// requests are delivered at the current time.
    pub fn observe(&mut self, event: PageEvent) {
        let at = match &event {
            PageEvent::Activity(ev) => ev.timestamp_ms,
            PageEvent::Request(_) => self.scheduler.now_ms(),
        };
        self.scheduler.enqueue(at, event);
    }

    /// Process everything due up to `until_ms`, one occurrence at a time.
    pub fn advance_to(&mut self, until_ms: u64) {
        while let Some(due) = self.scheduler.pop_due(until_ms) {
            let now = self.scheduler.now_ms();
            match due {
                Due::Timer(TimerKind::Maintenance) => self.maintain(now),
                Due::Timer(TimerKind::Heartbeat) => self.heartbeat(now),
                Due::Timer(TimerKind::Recovery) => {
                    let actions = self.protocol.on_recovery(&self.host, now);
                    self.apply(actions);
                }
                Due::Timer(TimerKind::StoredDecay) => {}
                Due::Event(PageEvent::Activity(ev)) => self.on_activity(ev, now),
                Due::Event(PageEvent::Request(req)) => {
                    if let Some(resp) = self.handle_request(&req) {
                        self.responses.push(resp);
                    }
                }
            }
        }
    }

    /// Answer a request immediately.
    ///
    /// Stats queries and probes are answered; overrides are applied to the
    /// decay model and need no answer. Nothing is answered or applied once the
    /// host context is gone.
    pub fn handle_request(&mut self, request: &Request) -> Option<Response> {
        let now = self.scheduler.now_ms();
        if self.host_lost(now) {
            debug!(page = %self.page_id, "dropping request from invalidated context");
            return None;
        }
        match request {
            Request::StatsQuery => Some(Response::Stats(self.stats())),
            Request::LivenessProbe { timestamp } => Some(Response::Pong {
                pong: true,
                timestamp: *timestamp,
            }),
            Request::ParameterOverride {
                parameter_name,
                value,
            } => {
                match ParameterUpdate::from_override(parameter_name, value) {
                    Ok(update) if update.is_empty() => {
                        warn!(parameter = %parameter_name, %value, "ignoring non-numeric override");
                    }
                    Ok(update) => {
                        if let Some(field) = self.field.as_mut() {
                            field.update(update, now);
                            debug!(parameter = %parameter_name, params = ?field.parameters(), "override applied");
                        }
                    }
                    Err(e) => warn!(error = %e, "ignoring override"),
                }
                None
            }
            Request::Heartbeat(_) => {
                debug!("page ignoring ready report");
                None
            }
        }
    }

    /// Probe the background right now instead of waiting for a heartbeat.
    pub fn handshake(&mut self) {
        let now = self.scheduler.now_ms();
        let actions = self.protocol.handshake(&mut self.channel, &self.host, now);
        self.apply(actions);
    }

    /// Cancel every timer and reset the connection. Queued events stay
    /// queued but nothing will fire until [`start`](Self::start).
    pub fn teardown(&mut self) {
        self.scheduler.cancel_all();
        let actions = self.protocol.reset();
        self.apply(actions);
        self.started = false;
        info!(page = %self.page_id, "page runtime torn down");
    }

    /// The ready report for the current time.
    pub fn report(&mut self) -> ReadyReport {
        let now = self.scheduler.now_ms();
        ReadyReport {
            active_entity_count: saturating_u32(self.registry.count() as u64),
            coherence_percent: self.coherence_percent(),
            recent_activity_count: saturating_u32(
                self.admission.recent_activity_count(now) as u64
            ),
            page: self.page_id.clone(),
            timestamp: now,
            total_manifested: self.registry.total_registered(),
        }
    }

    /// Live entities, lifetime total and coherence percentage.
    pub fn stats(&self) -> StatsReport {
        StatsReport {
            shards: saturating_u32(self.registry.count() as u64),
            cats: saturating_u32(self.registry.total_registered()),
            stability: self.coherence_percent(),
        }
    }

    /// Take the manifestations admitted since the last drain.
    pub fn drain_render_requests(&mut self) -> Vec<RenderRequest> {
        std::mem::take(&mut self.outbox)
    }

    /// Take the responses produced for queued requests.
    pub fn drain_responses(&mut self) -> Vec<Response> {
        std::mem::take(&mut self.responses)
    }

    /// `Err` once the connection is permanently disabled.
    pub fn health(&self) -> Result<(), EngineError> {
        if self.protocol.is_operational() {
            Ok(())
        } else {
            Err(EngineError::ExhaustedRecovery {
                attempts: self.protocol.channel_state().recovery_attempts,
            })
        }
    }

    // -- accessors ----------------------------------------------------------

    pub fn page_id(&self) -> &str {
        &self.page_id
    }

    pub fn host_domain(&self) -> &str {
        &self.host_domain
    }

    pub fn now_ms(&self) -> u64 {
        self.scheduler.now_ms()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.protocol.state()
    }

    pub fn channel_state(&self) -> ChannelState {
        self.protocol.channel_state()
    }

    /// Current field parameters, `None` once manifestation has halted.
    pub fn parameters(&self) -> Option<QuantumParameters> {
        self.field.as_ref().map(DecayModel::parameters)
    }

    /// Whether new activity can still manifest.
    pub fn is_manifesting(&self) -> bool {
        self.field.is_some()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn scheduler(&self) -> &Scheduler<PageEvent> {
        &self.scheduler
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -- handlers -----------------------------------------------------------

    fn maintain(&mut self, now: u64) {
        let coherence = self.field.as_mut().map(|f| f.tick(now));
        let evicted = self.registry.evict_stale(now);
        let released = self.admission.release_evicted(&self.registry);
        debug!(
            now_ms = now,
            ?coherence,
            evicted,
            released,
            live = self.registry.count(),
            "maintenance pass"
        );
    }

    fn heartbeat(&mut self, now: u64) {
        let report = self.report();
        let actions = self
            .protocol
            .on_heartbeat(&mut self.channel, &self.host, report, now);
        self.apply(actions);
    }

    fn on_activity(&mut self, event: ActivityEvent, now: u64) {
        if self.host_lost(now) {
            return;
        }
        let outcome = self
            .admission
            .on_activity(&event, self.field.as_mut(), &mut self.registry);
        if let AdmissionOutcome::Admitted(request) = outcome {
            self.outbox.push(request);
        }
    }

    /// Whether the host context is gone. A running page also drops its
    /// connection; a torn-down page stays torn down.
    fn host_lost(&mut self, now: u64) -> bool {
        if self.host.is_alive() {
            return false;
        }
        if self.started {
            let actions = self.protocol.context_invalidated(now);
            self.apply(actions);
        }
        true
    }

    fn apply(&mut self, actions: Vec<ProtocolAction>) {
        for action in actions {
            match action {
                ProtocolAction::StartHeartbeat { interval_ms } => {
                    self.scheduler.start_interval(TimerKind::Heartbeat, interval_ms)
                }
                ProtocolAction::StopHeartbeat => {
                    self.scheduler.cancel(TimerKind::Heartbeat);
                }
                ProtocolAction::ScheduleRecovery { delay_ms } => {
                    self.scheduler.schedule_once(TimerKind::Recovery, delay_ms)
                }
                ProtocolAction::CancelRecovery => {
                    self.scheduler.cancel(TimerKind::Recovery);
                }
                ProtocolAction::Halt => {
                    self.scheduler.cancel(TimerKind::Heartbeat);
                    self.scheduler.cancel(TimerKind::Recovery);
                    if self.field.take().is_some() {
                        info!(page = %self.page_id, "manifestation halted");
                    }
                }
            }
        }
    }

    fn coherence_percent(&self) -> u8 {
        self.field.as_ref().map_or(0, DecayModel::coherence_percent)
    }
}

impl<C: MessageChannel, H: HostContext> std::fmt::Debug for PageRuntime<C, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRuntime")
            .field("page_id", &self.page_id)
            .field("now_ms", &self.scheduler.now_ms())
            .field("state", &self.protocol.state())
            .field("entities", &self.registry.count())
            .finish()
    }
}

fn saturating_u32(n: u64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
