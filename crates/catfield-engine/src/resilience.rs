//! Connection resilience between a page and its background context.
//!
//! ## Protocol
//!
//! A page starts in [`ConnectionState::Disconnected`]. [`start`] moves it to
//! `Connecting` and asks for a heartbeat timer. Every heartbeat then either
//! probes the background (while `Connecting`) or sends a ready report (while
//! `Connected`).
//!
//! 1. A pong moves the page to `Connected` and clears both counters.
//! 2. Counted failures accumulate. At the threshold the page drops to
//!    `Disconnected` and a recovery is scheduled.
//! 3. A recovery bumps `recovery_attempts` and begins a fresh cycle.
//! 4. When a cycle fails with the recovery budget spent, the protocol enters
//!    `PermanentlyDisabled` and asks the page to halt. Only [`reset`] leaves
//!    that state.
//!
//! The protocol owns no timers. Each transition returns the
//! [`ProtocolAction`]s the caller applies to its scheduler.
//!
//! [`start`]: ResilienceProtocol::start
//! [`reset`]: ResilienceProtocol::reset

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::channel::{HostContext, MessageChannel};
use crate::messages::{ReadyReport, Request};
use crate::{ChannelError, FailureClass};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Resilience timing and budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Interval between heartbeats.
    pub heartbeat_interval_ms: u64,
    /// Consecutive counted failures that end a cycle.
    pub failure_threshold: u32,
    /// Delay between a failed cycle and the next recovery attempt.
    pub recovery_delay_ms: u64,
    /// Recovery attempts allowed before giving up for good.
    pub max_recovery_attempts: u32,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 2_000,
            failure_threshold: 3,
            recovery_delay_ms: 5_000,
            max_recovery_attempts: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Where the page stands with its background context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal until the page is re-entered.
    PermanentlyDisabled,
}

/// Counters exposed for reporting and snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelState {
    pub connected: bool,
    pub consecutive_failures: u32,
    pub recovery_attempts: u32,
}

/// Timer changes requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolAction {
    /// (Re)start the heartbeat interval.
    StartHeartbeat { interval_ms: u64 },
    StopHeartbeat,
    /// Arm the one-shot recovery timer.
    ScheduleRecovery { delay_ms: u64 },
    CancelRecovery,
    /// Recovery is exhausted: stop manifesting and stop all connection work.
    Halt,
}

// ---------------------------------------------------------------------------
// ResilienceProtocol
// ---------------------------------------------------------------------------

/// The page-side connection state machine.
#[derive(Debug, Clone)]
pub struct ResilienceProtocol {
    config: ResilienceConfig,
    state: ConnectionState,
    consecutive_failures: u32,
    recovery_attempts: u32,
    recovery_pending: bool,
    last_transition_ms: u64,
}

impl ResilienceProtocol {
    /// Create a disconnected protocol.
    ///
    /// # Panics
    ///
    /// Panics if the heartbeat interval or the failure threshold is zero.
    pub fn new(config: ResilienceConfig) -> Self {
        assert!(
            config.heartbeat_interval_ms > 0,
            "heartbeat interval must be positive"
        );
        assert!(
            config.failure_threshold > 0,
            "failure threshold must be positive"
        );
        Self {
            config,
            state: ConnectionState::Disconnected,
            consecutive_failures: 0,
            recovery_attempts: 0,
            recovery_pending: false,
            last_transition_ms: 0,
        }
    }

    /// Begin the first connection cycle.
    pub fn start(&mut self, host: &dyn HostContext, now_ms: u64) -> Vec<ProtocolAction> {
        if self.is_halted() {
            return Vec::new();
        }
        if !host.is_alive() {
            return self.context_invalidated(now_ms);
        }
        self.begin_cycle(now_ms)
    }

    /// Handle one heartbeat timer firing.
    ///
    /// `report` is only sent while connected; while connecting the heartbeat
    /// carries a liveness probe instead.
    pub fn on_heartbeat<C: MessageChannel + ?Sized>(
        &mut self,
        channel: &mut C,
        host: &dyn HostContext,
        report: ReadyReport,
        now_ms: u64,
    ) -> Vec<ProtocolAction> {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::PermanentlyDisabled => {
                return Vec::new();
            }
            ConnectionState::Connecting | ConnectionState::Connected => {}
        }
        if !host.is_alive() {
            return self.context_invalidated(now_ms);
        }

        if self.state == ConnectionState::Connecting {
            let request = Request::LivenessProbe { timestamp: now_ms };
            return match channel.send(&request) {
                Ok(reply) if reply.is_pong_for(now_ms) => {
                    self.on_success(now_ms);
                    Vec::new()
                }
                Ok(reply) => {
                    let err = ChannelError::Codec(format!("expected pong, got {reply:?}"));
                    self.on_failure(err, now_ms)
                }
                Err(err) => self.on_failure(err, now_ms),
            };
        }

        match channel.send(&Request::Heartbeat(report)) {
            Ok(_) => {
                self.consecutive_failures = 0;
                Vec::new()
            }
            Err(err) => self.on_failure(err, now_ms),
        }
    }

    /// Probe the background once, outside the heartbeat cadence.
    ///
    /// From `Disconnected` a success connects immediately and starts the
    /// heartbeat; a counted failure only bumps the failure count. From
    /// `Connecting` a failure counts toward the cycle threshold as usual.
    pub fn handshake<C: MessageChannel + ?Sized>(
        &mut self,
        channel: &mut C,
        host: &dyn HostContext,
        now_ms: u64,
    ) -> Vec<ProtocolAction> {
        match self.state {
            ConnectionState::Connected | ConnectionState::PermanentlyDisabled => {
                return Vec::new();
            }
            ConnectionState::Disconnected | ConnectionState::Connecting => {}
        }
        if !host.is_alive() {
            return self.context_invalidated(now_ms);
        }

        let was_connecting = self.state == ConnectionState::Connecting;
        let result = channel.send(&Request::LivenessProbe { timestamp: now_ms });
        match result {
            Ok(reply) if reply.is_pong_for(now_ms) => {
                self.on_success(now_ms);
                let mut actions = Vec::new();
                if self.recovery_pending {
                    self.recovery_pending = false;
                    actions.push(ProtocolAction::CancelRecovery);
                }
                if !was_connecting {
                    actions.push(ProtocolAction::StartHeartbeat {
                        interval_ms: self.config.heartbeat_interval_ms,
                    });
                }
                actions
            }
            Ok(reply) if was_connecting => self.on_failure(
                ChannelError::Codec(format!("expected pong, got {reply:?}")),
                now_ms,
            ),
            Err(err) if was_connecting => self.on_failure(err, now_ms),
            Ok(_) => {
                self.consecutive_failures += 1;
                Vec::new()
            }
            Err(err) => match err.classify() {
                FailureClass::Ignored => Vec::new(),
                FailureClass::Counted => {
                    debug!(error = %err, "handshake failed while disconnected");
                    self.consecutive_failures += 1;
                    Vec::new()
                }
                FailureClass::ContextInvalid => self.context_invalidated(now_ms),
            },
        }
    }

    /// Handle the recovery timer firing.
    pub fn on_recovery(&mut self, host: &dyn HostContext, now_ms: u64) -> Vec<ProtocolAction> {
        self.recovery_pending = false;
        if self.state != ConnectionState::Disconnected {
            return Vec::new();
        }
        self.recovery_attempts += 1;
        info!(
            attempt = self.recovery_attempts,
            max = self.config.max_recovery_attempts,
            "attempting connection recovery"
        );
        if !host.is_alive() {
            return self.context_invalidated(now_ms);
        }
        self.begin_cycle(now_ms)
    }

    /// The hosting context went away. Forces `Disconnected` without counting
    /// a failure and schedules recovery if any budget is left.
    pub fn context_invalidated(&mut self, now_ms: u64) -> Vec<ProtocolAction> {
        if self.is_halted() {
            return Vec::new();
        }
        if self.state == ConnectionState::Disconnected && self.recovery_pending {
            return Vec::new();
        }
        warn!(state = ?self.state, "host context invalidated");
        self.consecutive_failures = 0;
        self.transition(ConnectionState::Disconnected, now_ms);
        let mut actions = vec![ProtocolAction::StopHeartbeat];
        actions.extend(self.schedule_recovery_or_halt(now_ms));
        actions
    }

    /// Forget everything and return to a fresh `Disconnected` state.
    pub fn reset(&mut self) -> Vec<ProtocolAction> {
        self.state = ConnectionState::Disconnected;
        self.consecutive_failures = 0;
        self.recovery_attempts = 0;
        self.recovery_pending = false;
        vec![ProtocolAction::StopHeartbeat, ProtocolAction::CancelRecovery]
    }

    // -- accessors ----------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn channel_state(&self) -> ChannelState {
        ChannelState {
            connected: self.state == ConnectionState::Connected,
            consecutive_failures: self.consecutive_failures,
            recovery_attempts: self.recovery_attempts,
        }
    }

    /// `false` once recovery is exhausted.
    pub fn is_operational(&self) -> bool {
        !self.is_halted()
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// When the state last changed.
    pub fn last_transition_ms(&self) -> u64 {
        self.last_transition_ms
    }

    // -- transitions --------------------------------------------------------

    fn is_halted(&self) -> bool {
        self.state == ConnectionState::PermanentlyDisabled
    }

    fn begin_cycle(&mut self, now_ms: u64) -> Vec<ProtocolAction> {
        self.consecutive_failures = 0;
        self.transition(ConnectionState::Connecting, now_ms);
        let mut actions = Vec::with_capacity(2);
        if self.recovery_pending {
            self.recovery_pending = false;
            actions.push(ProtocolAction::CancelRecovery);
        }
        actions.push(ProtocolAction::StartHeartbeat {
            interval_ms: self.config.heartbeat_interval_ms,
        });
        actions
    }

    fn on_success(&mut self, now_ms: u64) {
        self.consecutive_failures = 0;
        self.recovery_attempts = 0;
        self.transition(ConnectionState::Connected, now_ms);
    }

    fn on_failure(&mut self, err: ChannelError, now_ms: u64) -> Vec<ProtocolAction> {
        match err.classify() {
            FailureClass::Ignored => {
                debug!(error = %err, "no listener; failure not counted");
                Vec::new()
            }
            FailureClass::ContextInvalid => self.context_invalidated(now_ms),
            FailureClass::Counted => {
                self.consecutive_failures += 1;
                warn!(
                    error = %err,
                    failures = self.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "heartbeat failed"
                );
                if self.consecutive_failures < self.config.failure_threshold {
                    return Vec::new();
                }
                self.transition(ConnectionState::Disconnected, now_ms);
                let mut actions = vec![ProtocolAction::StopHeartbeat];
                actions.extend(self.schedule_recovery_or_halt(now_ms));
                actions
            }
        }
    }

    fn schedule_recovery_or_halt(&mut self, now_ms: u64) -> Vec<ProtocolAction> {
        if self.recovery_attempts < self.config.max_recovery_attempts {
            self.recovery_pending = true;
            debug!(
                delay_ms = self.config.recovery_delay_ms,
                attempts = self.recovery_attempts,
                "recovery scheduled"
            );
            return vec![ProtocolAction::ScheduleRecovery {
                delay_ms: self.config.recovery_delay_ms,
            }];
        }
        let exhausted = crate::EngineError::ExhaustedRecovery {
            attempts: self.recovery_attempts,
        };
        error!(error = %exhausted, "giving up on background connection");
        self.transition(ConnectionState::PermanentlyDisabled, now_ms);
        vec![ProtocolAction::CancelRecovery, ProtocolAction::Halt]
    }

    fn transition(&mut self, to: ConnectionState, now_ms: u64) {
        if self.state != to {
            info!(from = ?self.state, to = ?to, now_ms, "connection state changed");
            self.state = to;
            self.last_transition_ms = now_ms;
        }
    }
}

impl Default for ResilienceProtocol {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
