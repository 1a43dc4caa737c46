//! Inter-context message formats.
//!
//! Every message is a flat, self-describing JSON record tagged by `type`.
//! Arrival order across distinct sends is not guaranteed, so each message
//! carries the full state its receiver needs: a ready report is a complete
//! snapshot, never a delta.
//!
//! Percentages appear only here. Internally every parameter is a fraction.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ReadyReport
// ---------------------------------------------------------------------------

/// Periodic page-to-background snapshot sent with every heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyReport {
    pub active_entity_count: u32,
    /// Coherence on a `0..=100` scale.
    pub coherence_percent: u8,
    /// Activity events observed in the recent window.
    pub recent_activity_count: u32,
    /// Which page the report describes.
    #[serde(default)]
    pub page: String,
    /// Page timeline timestamp the snapshot was taken at.
    #[serde(default)]
    pub timestamp: u64,
    /// Entities registered over the page lifetime.
    #[serde(default)]
    pub total_manifested: u64,
}

// ---------------------------------------------------------------------------
// StatsReport
// ---------------------------------------------------------------------------

/// Answer to a stats query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsReport {
    /// Entities currently alive on the page.
    pub shards: u32,
    /// Entities manifested over the page lifetime.
    pub cats: u32,
    /// Coherence on a `0..=100` scale.
    pub stability: u8,
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A message sent to the other context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Page to background: are you there?
    #[serde(rename = "ping")]
    LivenessProbe { timestamp: u64 },
    /// Page to background: periodic snapshot.
    #[serde(rename = "QUANTUM_READY")]
    Heartbeat(ReadyReport),
    /// Background or UI to page: current counters.
    #[serde(rename = "getQuantumStats")]
    StatsQuery,
    /// UI to page: override one parameter.
    #[serde(rename = "updateParameter")]
    ParameterOverride {
        #[serde(rename = "parameterName")]
        parameter_name: String,
        value: serde_json::Value,
    },
}

impl Request {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::LivenessProbe { .. } => "liveness_probe",
            Request::Heartbeat(_) => "heartbeat",
            Request::StatsQuery => "stats_query",
            Request::ParameterOverride { .. } => "parameter_override",
        }
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// A reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    /// Reply to a liveness probe; echoes the probe timestamp.
    Pong { pong: bool, timestamp: u64 },
    /// Reply to a stats query.
    Stats(StatsReport),
    /// Acknowledgement of a message that needs no data in return.
    Ack { status: String },
}

impl Response {
    /// The standard acknowledgement.
    pub fn acknowledged() -> Self {
        Response::Ack {
            status: "acknowledged".to_owned(),
        }
    }

    /// Whether this is a positive answer to the probe sent at `timestamp`.
    pub fn is_pong_for(&self, timestamp: u64) -> bool {
        matches!(self, Response::Pong { pong: true, timestamp: t } if *t == timestamp)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
