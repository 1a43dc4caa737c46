//! Page snapshots with BLAKE3 hashing.
//!
//! A [`PageSnapshot`] is a serializable view of everything that makes two
//! page runs distinguishable: field parameters, live entities, connection
//! state and the timeline position. Its content hash makes determinism
//! checks one string comparison.
//!
//! # Usage
//!
//! ```
//! use catfield_engine::prelude::*;
//!
//! fn run(seed: u64) -> String {
//!     let store = MemoryStore::new();
//!     let background = BackgroundCoordinator::shared(Box::new(MemoryStore::new()), BackgroundConfig::default(), 0);
//!     let (channel, _link) = LoopbackChannel::new(background);
//!     let mut page = PageRuntime::new(
//!         "tab", "example.org", EngineConfig::default(), seed, &store, channel, LiveHost,
//!     ).unwrap();
//!     page.start();
//!     page.advance_to(120_000);
//!     page.state_hash()
//! }
//!
//! assert_eq!(run(3), run(3));
//! assert_eq!(run(3).len(), 64); // BLAKE3 hex digest
//! ```
//!
//! Render requests waiting in the outbox and queued responses are not part
//! of the snapshot.

use catfield_core::decay::QuantumParameters;
use catfield_core::registry::ManifestedEntity;
use serde::{Deserialize, Serialize};

use crate::channel::{HostContext, MessageChannel};
use crate::page::PageRuntime;
use crate::resilience::{ChannelState, ConnectionState};
use crate::scheduler::TimerKind;

// ---------------------------------------------------------------------------
// PageSnapshot
// ---------------------------------------------------------------------------

/// A serializable snapshot of one page runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub page_id: String,
    pub now_ms: u64,
    /// `None` once manifestation has halted.
    pub parameters: Option<QuantumParameters>,
    /// Live entities in id order.
    pub entities: Vec<ManifestedEntity>,
    pub connection: ConnectionState,
    pub channel: ChannelState,
    /// Maintenance passes run so far.
    pub tick_count: u64,
    /// BLAKE3 hex digest (64 lowercase hex chars) of every other field.
    pub hash: String,
}

impl PageSnapshot {
    /// Recompute the hash and compare it with the recorded one.
    pub fn verify(&self) -> Result<(), anyhow::Error> {
        let expected = compute_hash(&HashableState::of(self));
        if expected != self.hash {
            return Err(anyhow::anyhow!(
                "snapshot hash mismatch: recorded {} but recomputed {}",
                self.hash,
                expected
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Hashing helpers
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HashableState<'a> {
    page_id: &'a str,
    now_ms: u64,
    parameters: &'a Option<QuantumParameters>,
    entities: &'a [ManifestedEntity],
    connection: ConnectionState,
    channel: ChannelState,
    tick_count: u64,
}

impl<'a> HashableState<'a> {
    fn of(snapshot: &'a PageSnapshot) -> Self {
        Self {
            page_id: &snapshot.page_id,
            now_ms: snapshot.now_ms,
            parameters: &snapshot.parameters,
            entities: &snapshot.entities,
            connection: snapshot.connection,
            channel: snapshot.channel,
            tick_count: snapshot.tick_count,
        }
    }
}

fn compute_hash(state: &HashableState<'_>) -> String {
    // Plain data with string keys; serialization cannot fail.
    let bytes = serde_json::to_vec(state).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

// ---------------------------------------------------------------------------
// PageRuntime snapshot methods
// ---------------------------------------------------------------------------

impl<C: MessageChannel, H: HostContext> PageRuntime<C, H> {
    /// Capture the current page state and its hash.
    pub fn capture_snapshot(&self) -> PageSnapshot {
        let mut snapshot = PageSnapshot {
            page_id: self.page_id().to_owned(),
            now_ms: self.now_ms(),
            parameters: self.parameters(),
            entities: self.registry().snapshot(),
            connection: self.connection_state(),
            channel: self.channel_state(),
            tick_count: self.scheduler().fire_count(TimerKind::Maintenance),
            hash: String::new(),
        };
        snapshot.hash = compute_hash(&HashableState::of(&snapshot));
        snapshot
    }

    /// The BLAKE3 hash of the current state.
    pub fn state_hash(&self) -> String {
        self.capture_snapshot().hash
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
