//! Catfield Engine -- page/background coordination for the coherence field.
//!
//! This crate builds on [`catfield_core`] to run one page context end to end:
//! a single cooperative [`Scheduler`](scheduler::Scheduler) timeline drives
//! maintenance decay, activity admission and the
//! [`ResilienceProtocol`](resilience::ResilienceProtocol) that keeps the page
//! connected to its [`BackgroundCoordinator`](background::BackgroundCoordinator).
//!
//! # Architecture
//!
//! - **`PageRuntime`**: the owned per-page object. Holds the decay model,
//!   registry, admission controller, protocol and scheduler.
//! - **`BackgroundCoordinator`**: the persistent side. Answers probes, keeps
//!   the latest report per page, seeds and decays stored state.
//! - **`MessageChannel` / `HostContext`**: the seams to the host runtime. The
//!   two contexts share no memory; messages cross by value.
//! - **`ChannelError`** / **`EngineError`**: failure taxonomy.
//!
//! # Quick Start
//!
//! ```
//! use catfield_engine::prelude::*;
//!
//! let store = MemoryStore::new();
//! let background = BackgroundCoordinator::shared(Box::new(MemoryStore::new()), BackgroundConfig::default(), 0);
//! let (channel, _link) = LoopbackChannel::new(background);
//!
//! let mut page = PageRuntime::new(
//!     "tab-1", "example.org", EngineConfig::default(), 7, &store, channel, LiveHost,
//! ).unwrap();
//! page.start();
//! page.advance_to(10_000);
//! assert_eq!(page.connection_state(), ConnectionState::Connected);
//! ```

#![deny(unsafe_code)]

pub mod background;
pub mod channel;
pub mod config;
pub mod messages;
pub mod page;
pub mod resilience;
pub mod scheduler;
pub mod snapshot;
pub mod store;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

/// Re-export the core crate for convenience.
pub use catfield_core;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Failures of a single message send across the inter-context channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The other side did not answer within the host's round-trip bound.
    #[error("no response within {waited_ms} ms")]
    Timeout {
        /// How long the sender waited.
        waited_ms: u64,
    },

    /// The port closed before a response arrived.
    #[error("message channel closed before a response was received")]
    Closed,

    /// Nothing is listening on the other side. Expected on pages without an
    /// active counterpart.
    #[error("could not establish connection: receiving end does not exist")]
    NoListener,

    /// The hosting context was torn down (navigation, extension reload).
    #[error("extension context invalidated")]
    ContextInvalidated,

    /// A message could not be encoded or decoded.
    #[error("malformed message: {0}")]
    Codec(String),
}

/// How the resilience protocol treats a [`ChannelError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Swallowed silently; not counted.
    Ignored,
    /// Counted toward the heartbeat-failure threshold.
    Counted,
    /// Forces an immediate disconnect without counting.
    ContextInvalid,
}

impl ChannelError {
    /// Classify this failure for the resilience protocol.
    pub fn classify(&self) -> FailureClass {
        match self {
            ChannelError::NoListener => FailureClass::Ignored,
            ChannelError::ContextInvalidated => FailureClass::ContextInvalid,
            ChannelError::Timeout { .. } | ChannelError::Closed | ChannelError::Codec(_) => {
                FailureClass::Counted
            }
        }
    }
}

/// Errors produced by engine setup and lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The recovery budget is spent; the page context stays disabled until
    /// it is re-entered.
    #[error("connection recovery exhausted after {attempts} attempts")]
    ExhaustedRecovery {
        /// Recovery attempts made before giving up.
        attempts: u32,
    },

    /// The page's host is on the domain blacklist.
    #[error("host '{host}' is blacklisted")]
    Blacklisted {
        /// The rejected host name.
        host: String,
    },

    /// Configuration could not be parsed or failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The key-value store rejected a read or write.
    #[error("store error: {0}")]
    Store(String),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    // Re-export everything from the core prelude.
    pub use catfield_core::prelude::*;

    pub use crate::background::{BackgroundConfig, BackgroundCoordinator};
    pub use crate::channel::{HostContext, HostHandle, LinkControl, LiveHost, LoopbackChannel, MessageChannel};
    pub use crate::config::{Blacklist, EngineConfig};
    pub use crate::messages::{ReadyReport, Request, Response, StatsReport};
    pub use crate::page::{PageEvent, PageRuntime};
    pub use crate::resilience::{
        ChannelState, ConnectionState, ProtocolAction, ResilienceConfig, ResilienceProtocol,
    };
    pub use crate::scheduler::{Due, Scheduler, TimerKind};
    pub use crate::snapshot::PageSnapshot;
    pub use crate::store::{KeyValueStore, MemoryStore};
    pub use crate::{ChannelError, EngineError, FailureClass};
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
