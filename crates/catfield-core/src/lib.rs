//! Catfield Core -- coherence decay, admission and entity tracking.
//!
//! This crate holds the deterministic state of one page context:
//!
//! - [`noise::SimplexNoise`]: seeded gradient noise for spatial and phase jitter.
//! - [`decay::DecayModel`]: the decaying coherence scalar and the collapse of
//!   manifestation parameters.
//! - [`admission::AdmissionController`]: turns page activity into
//!   manifestations.
//! - [`registry::EntityRegistry`]: live manifestations and their eviction.
//!
//! Nothing here reads a clock or touches I/O; callers pass millisecond
//! timestamps and seeds. Same seed + same inputs = same state.
//!
//! # Quick Start
//!
//! ```
//! use catfield_core::prelude::*;
//!
//! let mut model = DecayModel::new(DecayConfig::default(), 1);
//! let mut registry = EntityRegistry::new(RegistryConfig::default());
//! let mut admission = AdmissionController::new(
//!     AdmissionConfig { policy: AdmissionPolicy::FixedThreshold { threshold: 1.0 }, ..Default::default() },
//!     2,
//! );
//!
//! let anchor = ObservationContext { x: 10.0, y: 20.0, width: 64.0, height: 64.0 };
//! let event = ActivityEvent::new(ActivityKind::Image, anchor, 1_000);
//! let outcome = admission.on_activity(&event, Some(&mut model), &mut registry);
//! assert!(outcome.is_admitted());
//! assert_eq!(registry.count(), 1);
//!
//! model.tick(31_000);
//! registry.evict_stale(400_000);
//! assert!(registry.is_empty());
//! ```

#![deny(unsafe_code)]

pub mod admission;
pub mod decay;
pub mod noise;
pub mod registry;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced at the boundary of the core types.
///
/// Normal operation of the decay model and registry never fails; this only
/// covers decoding of externally supplied input.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A parameter override named a parameter the field does not have.
    #[error("unknown parameter '{name}'. Known parameters: [coherence, manifestationProbability, realityDistortion]")]
    UnknownParameter { name: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::admission::{
        ActivityEvent, ActivityKind, AdmissionConfig, AdmissionController, AdmissionOutcome,
        AdmissionPolicy, Rejection, RenderRequest,
    };
    pub use crate::decay::{
        CatParameters, DecayConfig, DecayModel, ObservationContext, ParameterUpdate, Position,
        QuantumParameters,
    };
    pub use crate::noise::SimplexNoise;
    pub use crate::registry::{EntityId, EntityRegistry, ManifestedEntity, RegistryConfig};
    pub use crate::CoreError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
