//! Activity admission: deciding whether a page mutation manifests.
//!
//! Every observed DOM change becomes an [`ActivityEvent`]. The
//! [`AdmissionController`] folds the event's influence into the
//! [`DecayModel`], draws one uniform sample and, on admission, collapses the
//! field and registers the new entity synchronously in the
//! [`EntityRegistry`]. The caller receives a [`RenderRequest`] to hand to the
//! renderer.
//!
//! Two admission policies exist ([`AdmissionPolicy`]); exactly one is active
//! per controller. The default is coherence-scaled.

use std::collections::{HashMap, VecDeque};

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};

use crate::decay::{CatParameters, DecayModel, ObservationContext};
use crate::registry::{EntityId, EntityRegistry};

// ---------------------------------------------------------------------------
// ActivityEvent
// ---------------------------------------------------------------------------

/// What kind of element a mutation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Image,
    Video,
    Picture,
    Canvas,
    /// Style or attribute change on a non-media element.
    Attribute,
    /// Any other child-list or text change.
    Other,
}

impl ActivityKind {
    /// Whether the element carries media content.
    pub fn is_media(self) -> bool {
        matches!(
            self,
            ActivityKind::Image | ActivityKind::Video | ActivityKind::Picture | ActivityKind::Canvas
        )
    }

    /// Map a lowercase tag name to a kind.
    pub fn from_tag(tag: &str) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "img" => ActivityKind::Image,
            "video" => ActivityKind::Video,
            "picture" => ActivityKind::Picture,
            "canvas" => ActivityKind::Canvas,
            _ => ActivityKind::Other,
        }
    }
}

/// A single observed page mutation. Transient; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub kind: ActivityKind,
    /// Stable key of the mutated element, if the observer can provide one.
    pub target: Option<String>,
    /// Rough area of the target in square pixels.
    pub target_size_hint: f64,
    /// Bounding box of the target in page coordinates.
    pub anchor: ObservationContext,
    pub timestamp_ms: u64,
}

impl ActivityEvent {
    /// Convenience constructor for an event without a target key.
    pub fn new(kind: ActivityKind, anchor: ObservationContext, timestamp_ms: u64) -> Self {
        Self {
            kind,
            target: None,
            target_size_hint: anchor.width * anchor.height,
            anchor,
            timestamp_ms,
        }
    }

    /// Attach a target key.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

// ---------------------------------------------------------------------------
// AdmissionConfig
// ---------------------------------------------------------------------------

/// How the admission sample is compared.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Admit iff the sample is below the current manifestation probability.
    CoherenceScaled,
    /// Admit iff the sample is below a fixed superposition threshold.
    FixedThreshold { threshold: f64 },
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        AdmissionPolicy::CoherenceScaled
    }
}

/// Admission constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub policy: AdmissionPolicy,
    /// Coherence multiplier for media-bearing events.
    pub media_influence: f64,
    /// Coherence multiplier for everything else.
    pub other_influence: f64,
    /// Only media-bearing events may manifest.
    pub media_only: bool,
    /// Width of the sliding window behind [`AdmissionController::recent_activity_count`].
    pub activity_window_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            policy: AdmissionPolicy::default(),
            media_influence: 1.02,
            other_influence: 1.0,
            media_only: true,
            activity_window_ms: 10_000,
        }
    }
}

/// Default threshold of the fixed superposition policy.
pub const SUPERPOSITION_THRESHOLD: f64 = 0.42;

impl AdmissionPolicy {
    /// The fixed-threshold policy at [`SUPERPOSITION_THRESHOLD`].
    pub fn superposition() -> Self {
        AdmissionPolicy::FixedThreshold {
            threshold: SUPERPOSITION_THRESHOLD,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// A manifestation that must be rendered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub id: EntityId,
    pub parameters: CatParameters,
    pub target: Option<String>,
}

/// Why an event did not manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// No decay model is attached (page not initialised or shut down).
    NoField,
    /// The target element already hosts a manifestation.
    AlreadyManifested,
    /// The event kind may not manifest under the current configuration.
    NotEligible,
    /// The random draw failed.
    Unlucky,
}

/// The result of [`AdmissionController::on_activity`].
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionOutcome {
    Admitted(RenderRequest),
    Rejected(Rejection),
}

impl AdmissionOutcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionOutcome::Admitted(_))
    }
}

// ---------------------------------------------------------------------------
// AdmissionController
// ---------------------------------------------------------------------------

/// Gates activity events into manifestations.
#[derive(Debug)]
pub struct AdmissionController {
    config: AdmissionConfig,
    rng: Pcg64,
    /// Target to the entity manifested on it.
    marked_targets: HashMap<String, EntityId>,
    recent: VecDeque<u64>,
    admitted: u64,
}

impl AdmissionController {
    /// Create a controller drawing from a PCG stream seeded with `seed`.
    pub fn new(config: AdmissionConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Pcg64::seed_from_u64(seed),
            marked_targets: HashMap::new(),
            recent: VecDeque::new(),
            admitted: 0,
        }
    }

    /// Decide whether `event` manifests.
    ///
    /// `field` is `None` when no decay model is attached; such events are
    /// counted as activity but always rejected. On admission the entity is
    /// registered in `registry` before this returns.
    pub fn on_activity(
        &mut self,
        event: &ActivityEvent,
        field: Option<&mut DecayModel>,
        registry: &mut EntityRegistry,
    ) -> AdmissionOutcome {
        self.record_activity(event.timestamp_ms);

        let Some(model) = field else {
            return AdmissionOutcome::Rejected(Rejection::NoField);
        };

        if let Some(target) = &event.target {
            if self.marked_targets.contains_key(target) {
                return AdmissionOutcome::Rejected(Rejection::AlreadyManifested);
            }
        }

        model.apply_influence(self.influence(event.kind));

        if self.config.media_only && !event.kind.is_media() {
            return AdmissionOutcome::Rejected(Rejection::NotEligible);
        }

        let sample: f64 = self.rng.gen();
        let limit = match self.config.policy {
            AdmissionPolicy::CoherenceScaled => model.parameters().manifestation_probability,
            AdmissionPolicy::FixedThreshold { threshold } => threshold,
        };
        if sample >= limit {
            return AdmissionOutcome::Rejected(Rejection::Unlucky);
        }

        let now = event.timestamp_ms;
        let parameters = model.collapse(&event.anchor, now);
        let id = registry.allocate_id(now);
        registry.register(id, &parameters, model.parameters().coherence, now);
        if let Some(target) = &event.target {
            self.marked_targets.insert(target.clone(), id);
        }
        self.admitted += 1;

        tracing::debug!(
            entity = %id,
            kind = ?event.kind,
            sample,
            limit,
            "manifestation admitted"
        );

        AdmissionOutcome::Admitted(RenderRequest {
            id,
            parameters,
            target: event.target.clone(),
        })
    }

    /// Influence multiplier for an event kind.
    pub fn influence(&self, kind: ActivityKind) -> f64 {
        if kind.is_media() {
            self.config.media_influence
        } else {
            self.config.other_influence
        }
    }

    /// Events observed within the activity window ending at `now_ms`.
    pub fn recent_activity_count(&mut self, now_ms: u64) -> usize {
        self.prune(now_ms);
        self.recent.len()
    }

    /// Number of admitted events over the controller's lifetime.
    pub fn admitted_count(&self) -> u64 {
        self.admitted
    }

    /// Whether `target` already hosts a manifestation.
    pub fn is_marked(&self, target: &str) -> bool {
        self.marked_targets.contains_key(target)
    }

    /// Unmark targets whose entity is no longer live in `registry`, so they
    /// may manifest again. Returns how many were released.
    pub fn release_evicted(&mut self, registry: &EntityRegistry) -> usize {
        let before = self.marked_targets.len();
        self.marked_targets.retain(|_, id| registry.get(*id).is_some());
        before - self.marked_targets.len()
    }

    /// Number of targets currently hosting a manifestation.
    pub fn marked_count(&self) -> usize {
        self.marked_targets.len()
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    fn record_activity(&mut self, now_ms: u64) {
        self.recent.push_back(now_ms);
        self.prune(now_ms);
    }

    fn prune(&mut self, now_ms: u64) {
        let window = self.config.activity_window_ms;
        while let Some(&front) = self.recent.front() {
            if now_ms.saturating_sub(front) > window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
