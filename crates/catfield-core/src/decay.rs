//! Coherence decay model and wave-function collapse.
//!
//! The [`DecayModel`] owns the [`QuantumParameters`] of one page context. It is
//! the only writer of those parameters:
//!
//! - [`tick`](DecayModel::tick) applies the fixed maintenance decay.
//! - [`apply_influence`](DecayModel::apply_influence) folds in page activity.
//! - [`update`](DecayModel::update) merges external overrides.
//!
//! [`collapse`](DecayModel::collapse) turns the current state plus an
//! observation anchor into the [`CatParameters`] of a single manifestation.
//! Randomness comes from a seeded PCG stream and a [`SimplexNoise`] field, so
//! two models built from the same seed collapse identically.
//!
//! # Example
//!
//! ```
//! use catfield_core::decay::{DecayConfig, DecayModel};
//!
//! let mut model = DecayModel::new(DecayConfig::default(), 42);
//! for n in 1..=10 {
//!     model.tick(n * 30_000);
//! }
//! let expected = 0.92 * 0.95f64.powi(10);
//! assert!((model.parameters().coherence - expected).abs() < 1e-12);
//! ```

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};

use crate::noise::SimplexNoise;
use crate::CoreError;

// ---------------------------------------------------------------------------
// DecayConfig
// ---------------------------------------------------------------------------

/// Constants governing decay, clamping and collapse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayConfig {
    /// Multiplier applied to coherence on every maintenance tick.
    pub decay_factor: f64,
    /// Lower clamp for coherence.
    pub coherence_floor: f64,
    /// Upper clamp for manifestation probability.
    pub probability_ceiling: f64,
    /// Per-millisecond decoherence rate used by [`DecayModel::collapse`].
    pub planck_constant: f64,
    /// Parameters a fresh model starts from when nothing is stored.
    pub initial: QuantumParameters,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            decay_factor: 0.95,
            coherence_floor: 0.3,
            probability_ceiling: 0.75,
            planck_constant: 1.616255e-35,
            initial: QuantumParameters::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// QuantumParameters
// ---------------------------------------------------------------------------

/// The scalar state of the field. All values are fractions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuantumParameters {
    /// Decaying gate value in `[floor, 1]`.
    pub coherence: f64,
    /// Chance that an eligible activity event manifests, `<= ceiling`.
    pub manifestation_probability: f64,
    /// Spatial jitter scale, `>= 0`.
    pub reality_distortion: f64,
}

impl Default for QuantumParameters {
    fn default() -> Self {
        Self {
            coherence: 0.92,
            manifestation_probability: 0.75,
            reality_distortion: 0.5,
        }
    }
}

// ---------------------------------------------------------------------------
// ParameterUpdate
// ---------------------------------------------------------------------------

/// A partial override of [`QuantumParameters`]. `None` fields are left as is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParameterUpdate {
    pub coherence: Option<f64>,
    pub manifestation_probability: Option<f64>,
    pub reality_distortion: Option<f64>,
}

impl ParameterUpdate {
    /// Build an update from a single `{parameterName, value}` override.
    ///
    /// Accepts camelCase and snake_case names, plus the popup slider keys
    /// `manifestationProb` and `distortionField`. Fractional parameters given on
    /// a percentage scale (`> 1`) are divided by 100. Non-numeric values yield
    /// an empty update rather than an error, since a malformed value is simply
    /// ignored downstream.
    pub fn from_override(name: &str, value: &serde_json::Value) -> Result<Self, CoreError> {
        let number = value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse::<f64>().ok()));
        let mut update = Self::default();
        match name {
            "coherence" | "stability" => update.coherence = number.map(percent_to_fraction),
            "manifestationProbability" | "manifestation_probability" | "manifestationProb" => {
                update.manifestation_probability = number.map(percent_to_fraction)
            }
            "realityDistortion" | "reality_distortion" | "distortionField" => {
                update.reality_distortion = number
            }
            other => {
                return Err(CoreError::UnknownParameter {
                    name: other.to_owned(),
                })
            }
        }
        Ok(update)
    }

    /// Whether the update carries no overrides.
    pub fn is_empty(&self) -> bool {
        self.coherence.is_none()
            && self.manifestation_probability.is_none()
            && self.reality_distortion.is_none()
    }
}

fn percent_to_fraction(v: f64) -> f64 {
    if v > 1.0 {
        v / 100.0
    } else {
        v
    }
}

// ---------------------------------------------------------------------------
// Collapse inputs and outputs
// ---------------------------------------------------------------------------

/// A point in page coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// The spatial anchor a manifestation is collapsed around: the bounding box
/// of the element that triggered it, in page coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationContext {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Everything needed to render one manifestation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CatParameters {
    /// Jittered anchor position.
    pub position: Position,
    /// Edge length in pixels.
    pub size: f64,
    /// Animation phase in radians.
    pub phase: f64,
    /// Coherence attenuated by decoherence at collapse time.
    pub coherence: f64,
}

// ---------------------------------------------------------------------------
// DecayModel
// ---------------------------------------------------------------------------

/// The stateful decay model of one page context.
#[derive(Debug, Clone)]
pub struct DecayModel {
    config: DecayConfig,
    params: QuantumParameters,
    noise: SimplexNoise,
    rng: Pcg64,
    last_tick_ms: Option<u64>,
    last_collapse_ms: u64,
    tick_count: u64,
}

impl DecayModel {
    /// Create a model starting from `config.initial`.
    ///
    /// # Panics
    ///
    /// Panics if the decay factor is not in `(0, 1]` or the floor is above
    /// the ceiling of the coherence range.
    pub fn new(config: DecayConfig, seed: u64) -> Self {
        let initial = config.initial;
        Self::with_parameters(config, initial, seed)
    }

    /// Create a model starting from explicit parameters, e.g. ones seeded
    /// from storage. Out-of-range values are clamped.
    pub fn with_parameters(config: DecayConfig, params: QuantumParameters, seed: u64) -> Self {
        assert!(
            config.decay_factor > 0.0 && config.decay_factor <= 1.0,
            "decay_factor must be in (0, 1], got {}",
            config.decay_factor
        );
        assert!(
            (0.0..=1.0).contains(&config.coherence_floor),
            "coherence_floor must be in [0, 1], got {}",
            config.coherence_floor
        );

        let mut rng = Pcg64::seed_from_u64(seed);
        let noise = SimplexNoise::new(&mut rng);
        let mut model = Self {
            config,
            params: QuantumParameters::default(),
            noise,
            rng,
            last_tick_ms: None,
            last_collapse_ms: 0,
            tick_count: 0,
        };
        model.update(
            ParameterUpdate {
                coherence: Some(params.coherence),
                manifestation_probability: Some(params.manifestation_probability),
                reality_distortion: Some(params.reality_distortion),
            },
            0,
        );
        model
    }

    /// Apply one maintenance decay step at `now_ms`.
    ///
    /// Coherence is multiplied by the decay factor and clamped to the floor;
    /// the manifestation probability is recomputed as
    /// `min(ceiling, coherence)`. Returns the new coherence.
    pub fn tick(&mut self, now_ms: u64) -> f64 {
        let decayed = self.params.coherence * self.config.decay_factor;
        self.params.coherence = decayed.max(self.config.coherence_floor).min(1.0);
        self.recompute_probability();
        self.last_tick_ms = Some(now_ms);
        self.tick_count += 1;
        tracing::trace!(
            coherence = self.params.coherence,
            tick = self.tick_count,
            "coherence decayed"
        );
        self.params.coherence
    }

    /// Fold a multiplicative activity influence into coherence.
    ///
    /// The result is clamped to `[floor, 1]` on every call, so repeated
    /// high-influence events saturate at 1 instead of accumulating.
    pub fn apply_influence(&mut self, factor: f64) {
        if !factor.is_finite() || factor <= 0.0 {
            return;
        }
        self.params.coherence = self.clamp_coherence(self.params.coherence * factor);
        self.recompute_probability();
    }

    /// Collapse the field around `context` at `now_ms`.
    ///
    /// Only the last-collapse timestamp and the random stream advance; the
    /// quantum parameters are untouched.
    pub fn collapse(&mut self, context: &ObservationContext, now_ms: u64) -> CatParameters {
        let elapsed = now_ms.saturating_sub(self.last_collapse_ms) as f64;
        let decoherence = (-elapsed * self.config.planck_constant).exp();

        let t = now_ms as f64 * 0.001;
        let jitter = self.params.reality_distortion * 50.0;
        let position = Position {
            x: context.x + self.noise.sample(context.x * 0.01, context.y * 0.01, t) * jitter,
            y: context.y + self.noise.sample(context.y * 0.01, t, context.x * 0.01) * jitter,
        };

        let base_size = 30.0 + self.rng.gen::<f64>() * 20.0;
        let size = base_size * (1.0 + (1.0 - decoherence) * 0.5);

        let phase_noise = self.noise.sample01(t, context.x * 0.01, context.y * 0.01);
        let phase = (now_ms as f64 % std::f64::consts::TAU) + phase_noise * std::f64::consts::PI;

        self.last_collapse_ms = now_ms;

        CatParameters {
            position,
            size,
            phase,
            coherence: self.params.coherence * decoherence,
        }
    }

    /// Shallow-merge `update` into the parameters at `now_ms`.
    ///
    /// Non-finite values are ignored. Coherence is clamped to `[floor, 1]`,
    /// probability to `[0, ceiling]`, distortion to `>= 0`. Resets the
    /// last-collapse timestamp.
    pub fn update(&mut self, update: ParameterUpdate, now_ms: u64) {
        if let Some(c) = update.coherence.filter(|v| v.is_finite()) {
            self.params.coherence = self.clamp_coherence(c);
        }
        if let Some(p) = update.manifestation_probability.filter(|v| v.is_finite()) {
            self.params.manifestation_probability =
                p.clamp(0.0, self.config.probability_ceiling);
        }
        if let Some(d) = update.reality_distortion.filter(|v| v.is_finite()) {
            self.params.reality_distortion = d.max(0.0);
        }
        self.last_collapse_ms = now_ms;
    }

    // -- accessors ----------------------------------------------------------

    /// Current parameters (by value).
    pub fn parameters(&self) -> QuantumParameters {
        self.params
    }

    /// Coherence as an integer percentage, for boundary messages.
    pub fn coherence_percent(&self) -> u8 {
        (self.params.coherence * 100.0).round().clamp(0.0, 100.0) as u8
    }

    /// The configuration this model was built with.
    pub fn config(&self) -> &DecayConfig {
        &self.config
    }

    /// Timestamp of the most recent tick, if any.
    pub fn last_tick_ms(&self) -> Option<u64> {
        self.last_tick_ms
    }

    /// Timestamp of the most recent collapse or update.
    pub fn last_collapse_ms(&self) -> u64 {
        self.last_collapse_ms
    }

    /// Number of maintenance ticks applied.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    fn clamp_coherence(&self, c: f64) -> f64 {
        c.clamp(self.config.coherence_floor, 1.0)
    }

    fn recompute_probability(&mut self) {
        self.params.manifestation_probability =
            self.params.coherence.min(self.config.probability_ceiling);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
