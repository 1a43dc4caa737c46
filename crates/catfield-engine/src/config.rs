//! Engine configuration and the domain blacklist.
//!
//! Every section carries its constants in a `Default` impl and is
//! `#[serde(default)]`, so a configuration file only needs the fields it
//! changes.

use std::path::Path;

use anyhow::Context;
use catfield_core::admission::AdmissionConfig;
use catfield_core::decay::DecayConfig;
use catfield_core::registry::RegistryConfig;
use serde::{Deserialize, Serialize};

use crate::background::BackgroundConfig;
use crate::resilience::ResilienceConfig;
use crate::store::{KeyValueStore, BLACKLIST_KEY};
use crate::EngineError;

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Everything a page runtime and its background coordinator are built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub decay: DecayConfig,
    pub admission: AdmissionConfig,
    pub registry: RegistryConfig,
    pub resilience: ResilienceConfig,
    pub background: BackgroundConfig,
    /// Interval of the decay tick plus eviction pass.
    pub maintenance_interval_ms: u64,
    pub blacklist: Blacklist,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            decay: DecayConfig::default(),
            admission: AdmissionConfig::default(),
            registry: RegistryConfig::default(),
            resilience: ResilienceConfig::default(),
            background: BackgroundConfig::default(),
            maintenance_interval_ms: 30_000,
            blacklist: Blacklist::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = Self::from_json_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// Reject values the runtime would otherwise panic on or misbehave with.
    pub fn validate(&self) -> Result<(), EngineError> {
        let d = &self.decay;
        if !(d.decay_factor > 0.0 && d.decay_factor <= 1.0) {
            return Err(EngineError::Config(format!(
                "decay.decay_factor must be in (0, 1], got {}",
                d.decay_factor
            )));
        }
        if !(0.0..=1.0).contains(&d.coherence_floor) {
            return Err(EngineError::Config(format!(
                "decay.coherence_floor must be in [0, 1], got {}",
                d.coherence_floor
            )));
        }
        if !(0.0..=1.0).contains(&d.probability_ceiling) {
            return Err(EngineError::Config(format!(
                "decay.probability_ceiling must be in [0, 1], got {}",
                d.probability_ceiling
            )));
        }
        let positive = [
            ("maintenance_interval_ms", self.maintenance_interval_ms),
            (
                "resilience.heartbeat_interval_ms",
                self.resilience.heartbeat_interval_ms,
            ),
            (
                "resilience.failure_threshold",
                u64::from(self.resilience.failure_threshold),
            ),
            (
                "background.stored_decay_interval_ms",
                self.background.stored_decay_interval_ms,
            ),
            (
                "background.report_ttl_ms",
                self.background.report_ttl_ms,
            ),
            (
                "admission.activity_window_ms",
                self.admission.activity_window_ms,
            ),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(EngineError::Config(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Blacklist
// ---------------------------------------------------------------------------

/// Hosts on which no page runtime is started. Matches the domain itself and
/// every subdomain of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Blacklist {
    domains: Vec<String>,
}

const DEFAULT_BLACKLIST: &[&str] = &[
    "cnn.com",
    "foxnews.com",
    "reuters.com",
    "bloomberg.com",
    "wsj.com",
    "ft.com",
    "nytimes.com",
    "washingtonpost.com",
    "theguardian.com",
    "bbc.com",
    "aljazeera.com",
    "proton.me",
    "mail.proton.me",
];

impl Default for Blacklist {
    fn default() -> Self {
        Self::new(DEFAULT_BLACKLIST.iter().copied())
    }
}

impl Blacklist {
    /// Build a blacklist. Entries are lowercased; empty ones are dropped.
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .map(|d| d.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        Self { domains }
    }

    /// An empty blacklist.
    pub fn none() -> Self {
        Self {
            domains: Vec::new(),
        }
    }

    /// Whether `host` is a listed domain or a subdomain of one.
    pub fn is_blocked(&self, host: &str) -> bool {
        let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
        self.domains.iter().any(|d| {
            host == *d
                || (host.len() > d.len()
                    && host.ends_with(d.as_str())
                    && host.as_bytes()[host.len() - d.len() - 1] == b'.')
        })
    }

    /// The stored override if present and well-formed, `self` otherwise.
    pub fn from_store_or(self, store: &dyn KeyValueStore) -> Self {
        let Some(raw) = store.get(BLACKLIST_KEY) else {
            return self;
        };
        match serde_json::from_value::<Vec<String>>(raw) {
            Ok(list) => Self::new(list),
            Err(e) => {
                tracing::warn!(error = %e, key = BLACKLIST_KEY, "ignoring malformed stored blacklist");
                self
            }
        }
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
