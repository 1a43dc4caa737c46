//! Persistent key-value storage shared by the two contexts.
//!
//! Values are JSON. Readers never trust what they find: a missing or
//! malformed entry falls back to defaults with a warning.

use std::collections::BTreeMap;

use catfield_core::decay::{ParameterUpdate, QuantumParameters};
use serde_json::Value;

use crate::EngineError;

/// Key holding the persisted field parameters.
pub const QUANTUM_STATE_KEY: &str = "quantumState";

/// Key holding an optional domain blacklist override.
pub const BLACKLIST_KEY: &str = "blacklistedDomains";

/// Get/set of JSON values by string key.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&mut self, key: &str, value: Value) -> Result<(), EngineError>;
}

/// In-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) -> Result<(), EngineError> {
        self.entries.insert(key.to_owned(), value);
        Ok(())
    }
}

/// Read the stored parameters, merged over `defaults`.
///
/// Partial records fill the gaps from `defaults`. Returns `None` when nothing
/// is stored or the record does not decode.
pub fn load_parameters(
    store: &dyn KeyValueStore,
    defaults: QuantumParameters,
) -> Option<QuantumParameters> {
    let raw = store.get(QUANTUM_STATE_KEY)?;
    let update: ParameterUpdate = match serde_json::from_value(raw) {
        Ok(u) => u,
        Err(e) => {
            tracing::warn!(error = %e, key = QUANTUM_STATE_KEY, "ignoring malformed stored state");
            return None;
        }
    };
    Some(QuantumParameters {
        coherence: update.coherence.unwrap_or(defaults.coherence),
        manifestation_probability: update
            .manifestation_probability
            .unwrap_or(defaults.manifestation_probability),
        reality_distortion: update
            .reality_distortion
            .unwrap_or(defaults.reality_distortion),
    })
}

/// Persist `params` under [`QUANTUM_STATE_KEY`].
pub fn save_parameters(
    store: &mut dyn KeyValueStore,
    params: &QuantumParameters,
) -> Result<(), EngineError> {
    let value = serde_json::to_value(params).map_err(|e| EngineError::Store(e.to_string()))?;
    store.set(QUANTUM_STATE_KEY, value)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
