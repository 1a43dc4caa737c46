//! Manifested entity identifiers and the entity registry.
//!
//! An [`EntityId`] packs the millisecond timestamp of its allocation together
//! with a per-registry monotonic sequence number. The sequence alone is unique
//! for the lifetime of a registry; the timestamp only makes the rendered
//! string form (`cat-<ms>-<seq>`) readable in diagnostics.
//!
//! The [`EntityRegistry`] holds every live manifestation. Entities are never
//! mutated after registration; they leave only through
//! [`evict_stale`](EntityRegistry::evict_stale).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::decay::{CatParameters, Position};

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// Identifier of one manifested entity.
///
/// Ordered by sequence number, i.e. allocation order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    seq: u64,
    created_ms: u64,
}

impl EntityId {
    /// Construct an id from its parts.
    #[inline]
    pub fn new(seq: u64, created_ms: u64) -> Self {
        Self { seq, created_ms }
    }

    /// The allocation sequence number.
    #[inline]
    pub fn seq(self) -> u64 {
        self.seq
    }

    /// The timestamp the id was allocated at.
    #[inline]
    pub fn created_ms(self) -> u64 {
        self.created_ms
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({}@{})", self.seq, self.created_ms)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cat-{}-{}", self.created_ms, self.seq)
    }
}

// ---------------------------------------------------------------------------
// RegistryConfig
// ---------------------------------------------------------------------------

/// Eviction thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Entities older than this are evicted.
    pub max_age_ms: u64,
    /// Entities born below this coherence are evicted.
    pub min_birth_coherence: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_age_ms: 300_000,
            min_birth_coherence: 0.1,
        }
    }
}

// ---------------------------------------------------------------------------
// ManifestedEntity
// ---------------------------------------------------------------------------

/// One rendered overlay instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestedEntity {
    pub id: EntityId,
    pub created_at_ms: u64,
    /// Field coherence at the moment of registration.
    pub coherence_at_birth: f64,
    pub position: Position,
    pub phase: f64,
    pub size: f64,
}

impl ManifestedEntity {
    /// Age at `now_ms`. Saturates at zero if the clock is behind the entity.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at_ms)
    }
}

// ---------------------------------------------------------------------------
// EntityRegistry
// ---------------------------------------------------------------------------

/// Tracks live manifested entities and allocates their ids.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    config: RegistryConfig,
    entities: BTreeMap<EntityId, ManifestedEntity>,
    next_seq: u64,
    total_registered: u64,
    total_evicted: u64,
}

impl EntityRegistry {
    /// Create an empty registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Allocate a fresh id. Sequence numbers are never reused, so ids stay
    /// unique even when many are allocated within the same millisecond.
    pub fn allocate_id(&mut self, now_ms: u64) -> EntityId {
        let id = EntityId::new(self.next_seq, now_ms);
        self.next_seq = self.next_seq.saturating_add(1);
        id
    }

    /// Insert an entity born at `now_ms` with the given birth coherence.
    ///
    /// Returns `false` (and leaves the registry unchanged) if `id` is already
    /// present.
    pub fn register(
        &mut self,
        id: EntityId,
        parameters: &CatParameters,
        coherence_at_birth: f64,
        now_ms: u64,
    ) -> bool {
        if self.entities.contains_key(&id) {
            tracing::warn!(entity = %id, "register: duplicate entity id refused");
            return false;
        }
        // Keep externally supplied ids from colliding with future allocations.
        if id.seq() >= self.next_seq {
            self.next_seq = id.seq().saturating_add(1);
        }
        self.entities.insert(
            id,
            ManifestedEntity {
                id,
                created_at_ms: now_ms,
                coherence_at_birth,
                position: parameters.position,
                phase: parameters.phase,
                size: parameters.size,
            },
        );
        self.total_registered += 1;
        true
    }

    /// Remove every entity older than the max age or born below the minimum
    /// coherence. Returns how many were removed.
    pub fn evict_stale(&mut self, now_ms: u64) -> usize {
        let before = self.entities.len();
        let max_age = self.config.max_age_ms;
        let min_coherence = self.config.min_birth_coherence;
        self.entities.retain(|_, e| {
            e.age_ms(now_ms) <= max_age && e.coherence_at_birth >= min_coherence
        });
        let removed = before - self.entities.len();
        if removed > 0 {
            self.total_evicted += removed as u64;
            tracing::debug!(removed, remaining = self.entities.len(), "evicted stale entities");
        }
        removed
    }

    // -- accessors ----------------------------------------------------------

    /// Number of live entities.
    pub fn count(&self) -> usize {
        self.entities.len()
    }

    /// Whether the registry holds no entities.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Look up a live entity.
    pub fn get(&self, id: EntityId) -> Option<&ManifestedEntity> {
        self.entities.get(&id)
    }

    /// Owned copy of all live entities in allocation order.
    pub fn snapshot(&self) -> Vec<ManifestedEntity> {
        self.entities.values().cloned().collect()
    }

    /// Entities registered over the registry's lifetime.
    pub fn total_registered(&self) -> u64 {
        self.total_registered
    }

    /// Entities evicted over the registry's lifetime.
    pub fn total_evicted(&self) -> u64 {
        self.total_evicted
    }

    /// The eviction thresholds in force.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn params() -> CatParameters {
        CatParameters {
            position: Position { x: 1.0, y: 2.0 },
            size: 40.0,
            phase: 0.5,
            coherence: 0.9,
        }
    }

    #[test]
    fn ids_unique_within_one_millisecond() {
        let mut reg = EntityRegistry::new(RegistryConfig::default());
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let id = reg.allocate_id(1_000);
            assert!(reg.register(id, &params(), 0.9, 1_000));
            assert!(seen.insert(id.to_string()), "duplicate id {id}");
        }
        assert_eq!(reg.count(), 10_000);
    }

    #[test]
    fn display_form() {
        let id = EntityId::new(7, 1_700_000_000_000);
        assert_eq!(id.to_string(), "cat-1700000000000-7");
        assert_eq!(format!("{id:?}"), "EntityId(7@1700000000000)");
    }

    #[test]
    fn duplicate_register_refused() {
        let mut reg = EntityRegistry::new(RegistryConfig::default());
        let id = reg.allocate_id(0);
        assert!(reg.register(id, &params(), 0.9, 0));
        assert!(!reg.register(id, &params(), 0.5, 10));
        assert_eq!(reg.count(), 1);
        assert_eq!(reg.get(id).unwrap().coherence_at_birth, 0.9);
    }

    #[test]
    fn external_ids_do_not_collide_with_allocations() {
        let mut reg = EntityRegistry::new(RegistryConfig::default());
        assert!(reg.register(EntityId::new(5, 0), &params(), 0.9, 0));
        let next = reg.allocate_id(0);
        assert_eq!(next.seq(), 6);
    }

    #[test]
    fn max_sequence_id_registers_without_overflow() {
        let mut reg = EntityRegistry::new(RegistryConfig::default());
        assert!(reg.register(EntityId::new(u64::MAX, 0), &params(), 0.9, 0));
        let next = reg.allocate_id(1);
        assert_eq!(next.seq(), u64::MAX);
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn low_birth_coherence_evicted_immediately() {
        let mut reg = EntityRegistry::new(RegistryConfig::default());
        let weak = reg.allocate_id(0);
        let strong = reg.allocate_id(0);
        reg.register(weak, &params(), 0.05, 0);
        reg.register(strong, &params(), 0.9, 0);
        assert_eq!(reg.evict_stale(0), 1);
        assert!(reg.get(weak).is_none());
        assert!(reg.get(strong).is_some());
    }

    #[test]
    fn age_boundary_is_exclusive() {
        let mut reg = EntityRegistry::new(RegistryConfig::default());
        let id = reg.allocate_id(0);
        reg.register(id, &params(), 0.9, 0);
        assert_eq!(reg.evict_stale(300_000), 0, "exactly max age survives");
        assert_eq!(reg.evict_stale(300_001), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn evict_is_idempotent_and_safe_when_empty() {
        let mut reg = EntityRegistry::new(RegistryConfig::default());
        assert_eq!(reg.evict_stale(1_000_000), 0);
        let id = reg.allocate_id(0);
        reg.register(id, &params(), 0.9, 0);
        assert_eq!(reg.evict_stale(400_000), 1);
        assert_eq!(reg.evict_stale(400_000), 0);
        assert_eq!(reg.total_evicted(), 1);
        assert_eq!(reg.total_registered(), 1);
    }

    #[test]
    fn clock_behind_entity_does_not_evict() {
        let mut reg = EntityRegistry::new(RegistryConfig::default());
        let id = reg.allocate_id(10_000);
        reg.register(id, &params(), 0.9, 10_000);
        assert_eq!(reg.evict_stale(5_000), 0);
    }

    #[test]
    fn snapshot_in_allocation_order() {
        let mut reg = EntityRegistry::new(RegistryConfig::default());
        let ids: Vec<EntityId> = (0..5).map(|n| reg.allocate_id(100 - n)).collect();
        for (n, id) in ids.iter().enumerate() {
            reg.register(*id, &params(), 0.9, n as u64);
        }
        let snap: Vec<EntityId> = reg.snapshot().iter().map(|e| e.id).collect();
        assert_eq!(snap, ids);
    }
}
