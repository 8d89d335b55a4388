//! Entity handles and the entity indirection table.
//!
//! An [`Entity`] is a 64-bit handle that packs a *generation* counter in the
//! high 32 bits and an *index* in the low 32 bits. The generation is bumped
//! every time an index is retired, which allows immediate stale-handle
//! detection even after the index has been recycled.
//!
//! The [`EntityTable`] maps each index to a slot holding the slot's current
//! generation and, for entities that own components, the [`EntityLocation`]
//! (archetype index + row) where their data lives.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A generational entity handle.
///
/// Layout: `[generation: u32 | index: u32]`
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity(u64);

impl Entity {
    /// Construct an `Entity` from an index and generation.
    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    /// The index portion (low 32 bits).
    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    /// The generation portion (high 32 bits).
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw `u64` representation.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Reconstruct from a raw `u64`.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// EntityLocation
// ---------------------------------------------------------------------------

/// Where an entity's component data lives: which archetype (by index into
/// the [`ArchetypeSet`](crate::archetype::ArchetypeSet)) and which row
/// within that archetype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLocation {
    /// Index of the archetype in the set's insertion order.
    pub archetype: usize,
    /// Row within the archetype.
    pub row: usize,
}

// ---------------------------------------------------------------------------
// EntityTable
// ---------------------------------------------------------------------------

/// Per-index bookkeeping: the slot's current generation plus the location of
/// the entity's component data, if it has any.
#[derive(Debug, Clone, Copy, Default)]
struct EntitySlot {
    generation: u32,
    location: Option<EntityLocation>,
}

/// Indirection table from entity index to archetype location, with
/// generational recycling of indices.
///
/// Freed indices are kept in a FIFO queue so that generations are spread out
/// over time rather than concentrated on a hot index. A slot's generation is
/// bumped on [`despawn`](EntityTable::despawn); [`create`](EntityTable::create)
/// hands a recycled index out at its *current* generation, so any handle from
/// the index's previous life compares stale.
#[derive(Debug, Default)]
pub struct EntityTable {
    slots: Vec<EntitySlot>,
    free: VecDeque<u32>,
    alive: usize,
}

impl EntityTable {
    /// Create a new, empty table.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: VecDeque::new(),
            alive: 0,
        }
    }

    /// Allocate a fresh [`Entity`].
    ///
    /// If a recycled index is available it is reused at its current
    /// generation (the bump happened on despawn); otherwise a brand-new
    /// index is created at generation 0. The returned entity has no
    /// location until one is set.
    pub fn create(&mut self) -> Entity {
        self.alive += 1;
        if let Some(index) = self.free.pop_front() {
            Entity::new(index, self.slots[index as usize].generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(EntitySlot::default());
            Entity::new(index, 0)
        }
    }

    /// Overwrite the slot's location. Does not touch the generation.
    pub fn set_location(&mut self, entity: Entity, location: EntityLocation) {
        self.slots[entity.index() as usize].location = Some(location);
    }

    /// Clear the slot's location (the entity no longer owns archetype rows).
    pub(crate) fn clear_location(&mut self, entity: Entity) {
        self.slots[entity.index() as usize].location = None;
    }

    /// Retire an entity: bump the slot's generation so outstanding handles
    /// become stale, and queue the index for reuse.
    ///
    /// The location field is left untouched; the caller is responsible for
    /// removing the entity's archetype rows and clearing the location before
    /// retiring the handle.
    pub fn despawn(&mut self, entity: Entity) {
        let slot = &mut self.slots[entity.index() as usize];
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push_back(entity.index());
        self.alive -= 1;
    }

    /// Whether the handle's generation matches the slot's current generation.
    pub fn is_alive(&self, entity: Entity) -> bool {
        match self.slots.get(entity.index() as usize) {
            Some(slot) => slot.generation == entity.generation(),
            None => false,
        }
    }

    /// Whether the entity owns no archetype rows (no location).
    pub fn is_empty(&self, entity: Entity) -> bool {
        self.location_of(entity).is_none()
    }

    /// The slot's location, regardless of generation. Callers that care about
    /// correctness must check [`is_alive`](EntityTable::is_alive) first.
    pub fn location_of(&self, entity: Entity) -> Option<EntityLocation> {
        self.slots
            .get(entity.index() as usize)
            .and_then(|slot| slot.location)
    }

    /// Number of currently alive entities.
    pub fn alive_count(&self) -> usize {
        self.alive
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
