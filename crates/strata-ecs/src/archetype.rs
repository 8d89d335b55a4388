//! Archetype storage.
//!
//! An [`Archetype`] stores all entities that share the exact same set of
//! component types, identified by its [`ComponentMask`]. Components are laid
//! out in a Structure-of-Arrays pattern: one [`BlobColumn`] per set bit, in
//! ascending-bit order, plus a parallel `Vec<Entity>` mapping row index to
//! entity. Row `r` of every column together with `entities[r]` describes one
//! entity.
//!
//! The [`ArchetypeSet`] owns every archetype, keyed by mask. Archetypes are
//! addressed by their insertion index; indices stay valid for the lifetime of
//! the set because archetypes are created lazily and never removed.

use std::collections::HashMap;

use tracing::trace;

use crate::column::BlobColumn;
use crate::component::{ComponentId, ComponentMask, ComponentRegistry};
use crate::entity::{Entity, EntityLocation, EntityTable};

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

/// Columnar table for one component set.
#[derive(Debug)]
pub struct Archetype {
    /// The component set stored here.
    mask: ComponentMask,
    /// One column per set bit, ascending-bit order.
    /// Invariant: `columns[i].1.len() == entities.len()` for all `i`.
    columns: Vec<(ComponentId, BlobColumn)>,
    /// Parallel entity vector (same row indexing as the columns).
    entities: Vec<Entity>,
}

impl Archetype {
    /// Create a new, empty archetype for `mask`, pulling each component's
    /// vtable from the registry.
    ///
    /// # Panics
    ///
    /// Panics if any bit of `mask` is not registered.
    pub(crate) fn new(mask: ComponentMask, registry: &ComponentRegistry) -> Self {
        let columns = mask
            .iter()
            .map(|id| {
                let vtable = registry
                    .vtable(id)
                    .unwrap_or_else(|| panic!("component {id:?} is not registered"));
                (id, BlobColumn::new(*vtable))
            })
            .collect();
        Self {
            mask,
            columns,
            entities: Vec::new(),
        }
    }

    /// Binary search for a column by component bit. The columns are stored in
    /// ascending-bit order, which is also ascending `ComponentId` order.
    #[inline]
    fn column_index(&self, id: ComponentId) -> Option<usize> {
        self.columns.binary_search_by_key(&id, |(id, _)| *id).ok()
    }

    /// The component set stored in this archetype.
    #[inline]
    pub fn mask(&self) -> ComponentMask {
        self.mask
    }

    /// Whether this archetype stores the given component.
    #[inline]
    pub fn has_component(&self, id: ComponentId) -> bool {
        self.mask.contains(id)
    }

    /// Number of entities (rows).
    #[inline]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the archetype has no rows.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// The entities stored here, in row order.
    #[inline]
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// The entity at `row`.
    ///
    /// # Panics
    ///
    /// Panics if `row` is out of bounds.
    #[inline]
    pub fn entity_at(&self, row: usize) -> Entity {
        self.entities[row]
    }

    /// The column for a component bit, if this archetype stores it.
    #[inline]
    pub fn column(&self, id: ComponentId) -> Option<&BlobColumn> {
        let index = self.column_index(id)?;
        Some(&self.columns[index].1)
    }

    /// Mutable access to the column for a component bit.
    #[inline]
    pub fn column_mut(&mut self, id: ComponentId) -> Option<&mut BlobColumn> {
        let index = self.column_index(id)?;
        Some(&mut self.columns[index].1)
    }

    // -- row management ------------------------------------------------------

    /// Append `entity` and reserve one uninitialized trailing slot in every
    /// column. The caller must fill each slot via `set` before the row is
    /// treated as initialized.
    pub(crate) fn grow_row(&mut self, entity: Entity) {
        self.entities.push(entity);
        for (_, column) in &mut self.columns {
            #[allow(unsafe_code)]
            unsafe {
                column.grow(1);
            }
        }
    }

    /// Replace the entity handle at `row` (used to back-fill after a
    /// swap-remove).
    pub(crate) fn set_entity(&mut self, row: usize, entity: Entity) {
        self.entities[row] = entity;
    }

    /// Remove the last entity handle.
    pub(crate) fn pop_entity(&mut self) {
        self.entities.pop().expect("archetype has entities to pop");
    }

    /// Migrate the component data of `row` into `other`.
    ///
    /// Precondition: `other` has been grown so that every column has one
    /// uninitialized trailing slot awaiting a value. Columns whose bit is
    /// also set in `other` transfer their value into that slot; columns being
    /// dropped destroy their value in place. The vacated row is then
    /// back-filled with the tail row's bytes, so every logical value sees
    /// exactly one destructor call.
    ///
    /// The entity vectors are not touched; the caller patches them (and the
    /// entity table) afterwards.
    pub(crate) fn move_row_to(&mut self, row: usize, other: &mut Archetype) {
        debug_assert!(row < self.entities.len());
        let to_mask = other.mask;

        for (id, column) in &mut self.columns {
            #[allow(unsafe_code)]
            unsafe {
                if to_mask.contains(*id) {
                    let dst = other
                        .column_mut(*id)
                        .expect("target archetype is missing a shared column");
                    let dst_row = dst.len() - 1;
                    let src = column.get_mut(row);
                    dst.set(dst_row, src);
                } else {
                    column.drop_at(row);
                }
            }
        }

        // Every value at `row` is now moved out or destroyed; pull the tail
        // row's bytes into the gap without running destructors.
        for (_, column) in &mut self.columns {
            #[allow(unsafe_code)]
            unsafe {
                column.swap_remove_forget(row);
            }
        }
    }

    /// Remove `row` entirely, destroying every component value, using
    /// swap-remove to keep storage dense.
    ///
    /// Returns the entity that was moved into `row` (the previous tail) if a
    /// swap occurred, or `None` if the removed row was the last.
    pub(crate) fn remove_row(&mut self, row: usize) -> Option<Entity> {
        let last = self.entities.len() - 1;
        self.entities.swap_remove(row);
        for (_, column) in &mut self.columns {
            #[allow(unsafe_code)]
            unsafe {
                column.swap_remove(row);
            }
        }
        if row < last {
            Some(self.entities[row])
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// ArchetypeSet
// ---------------------------------------------------------------------------

/// Owns every archetype, keyed by component mask.
///
/// A given mask appears at most once. Archetypes are created lazily on first
/// demand and never destroyed, so the index returned by
/// [`get_or_create`](ArchetypeSet::get_or_create) stays valid for the
/// lifetime of the set -- all cross-references use indices rather than
/// pointers.
#[derive(Debug, Default)]
pub struct ArchetypeSet {
    archetypes: Vec<Archetype>,
    index: HashMap<ComponentMask, usize>,
}

impl ArchetypeSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The archetype for `mask`, created on first demand.
    pub fn get_or_create(&mut self, mask: ComponentMask, registry: &ComponentRegistry) -> usize {
        if let Some(&index) = self.index.get(&mask) {
            return index;
        }
        trace!(mask = mask.bits(), "creating archetype");
        let index = self.archetypes.len();
        self.archetypes.push(Archetype::new(mask, registry));
        self.index.insert(mask, index);
        index
    }

    /// Index of the archetype for `mask`, if it exists.
    pub fn position_of(&self, mask: ComponentMask) -> Option<usize> {
        self.index.get(&mask).copied()
    }

    /// Whether an archetype exists for `mask`.
    pub fn contains(&self, mask: ComponentMask) -> bool {
        self.index.contains_key(&mask)
    }

    /// The archetype at `index`, if in range.
    pub fn get(&self, index: usize) -> Option<&Archetype> {
        self.archetypes.get(index)
    }

    /// The archetype for `mask`, if it exists.
    pub fn by_mask(&self, mask: ComponentMask) -> Option<&Archetype> {
        self.position_of(mask).map(|index| &self.archetypes[index])
    }

    pub(crate) fn at(&self, index: usize) -> &Archetype {
        &self.archetypes[index]
    }

    pub(crate) fn at_mut(&mut self, index: usize) -> &mut Archetype {
        &mut self.archetypes[index]
    }

    /// Number of archetypes.
    pub fn len(&self) -> usize {
        self.archetypes.len()
    }

    /// Whether the set holds no archetypes.
    pub fn is_empty(&self) -> bool {
        self.archetypes.is_empty()
    }

    /// Iterate archetypes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Archetype> {
        self.archetypes.iter()
    }

    /// Mutable references to two distinct archetypes.
    fn pair_mut(&mut self, a: usize, b: usize) -> (&mut Archetype, &mut Archetype) {
        debug_assert_ne!(a, b);
        if a < b {
            let (lo, hi) = self.archetypes.split_at_mut(b);
            (&mut lo[a], &mut hi[0])
        } else {
            let (lo, hi) = self.archetypes.split_at_mut(a);
            (&mut hi[0], &mut lo[b])
        }
    }

    /// Migrate `entity` from the archetype for `from_mask` to the one for
    /// `to_mask`, patching the entity vectors and the entity table.
    ///
    /// Both archetypes must already exist and the entity must have a
    /// location in the source archetype.
    pub(crate) fn move_entity(
        &mut self,
        entity: Entity,
        from_mask: ComponentMask,
        to_mask: ComponentMask,
        entities: &mut EntityTable,
    ) {
        let from_index = self
            .position_of(from_mask)
            .expect("source archetype exists");
        let to_index = self.position_of(to_mask).expect("target archetype exists");

        let (from, to) = self.pair_mut(from_index, to_index);
        to.grow_row(entity);

        let old = entities
            .location_of(entity)
            .expect("migrating entity has a location");
        debug_assert_eq!(old.archetype, from_index);
        let last = from.len() - 1;

        from.move_row_to(old.row, to);

        if old.row != last {
            // The tail row was swapped into the vacated row; patch its entity
            // handle and table location.
            let swapped = from.entity_at(last);
            from.set_entity(old.row, swapped);
            entities.set_location(
                swapped,
                EntityLocation {
                    archetype: from_index,
                    row: old.row,
                },
            );
        }
        from.pop_entity();

        entities.set_location(
            entity,
            EntityLocation {
                archetype: to_index,
                row: to.len() - 1,
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
