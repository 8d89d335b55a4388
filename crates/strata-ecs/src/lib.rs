//! Strata ECS -- archetype-based entity component storage.
//!
//! Entities sharing the same component set are grouped into archetypes --
//! columnar tables with one type-erased [`BlobColumn`](column::BlobColumn)
//! per component -- for cache-friendly iteration. Component types are keyed
//! by single-bit identifiers, so a component set is a plain `u64` bitmask and
//! query matching is a pair of bitwise ops. Generational entity handles give
//! immediate stale-reference detection.
//!
//! # Quick Start
//!
//! ```
//! use strata_ecs::prelude::*;
//!
//! #[derive(Debug, PartialEq)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, PartialEq)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! let mut world = World::new();
//! world.register_component::<Position>("position");
//! world.register_component::<Velocity>("velocity");
//!
//! let mut bundle = Bundle::new();
//! bundle.add(world.registry(), Position { x: 0.0, y: 0.0 });
//! bundle.add(world.registry(), Velocity { dx: 1.0, dy: 0.0 });
//! let entity = world.spawn_bundle(bundle);
//!
//! for (_entity, (position, velocity)) in world.query_mut::<(&mut Position, &Velocity)>() {
//!     position.x += velocity.dx;
//! }
//!
//! assert_eq!(world.get_component::<Position>(entity), Some(&Position { x: 1.0, y: 0.0 }));
//! ```

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod archetype;
#[allow(unsafe_code)]
pub mod bundle;
#[allow(unsafe_code)]
pub mod column;
pub mod component;
pub mod entity;
#[allow(unsafe_code)]
pub mod query;
#[allow(unsafe_code)]
pub mod world;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by world operations.
///
/// These all represent caller contract violations; there are no recoverable
/// failure modes inside the storage engine itself.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The entity handle is stale (its slot's generation moved on) or was
    /// never allocated.
    #[error("entity {entity} is not alive (stale generation or never spawned)")]
    NotAlive {
        /// The offending handle.
        entity: entity::Entity,
    },

    /// A component type was referenced that has not been registered.
    #[error("component type '{name}' is not registered")]
    UnknownComponent {
        /// Rust type name or caller-supplied name of the component.
        name: String,
    },

    /// The entity does not have the requested component.
    #[error("entity {entity} has no '{name}' component")]
    MissingComponent {
        /// The queried entity.
        entity: entity::Entity,
        /// Registered name of the component.
        name: String,
    },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::archetype::{Archetype, ArchetypeSet};
    pub use crate::bundle::Bundle;
    pub use crate::column::{BlobColumn, ComponentVtable};
    pub use crate::component::{ComponentId, ComponentInfo, ComponentMask, ComponentRegistry};
    pub use crate::entity::{Entity, EntityLocation, EntityTable};
    pub use crate::query::{Chunk, ChunkQuery, Query, QueryItem, QueryIter, QueryIterMut};
    pub use crate::world::World;
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    struct A(i32);

    #[derive(Debug, PartialEq)]
    struct B(i32);

    #[derive(Debug, PartialEq)]
    struct C(i32);

    /// Registration order fixes the bit assignment: A=1, B=2, C=4.
    fn setup_world() -> World {
        let mut world = World::new();
        world.register_component::<A>("a");
        world.register_component::<B>("b");
        world.register_component::<C>("c");
        world
    }

    fn spawn_ab(world: &mut World, a: i32, b: i32) -> Entity {
        let mut bundle = Bundle::new();
        bundle.add(world.registry(), A(a));
        bundle.add(world.registry(), B(b));
        world.spawn_bundle(bundle)
    }

    #[test]
    fn registration_order_assigns_ascending_bits() {
        let world = setup_world();
        assert_eq!(world.registry().lookup::<A>().unwrap().bit(), 0b001);
        assert_eq!(world.registry().lookup::<B>().unwrap().bit(), 0b010);
        assert_eq!(world.registry().lookup::<C>().unwrap().bit(), 0b100);
    }

    #[test]
    fn spawn_then_iterate_one_chunk() {
        let mut world = setup_world();
        spawn_ab(&mut world, 10, 10);
        spawn_ab(&mut world, 10, 10);

        let a_bit = world.registry().lookup::<A>().unwrap();
        let b_bit = world.registry().lookup::<B>().unwrap();
        let mask = ComponentMask::from(a_bit).union(ComponentMask::from(b_bit));

        let chunks = world.fetch(mask);
        assert_eq!(chunks.chunk_count(), 1);

        let rows: Vec<_> = world
            .query::<(&A, &B)>()
            .map(|(_, (a, b))| (a.0, b.0))
            .collect();
        assert_eq!(rows, vec![(10, 10), (10, 10)]);
    }

    #[test]
    fn insert_triggers_migration() {
        let mut world = setup_world();
        let _first = spawn_ab(&mut world, 10, 10);
        let e = spawn_ab(&mut world, 10, 10);

        let ab_mask = world.mask_of(e);
        assert_eq!(ab_mask.bits(), 0b011);
        let ab_index = world.archetypes().position_of(ab_mask).unwrap();
        let location = world.location_of(e).unwrap();
        assert_eq!(location.archetype, ab_index);
        assert_eq!(location.row, 1);

        world.insert_component(e, C(10)).unwrap();

        // The entity now lives at row 0 of the wider archetype.
        let abc_mask = world.mask_of(e);
        assert_eq!(abc_mask.bits(), 0b111);
        let abc_index = world.archetypes().position_of(abc_mask).unwrap();
        let location = world.location_of(e).unwrap();
        assert_eq!(location.archetype, abc_index);
        assert_eq!(location.row, 0);

        // The source archetype kept only the first entity, at row 0.
        assert_eq!(world.archetypes().by_mask(ab_mask).unwrap().len(), 1);
    }

    #[test]
    fn despawn_reuses_index_with_bumped_generation() {
        let mut world = setup_world();
        let _e0 = spawn_ab(&mut world, 10, 10);
        let e = spawn_ab(&mut world, 10, 10);
        assert_eq!(e.index(), 1);
        assert_eq!(e.generation(), 0);

        world.despawn(e).unwrap();
        assert!(!world.is_alive(e));

        let e2 = spawn_ab(&mut world, 10, 10);
        assert_eq!(e2.index(), 1, "freed index is recycled");
        assert_eq!(e2.generation(), 1, "slot generation was bumped on despawn");
        assert!(world.is_alive(e2));
        assert!(!world.is_alive(e), "old handle stays stale after reuse");
    }

    #[test]
    fn full_traversal_visits_every_entity_once() {
        let mut world = setup_world();
        let e1 = spawn_ab(&mut world, 10, 10);
        let e2 = spawn_ab(&mut world, 10, 10);
        world.insert_component(e1, C(10)).unwrap();
        world.insert_component(e2, C(10)).unwrap();

        let mut visited = Vec::new();
        for (entity, (a, b, c)) in world.query::<(&A, &B, &C)>() {
            assert_eq!((a.0, b.0, c.0), (10, 10, 10));
            visited.push(entity);
        }
        visited.sort_by_key(|e| e.index());
        let mut expected = vec![e1, e2];
        expected.sort_by_key(|e| e.index());
        assert_eq!(visited, expected);
    }

    #[test]
    fn remove_restores_prior_archetype() {
        let mut world = setup_world();
        let e = spawn_ab(&mut world, 10, 10);
        world.insert_component(e, C(10)).unwrap();
        assert_eq!(world.mask_of(e).bits(), 0b111);

        world.remove_component::<C>(e).unwrap();
        assert_eq!(world.mask_of(e).bits(), 0b011);
        assert!(!world.has_component::<C>(e));
        assert_eq!(world.get_component::<C>(e), None);
        assert_eq!(world.get_component::<A>(e), Some(&A(10)));
        assert_eq!(world.get_component::<B>(e), Some(&B(10)));
    }

    #[test]
    fn removed_component_destructor_runs_exactly_once() {
        let counter = Arc::new(AtomicUsize::new(0));

        #[derive(Debug)]
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut world = setup_world();
        world.register_component::<Tracked>("tracked");
        let e = spawn_ab(&mut world, 1, 2);
        world
            .insert_component(e, Tracked(counter.clone()))
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        world.remove_component::<Tracked>(e).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Nothing further is dropped when the entity or world goes away.
        world.despawn(e).unwrap();
        drop(world);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn destructor_balance_across_lifecycle() {
        let counter = Arc::new(AtomicUsize::new(0));

        #[derive(Debug)]
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut world = World::new();
        world.register_component::<Tracked>("tracked");
        world.register_component::<A>("a");

        let e0 = world.spawn_with(Tracked(counter.clone()));
        let e1 = world.spawn_with(Tracked(counter.clone()));
        let e2 = world.spawn_with(Tracked(counter.clone()));

        // Migration moves values without destroying them.
        world.insert_component(e0, A(1)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        world.remove_component::<Tracked>(e1).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        world.despawn(e2).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        drop(world);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn swap_remove_moves_tail_entity_into_gap() {
        let mut world = setup_world();
        let e0 = spawn_ab(&mut world, 0, 0);
        let e1 = spawn_ab(&mut world, 1, 1);
        let e2 = spawn_ab(&mut world, 2, 2);

        // Removing e0's components vacates row 0; e2 (the tail) moves there.
        let mask = world.mask_of(e0);
        world.remove_mask(e0, mask).unwrap();

        let archetype = world.archetypes().by_mask(mask).unwrap();
        assert_eq!(archetype.len(), 2);
        assert_eq!(archetype.entity_at(0), e2);
        assert_eq!(archetype.entity_at(1), e1);
        assert_eq!(world.location_of(e2).unwrap().row, 0);
        assert_eq!(world.get_component::<A>(e2), Some(&A(2)));
    }

    #[test]
    fn row_entity_correspondence_after_mutations() {
        let mut world = setup_world();
        let mut entities = Vec::new();
        for i in 0..8 {
            entities.push(spawn_ab(&mut world, i, -i));
        }
        world.insert_component(entities[2], C(0)).unwrap();
        world.insert_component(entities[5], C(0)).unwrap();
        world.remove_component::<B>(entities[0]).unwrap();
        world.despawn(entities[7]).unwrap();

        // Every archetype row points back at an entity whose recorded
        // location is exactly that row.
        for (index, archetype) in world.archetypes().iter().enumerate() {
            for row in 0..archetype.len() {
                let entity = archetype.entity_at(row);
                let location = world.location_of(entity).unwrap();
                assert_eq!(location.archetype, index);
                assert_eq!(location.row, row);
            }
        }
    }

    #[test]
    fn bitmask_matching_is_superset_matching() {
        let mut world = setup_world();
        spawn_ab(&mut world, 1, 1); // {A, B}
        world.spawn_with(A(1)); // {A}
        let e = spawn_ab(&mut world, 2, 2);
        world.insert_component(e, C(2)).unwrap(); // {A, B, C}

        let a_bit = world.registry().lookup::<A>().unwrap();
        let b_bit = world.registry().lookup::<B>().unwrap();
        let required = ComponentMask::from(a_bit).union(ComponentMask::from(b_bit));

        let chunks = world.fetch(required);
        for (chunk, archetype) in chunks
            .chunks()
            .zip(world.archetypes().iter().filter(|a| a.mask().contains_all(required)))
        {
            assert_eq!(chunk.len(), archetype.len());
        }
        // {A,B} and {A,B,C} match; {A} does not.
        assert_eq!(chunks.chunk_count(), 2);
    }
}
