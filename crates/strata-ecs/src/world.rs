//! The [`World`] is the top-level container for the ECS. It owns the entity
//! table, the component registry, and all archetype storage, and implements
//! the structural-mutation protocol: spawning, bundled insert, bundled
//! remove, and despawn, each migrating entities between archetypes as their
//! component set changes.

use std::ptr::NonNull;

use tracing::debug;

use crate::archetype::ArchetypeSet;
use crate::bundle::Bundle;
use crate::column::ComponentVtable;
use crate::component::{ComponentId, ComponentMask, ComponentRegistry};
use crate::entity::{Entity, EntityLocation, EntityTable};
use crate::EcsError;

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// The top-level ECS container.
///
/// Single-threaded and non-reentrant: every public operation completes before
/// returning, and structural mutations invalidate any chunk pointers handed
/// out by earlier fetches. Cross-thread sharing is the caller's concern.
pub struct World {
    entities: EntityTable,
    registry: ComponentRegistry,
    archetypes: ArchetypeSet,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("entity_count", &self.entities.alive_count())
            .field("archetype_count", &self.archetypes.len())
            .finish()
    }
}

impl World {
    /// Create a new, empty world.
    pub fn new() -> Self {
        Self {
            entities: EntityTable::new(),
            registry: ComponentRegistry::new(),
            archetypes: ArchetypeSet::new(),
        }
    }

    /// Read-only access to the component registry.
    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// Read-only access to the archetype storage.
    pub fn archetypes(&self) -> &ArchetypeSet {
        &self.archetypes
    }

    // -- registration --------------------------------------------------------

    /// Register a Rust component type under `name`, assigning its bit.
    ///
    /// # Panics
    ///
    /// Panics if the type or name is already registered, or if the 64-bit
    /// component budget is exhausted.
    pub fn register_component<T: Send + Sync + 'static>(&mut self, name: &str) -> ComponentId {
        let id = self.registry.register::<T>(name);
        debug!(name, bit = id.bit_index(), "registered component");
        id
    }

    /// Register a component from a caller-supplied vtable (no Rust type
    /// attached). Access goes through the returned bit.
    pub fn register_raw(&mut self, name: &str, vtable: ComponentVtable) -> ComponentId {
        let id = self.registry.register_raw(name, vtable);
        debug!(name, bit = id.bit_index(), "registered erased component");
        id
    }

    // -- entity lifecycle ----------------------------------------------------

    /// Create a live entity with no components (and no location).
    pub fn spawn_empty(&mut self) -> Entity {
        self.entities.create()
    }

    /// Create an entity and insert the bundle's components atomically.
    pub fn spawn_bundle(&mut self, bundle: Bundle<'_>) -> Entity {
        let entity = self.entities.create();
        self.insert_bundle(entity, bundle)
            .expect("freshly created entity is alive");
        entity
    }

    /// Create an entity with a single component.
    pub fn spawn_with<T: Send + Sync + 'static>(&mut self, component: T) -> Entity {
        let mut bundle = Bundle::new();
        bundle.add(&self.registry, component);
        self.spawn_bundle(bundle)
    }

    /// Insert the bundle's components on `entity`, overwriting values the
    /// entity already has and migrating it to a wider archetype if its
    /// component set grows. An empty bundle is a no-op.
    ///
    /// # Errors
    ///
    /// [`EcsError::NotAlive`] if `entity`'s handle is stale.
    pub fn insert_bundle(&mut self, entity: Entity, bundle: Bundle<'_>) -> Result<(), EcsError> {
        if !self.entities.is_alive(entity) {
            return Err(EcsError::NotAlive { entity });
        }
        if bundle.is_empty() {
            return Ok(());
        }

        let old_mask = match self.entities.location_of(entity) {
            Some(location) => self.archetypes.at(location.archetype).mask(),
            None => ComponentMask::EMPTY,
        };
        let target_mask = old_mask.union(bundle.mask());
        let target_index = self.archetypes.get_or_create(target_mask, &self.registry);

        if target_mask != old_mask {
            if self.entities.is_empty(entity) {
                // First components for this entity: no source row to migrate.
                let target = self.archetypes.at_mut(target_index);
                target.grow_row(entity);
                self.entities.set_location(
                    entity,
                    EntityLocation {
                        archetype: target_index,
                        row: target.len() - 1,
                    },
                );
            } else {
                self.archetypes
                    .move_entity(entity, old_mask, target_mask, &mut self.entities);
            }
        }

        let location = self
            .entities
            .location_of(entity)
            .expect("entity was placed in the target archetype");
        let target = self.archetypes.at_mut(target_index);
        bundle.transfer(|id, bytes| {
            let column = target
                .column_mut(id)
                .expect("target archetype stores every bundle component");
            #[allow(unsafe_code)]
            unsafe {
                if old_mask.contains(id) {
                    // The migrated value is initialized; destroy it first.
                    column.replace(location.row, bytes);
                } else {
                    // Slot was reserved by grow and is still uninitialized.
                    column.set(location.row, bytes);
                }
            }
        });
        Ok(())
    }

    /// Insert a single component on `entity`.
    ///
    /// # Errors
    ///
    /// [`EcsError::NotAlive`] if `entity`'s handle is stale.
    pub fn insert_component<T: Send + Sync + 'static>(
        &mut self,
        entity: Entity,
        component: T,
    ) -> Result<(), EcsError> {
        let mut bundle = Bundle::new();
        bundle.add(&self.registry, component);
        self.insert_bundle(entity, bundle)
    }

    /// Drop the listed components from `entity`, migrating it to a narrower
    /// archetype. Bits the entity does not have are silently ignored; if
    /// nothing changes, this is a no-op. Removing the last component leaves
    /// the entity in the empty archetype (mask 0), still located.
    ///
    /// # Errors
    ///
    /// [`EcsError::NotAlive`] if `entity`'s handle is stale.
    pub fn remove_mask(&mut self, entity: Entity, mask: ComponentMask) -> Result<(), EcsError> {
        if !self.entities.is_alive(entity) {
            return Err(EcsError::NotAlive { entity });
        }
        let Some(location) = self.entities.location_of(entity) else {
            return Ok(()); // No components to remove.
        };
        let old_mask = self.archetypes.at(location.archetype).mask();
        let target_mask = old_mask.difference(mask);
        if target_mask == old_mask {
            return Ok(()); // None of the bits are present.
        }
        self.archetypes.get_or_create(target_mask, &self.registry);
        self.archetypes
            .move_entity(entity, old_mask, target_mask, &mut self.entities);
        Ok(())
    }

    /// Drop a single component type from `entity`.
    ///
    /// # Errors
    ///
    /// [`EcsError::NotAlive`] if the handle is stale,
    /// [`EcsError::UnknownComponent`] if `T` was never registered.
    pub fn remove_component<T: Send + Sync + 'static>(
        &mut self,
        entity: Entity,
    ) -> Result<(), EcsError> {
        let id = self
            .registry
            .lookup::<T>()
            .ok_or_else(|| EcsError::UnknownComponent {
                name: std::any::type_name::<T>().to_owned(),
            })?;
        self.remove_mask(entity, ComponentMask::from(id))
    }

    /// Destroy `entity`: every component is dropped, the handle goes stale,
    /// and the index is queued for reuse.
    ///
    /// # Errors
    ///
    /// [`EcsError::NotAlive`] if the handle is already stale.
    pub fn despawn(&mut self, entity: Entity) -> Result<(), EcsError> {
        if !self.entities.is_alive(entity) {
            return Err(EcsError::NotAlive { entity });
        }
        if let Some(location) = self.entities.location_of(entity) {
            let archetype = self.archetypes.at_mut(location.archetype);
            if let Some(swapped) = archetype.remove_row(location.row) {
                self.entities.set_location(
                    swapped,
                    EntityLocation {
                        archetype: location.archetype,
                        row: location.row,
                    },
                );
            }
            self.entities.clear_location(entity);
        }
        self.entities.despawn(entity);
        Ok(())
    }

    // -- component access ----------------------------------------------------

    /// Immutable reference to a component on a live entity.
    pub fn get_component<T: 'static>(&self, entity: Entity) -> Option<&T> {
        if !self.entities.is_alive(entity) {
            return None;
        }
        let location = self.entities.location_of(entity)?;
        let id = self.registry.lookup::<T>()?;
        let column = self.archetypes.at(location.archetype).column(id)?;
        #[allow(unsafe_code)]
        unsafe {
            Some(&*(column.get(location.row) as *const T))
        }
    }

    /// Mutable reference to a component on a live entity.
    pub fn get_component_mut<T: 'static>(&mut self, entity: Entity) -> Option<&mut T> {
        if !self.entities.is_alive(entity) {
            return None;
        }
        let location = self.entities.location_of(entity)?;
        let id = self.registry.lookup::<T>()?;
        let column = self.archetypes.at_mut(location.archetype).column_mut(id)?;
        #[allow(unsafe_code)]
        unsafe {
            Some(&mut *(column.get_mut(location.row) as *mut T))
        }
    }

    /// Whether a live entity has a component of type `T`.
    pub fn has_component<T: 'static>(&self, entity: Entity) -> bool {
        let Some(id) = self.registry.lookup::<T>() else {
            return false;
        };
        self.mask_of(entity).contains(id)
    }

    /// The component set of a live entity (empty for stale handles and
    /// component-less entities).
    pub fn mask_of(&self, entity: Entity) -> ComponentMask {
        if !self.entities.is_alive(entity) {
            return ComponentMask::EMPTY;
        }
        match self.entities.location_of(entity) {
            Some(location) => self.archetypes.at(location.archetype).mask(),
            None => ComponentMask::EMPTY,
        }
    }

    /// Raw byte pointer to a component value, for callers that work through
    /// bits rather than Rust types. The pointer is valid until the next
    /// structural mutation.
    ///
    /// # Errors
    ///
    /// [`EcsError::NotAlive`] if the handle is stale,
    /// [`EcsError::MissingComponent`] if the entity does not have the bit.
    pub fn component_ptr(
        &mut self,
        entity: Entity,
        id: ComponentId,
    ) -> Result<NonNull<u8>, EcsError> {
        if !self.entities.is_alive(entity) {
            return Err(EcsError::NotAlive { entity });
        }
        let missing = || EcsError::MissingComponent {
            entity,
            name: self
                .registry
                .info(id)
                .map(|info| info.name.clone())
                .unwrap_or_else(|| format!("{id:?}")),
        };
        let location = self.entities.location_of(entity).ok_or_else(missing)?;
        let archetype = self.archetypes.at_mut(location.archetype);
        if !archetype.has_component(id) {
            return Err(missing());
        }
        let column = archetype.column_mut(id).expect("bit checked above");
        #[allow(unsafe_code)]
        let ptr = unsafe { column.get_mut(location.row) };
        Ok(NonNull::new(ptr).expect("column pointers are never null"))
    }

    // -- observers -----------------------------------------------------------

    /// Whether `entity`'s handle matches its slot's current generation.
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    /// The entity's current storage location, regardless of aliveness.
    pub fn location_of(&self, entity: Entity) -> Option<EntityLocation> {
        self.entities.location_of(entity)
    }

    /// Number of currently alive entities.
    pub fn entity_count(&self) -> usize {
        self.entities.alive_count()
    }

    /// Number of archetypes created so far.
    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    /// Resolve chunks for every archetype containing `required`; see
    /// [`ChunkQuery::fetch`](crate::query::ChunkQuery::fetch).
    pub fn fetch(&self, required: ComponentMask) -> crate::query::ChunkQuery {
        let mut query = crate::query::ChunkQuery::new();
        query.fetch(&self.archetypes, required);
        query
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Pos {
        x: f32,
        y: f32,
    }

    #[derive(Debug, PartialEq)]
    struct Vel {
        dx: f32,
        dy: f32,
    }

    #[derive(Debug, PartialEq)]
    struct Health(u32);

    fn setup_world() -> World {
        let mut world = World::new();
        world.register_component::<Pos>("position");
        world.register_component::<Vel>("velocity");
        world.register_component::<Health>("health");
        world
    }

    #[test]
    fn spawn_and_get() {
        let mut world = setup_world();
        let mut bundle = Bundle::new();
        bundle.add(world.registry(), Pos { x: 1.0, y: 2.0 });
        bundle.add(world.registry(), Vel { dx: 3.0, dy: 4.0 });
        let e = world.spawn_bundle(bundle);

        assert_eq!(world.get_component::<Pos>(e), Some(&Pos { x: 1.0, y: 2.0 }));
        assert_eq!(
            world.get_component::<Vel>(e),
            Some(&Vel { dx: 3.0, dy: 4.0 })
        );
        assert!(!world.has_component::<Health>(e));
    }

    #[test]
    fn spawn_empty_has_no_location() {
        let mut world = setup_world();
        let e = world.spawn_empty();
        assert!(world.is_alive(e));
        assert_eq!(world.location_of(e), None);
        assert_eq!(world.entity_count(), 1);
    }

    #[test]
    fn despawn_removes_entity() {
        let mut world = setup_world();
        let e = world.spawn_with(Pos { x: 0.0, y: 0.0 });
        assert!(world.is_alive(e));
        world.despawn(e).unwrap();
        assert!(!world.is_alive(e));
        assert_eq!(world.get_component::<Pos>(e), None);
        assert_eq!(world.entity_count(), 0);
    }

    #[test]
    fn despawn_stale_handle_errors() {
        let mut world = setup_world();
        let e = world.spawn_with(Pos { x: 0.0, y: 0.0 });
        world.despawn(e).unwrap();
        assert!(matches!(
            world.despawn(e),
            Err(EcsError::NotAlive { .. })
        ));
    }

    #[test]
    fn insert_component_migrates_archetype() {
        let mut world = setup_world();
        let e = world.spawn_with(Pos { x: 1.0, y: 2.0 });
        let before = world.archetype_count();

        world.insert_component(e, Vel { dx: 5.0, dy: 6.0 }).unwrap();

        assert!(world.has_component::<Vel>(e));
        assert_eq!(world.get_component::<Pos>(e), Some(&Pos { x: 1.0, y: 2.0 }));
        assert!(world.archetype_count() > before);
    }

    #[test]
    fn insert_overwrites_existing_value() {
        let mut world = setup_world();
        let e = world.spawn_with(Pos { x: 1.0, y: 2.0 });
        world
            .insert_component(e, Pos { x: 99.0, y: 100.0 })
            .unwrap();
        assert_eq!(
            world.get_component::<Pos>(e),
            Some(&Pos { x: 99.0, y: 100.0 })
        );
        // No migration happened: the component set is unchanged.
        assert_eq!(world.archetype_count(), 1);
    }

    #[test]
    fn insert_on_stale_entity_errors() {
        let mut world = setup_world();
        let e = world.spawn_with(Pos { x: 0.0, y: 0.0 });
        world.despawn(e).unwrap();
        assert!(world.insert_component(e, Vel { dx: 1.0, dy: 1.0 }).is_err());
    }

    #[test]
    fn remove_component_migrates_archetype() {
        let mut world = setup_world();
        let mut bundle = Bundle::new();
        bundle.add(world.registry(), Pos { x: 1.0, y: 2.0 });
        bundle.add(world.registry(), Vel { dx: 3.0, dy: 4.0 });
        let e = world.spawn_bundle(bundle);

        world.remove_component::<Vel>(e).unwrap();
        assert!(!world.has_component::<Vel>(e));
        assert_eq!(world.get_component::<Pos>(e), Some(&Pos { x: 1.0, y: 2.0 }));
    }

    #[test]
    fn remove_absent_component_is_a_noop() {
        let mut world = setup_world();
        let e = world.spawn_with(Pos { x: 1.0, y: 2.0 });
        let before = world.archetype_count();
        world.remove_component::<Vel>(e).unwrap();
        assert_eq!(world.archetype_count(), before);
        assert_eq!(world.get_component::<Pos>(e), Some(&Pos { x: 1.0, y: 2.0 }));
    }

    #[test]
    fn remove_last_component_parks_entity_in_empty_archetype() {
        let mut world = setup_world();
        let e = world.spawn_with(Pos { x: 1.0, y: 2.0 });
        world.remove_component::<Pos>(e).unwrap();

        let location = world.location_of(e).expect("still located");
        assert_eq!(
            world.archetypes().at(location.archetype).mask(),
            ComponentMask::EMPTY
        );
        assert_eq!(world.mask_of(e), ComponentMask::EMPTY);

        // And it can pick components back up from there.
        world.insert_component(e, Health(3)).unwrap();
        assert_eq!(world.get_component::<Health>(e), Some(&Health(3)));
    }

    #[test]
    fn get_component_mut_modifies() {
        let mut world = setup_world();
        let e = world.spawn_with(Pos { x: 0.0, y: 0.0 });
        if let Some(pos) = world.get_component_mut::<Pos>(e) {
            pos.x = 42.0;
        }
        assert_eq!(
            world.get_component::<Pos>(e),
            Some(&Pos { x: 42.0, y: 0.0 })
        );
    }

    #[test]
    fn component_ptr_checks_presence() {
        let mut world = setup_world();
        let e = world.spawn_with(Pos { x: 8.0, y: 9.0 });
        let pos_id = world.registry().lookup::<Pos>().unwrap();
        let vel_id = world.registry().lookup::<Vel>().unwrap();

        let ptr = world.component_ptr(e, pos_id).unwrap();
        #[allow(unsafe_code)]
        let pos = unsafe { &*(ptr.as_ptr() as *const Pos) };
        assert_eq!(pos, &Pos { x: 8.0, y: 9.0 });

        assert!(matches!(
            world.component_ptr(e, vel_id),
            Err(EcsError::MissingComponent { .. })
        ));
    }

    #[test]
    fn entity_count_tracks_spawns_and_despawns() {
        let mut world = setup_world();
        assert_eq!(world.entity_count(), 0);
        let e1 = world.spawn_with(Pos { x: 0.0, y: 0.0 });
        let _e2 = world.spawn_with(Pos { x: 1.0, y: 1.0 });
        assert_eq!(world.entity_count(), 2);
        world.despawn(e1).unwrap();
        assert_eq!(world.entity_count(), 1);
    }

    #[test]
    fn erased_registration_roundtrip() {
        let mut world = World::new();
        let id = world.register_raw(
            "opaque_pair",
            ComponentVtable::of::<[u32; 2]>(),
        );
        assert_eq!(world.registry().lookup_by_name("opaque_pair"), Some(id));

        let e = world.spawn_empty();
        let value: [u32; 2] = [17, 34];
        let bytes = {
            #[allow(unsafe_code)]
            let slice = unsafe {
                std::slice::from_raw_parts(
                    value.as_ptr() as *const u8,
                    std::mem::size_of::<[u32; 2]>(),
                )
            };
            slice
        };
        #[allow(unsafe_code)]
        let bundle =
            unsafe { Bundle::from_packed_bytes(world.registry(), ComponentMask::from(id), bytes) };
        world.insert_bundle(e, bundle).unwrap();

        let ptr = world.component_ptr(e, id).unwrap();
        #[allow(unsafe_code)]
        let stored = unsafe { *(ptr.as_ptr() as *const [u32; 2]) };
        assert_eq!(stored, [17, 34]);
    }
}
