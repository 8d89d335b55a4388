//! Queries over entities by component set.
//!
//! The low-level [`ChunkQuery`] resolves which archetypes satisfy a required
//! [`ComponentMask`] and materializes one [`Chunk`] per match: the starting
//! address of each required column (ascending-bit order) plus the archetype's
//! entity handles. Chunk pointers are valid only until the next structural
//! mutation of the world they were fetched from.
//!
//! The typed layer ([`Query`]/[`QueryItem`] with [`World::query`] and
//! [`World::query_mut`]) walks those chunks and yields
//! `(Entity, (&C1, &C2, ...))` tuples.
//!
//! ## Soundness
//!
//! Read-only queries (`&T`) go through [`World::query`], which takes `&self`.
//! Mutable queries (`&mut T`) go through [`World::query_mut`], which takes
//! `&mut self`, guaranteeing exclusive access to the world and preventing
//! aliasing UB. Structural mutation from inside an iteration is impossible
//! for the same reason: the iterator holds the world borrow.

use std::marker::PhantomData;

use crate::archetype::ArchetypeSet;
use crate::component::{ComponentId, ComponentMask, ComponentRegistry};
use crate::entity::Entity;
use crate::world::World;

// ---------------------------------------------------------------------------
// ChunkQuery -- the raw fetch engine
// ---------------------------------------------------------------------------

/// One matching archetype's slice of the column pool.
#[derive(Debug, Clone, Copy)]
struct ChunkSpan {
    column_start: usize,
    entities: *const Entity,
    len: usize,
}

/// Reusable fetch state: a pool of column pointers plus one span per
/// matching archetype. Clearing and refilling the pool on every
/// [`fetch`](ChunkQuery::fetch) keeps repeated queries allocation-free once
/// the vectors have grown.
#[derive(Debug, Default)]
pub struct ChunkQuery {
    required: ComponentMask,
    columns: Vec<*mut u8>,
    chunks: Vec<ChunkSpan>,
}

impl ChunkQuery {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve chunks for every archetype whose mask is a superset of
    /// `required`, visiting archetypes in insertion order. Previous results
    /// are discarded.
    ///
    /// The recorded pointers are valid until the next structural mutation
    /// (spawn, insert, remove, despawn) of the owning world.
    pub fn fetch(&mut self, archetypes: &ArchetypeSet, required: ComponentMask) {
        self.required = required;
        self.columns.clear();
        self.chunks.clear();

        for archetype in archetypes.iter() {
            if !archetype.mask().contains_all(required) {
                continue;
            }
            let column_start = self.columns.len();
            for id in required.iter() {
                let column = archetype
                    .column(id)
                    .expect("matching archetype stores every required column");
                self.columns.push(column.data_ptr());
            }
            self.chunks.push(ChunkSpan {
                column_start,
                entities: archetype.entities().as_ptr(),
                len: archetype.len(),
            });
        }
    }

    /// The mask this engine last fetched.
    #[inline]
    pub fn required(&self) -> ComponentMask {
        self.required
    }

    /// Number of matching archetypes in the last fetch.
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Iterate the chunks of the last fetch.
    pub fn chunks(&self) -> impl Iterator<Item = Chunk<'_>> + '_ {
        let width = self.required.len();
        self.chunks.iter().map(move |span| Chunk {
            columns: &self.columns[span.column_start..span.column_start + width],
            entities: span.entities,
            len: span.len,
        })
    }
}

/// One matching archetype, as seen by a query.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'q> {
    /// Element-0 address of each required column, ascending-bit order.
    columns: &'q [*mut u8],
    entities: *const Entity,
    len: usize,
}

impl<'q> Chunk<'q> {
    /// Number of rows in this chunk.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the chunk has no rows.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Element-0 addresses of the required columns, in ascending-bit order
    /// of the required mask. The caller reinterprets each as the concrete
    /// component type.
    #[inline]
    pub fn columns(&self) -> &'q [*mut u8] {
        self.columns
    }

    /// The `index`-th required column's base address.
    #[inline]
    pub fn column(&self, index: usize) -> *mut u8 {
        self.columns[index]
    }

    /// Raw pointer to the chunk's entity handles.
    #[inline]
    pub fn entities_ptr(&self) -> *const Entity {
        self.entities
    }

    /// The chunk's entity handles.
    ///
    /// # Safety
    ///
    /// The owning world must not have been structurally mutated since the
    /// fetch that produced this chunk.
    #[inline]
    pub unsafe fn entities(&self) -> &'q [Entity] {
        std::slice::from_raw_parts(self.entities, self.len)
    }
}

// ---------------------------------------------------------------------------
// QueryItem -- one element of a typed query tuple
// ---------------------------------------------------------------------------

/// A single element of a query fetch: `&T` (read) or `&mut T` (write).
pub trait QueryItem {
    /// The output type yielded per row.
    type Item<'w>;
    /// Whether this item borrows mutably.
    const MUTABLE: bool;
    /// The component bit this item reads, if registered.
    fn component_id(registry: &ComponentRegistry) -> Option<ComponentId>;
    /// Produce one reference from a column base address and row index.
    ///
    /// # Safety
    ///
    /// `column` must be the base address of a column of this item's component
    /// type with at least `row + 1` initialized rows, and the caller must
    /// uphold Rust's aliasing rules for the produced reference (mutable items
    /// require exclusive world access).
    unsafe fn fetch<'w>(column: *mut u8, row: usize) -> Self::Item<'w>;
}

impl<T: 'static> QueryItem for &T {
    type Item<'w> = &'w T;
    const MUTABLE: bool = false;

    fn component_id(registry: &ComponentRegistry) -> Option<ComponentId> {
        registry.lookup::<T>()
    }

    unsafe fn fetch<'w>(column: *mut u8, row: usize) -> &'w T {
        &*(column.add(row * std::mem::size_of::<T>()) as *const T)
    }
}

impl<T: 'static> QueryItem for &mut T {
    type Item<'w> = &'w mut T;
    const MUTABLE: bool = true;

    fn component_id(registry: &ComponentRegistry) -> Option<ComponentId> {
        registry.lookup::<T>()
    }

    unsafe fn fetch<'w>(column: *mut u8, row: usize) -> &'w mut T {
        &mut *(column.add(row * std::mem::size_of::<T>()) as *mut T)
    }
}

// ---------------------------------------------------------------------------
// Query -- a tuple of QueryItems
// ---------------------------------------------------------------------------

/// A tuple of query items: `(&A, &B)`, `(&mut A, &B)`, and so on, up to four
/// elements.
pub trait Query {
    /// The per-row output type.
    type Item<'w>;
    /// Whether any item borrows mutably.
    const HAS_MUTABLE: bool;
    /// The component bits accessed, in tuple order. `None` if any component
    /// type is unregistered (such a query matches nothing).
    fn component_ids(registry: &ComponentRegistry) -> Option<Vec<ComponentId>>;
    /// Panic if the tuple requests conflicting access to one component type.
    fn validate_access(registry: &ComponentRegistry);
    /// Fetch one row. `columns` holds one base address per item, in tuple
    /// order.
    ///
    /// # Safety
    ///
    /// See [`QueryItem::fetch`]; additionally `columns.len()` must equal the
    /// tuple arity.
    unsafe fn fetch_row<'w>(columns: &[*mut u8], row: usize) -> Self::Item<'w>;
}

/// Panic if a component bit appears as `&mut T` twice, or as both `&T` and
/// `&mut T`, within one query tuple. Aliasing a mutable borrow is UB, so this
/// is checked before any fetch happens.
fn validate_no_access_conflicts(items: &[(bool, Option<ComponentId>)]) {
    let mut mutable_ids: Vec<ComponentId> = Vec::new();
    let mut read_ids: Vec<ComponentId> = Vec::new();
    for &(is_mutable, id) in items {
        let Some(id) = id else { continue };
        if is_mutable {
            if mutable_ids.contains(&id) {
                panic!("query contains duplicate mutable access to the same component type");
            }
            if read_ids.contains(&id) {
                panic!(
                    "query contains overlapping read and mutable access to the same component type"
                );
            }
            mutable_ids.push(id);
        } else {
            if mutable_ids.contains(&id) {
                panic!(
                    "query contains overlapping read and mutable access to the same component type"
                );
            }
            read_ids.push(id);
        }
    }
}

impl<A: QueryItem> Query for (A,) {
    type Item<'w> = (A::Item<'w>,);
    const HAS_MUTABLE: bool = A::MUTABLE;

    fn component_ids(registry: &ComponentRegistry) -> Option<Vec<ComponentId>> {
        Some(vec![A::component_id(registry)?])
    }

    fn validate_access(_registry: &ComponentRegistry) {
        // A single item cannot conflict with itself.
    }

    unsafe fn fetch_row<'w>(columns: &[*mut u8], row: usize) -> Self::Item<'w> {
        (A::fetch(columns[0], row),)
    }
}

impl<A: QueryItem, B: QueryItem> Query for (A, B) {
    type Item<'w> = (A::Item<'w>, B::Item<'w>);
    const HAS_MUTABLE: bool = A::MUTABLE || B::MUTABLE;

    fn component_ids(registry: &ComponentRegistry) -> Option<Vec<ComponentId>> {
        Some(vec![
            A::component_id(registry)?,
            B::component_id(registry)?,
        ])
    }

    fn validate_access(registry: &ComponentRegistry) {
        validate_no_access_conflicts(&[
            (A::MUTABLE, A::component_id(registry)),
            (B::MUTABLE, B::component_id(registry)),
        ]);
    }

    unsafe fn fetch_row<'w>(columns: &[*mut u8], row: usize) -> Self::Item<'w> {
        (A::fetch(columns[0], row), B::fetch(columns[1], row))
    }
}

impl<A: QueryItem, B: QueryItem, C: QueryItem> Query for (A, B, C) {
    type Item<'w> = (A::Item<'w>, B::Item<'w>, C::Item<'w>);
    const HAS_MUTABLE: bool = A::MUTABLE || B::MUTABLE || C::MUTABLE;

    fn component_ids(registry: &ComponentRegistry) -> Option<Vec<ComponentId>> {
        Some(vec![
            A::component_id(registry)?,
            B::component_id(registry)?,
            C::component_id(registry)?,
        ])
    }

    fn validate_access(registry: &ComponentRegistry) {
        validate_no_access_conflicts(&[
            (A::MUTABLE, A::component_id(registry)),
            (B::MUTABLE, B::component_id(registry)),
            (C::MUTABLE, C::component_id(registry)),
        ]);
    }

    unsafe fn fetch_row<'w>(columns: &[*mut u8], row: usize) -> Self::Item<'w> {
        (
            A::fetch(columns[0], row),
            B::fetch(columns[1], row),
            C::fetch(columns[2], row),
        )
    }
}

impl<A: QueryItem, B: QueryItem, C: QueryItem, D: QueryItem> Query for (A, B, C, D) {
    type Item<'w> = (A::Item<'w>, B::Item<'w>, C::Item<'w>, D::Item<'w>);
    const HAS_MUTABLE: bool = A::MUTABLE || B::MUTABLE || C::MUTABLE || D::MUTABLE;

    fn component_ids(registry: &ComponentRegistry) -> Option<Vec<ComponentId>> {
        Some(vec![
            A::component_id(registry)?,
            B::component_id(registry)?,
            C::component_id(registry)?,
            D::component_id(registry)?,
        ])
    }

    fn validate_access(registry: &ComponentRegistry) {
        validate_no_access_conflicts(&[
            (A::MUTABLE, A::component_id(registry)),
            (B::MUTABLE, B::component_id(registry)),
            (C::MUTABLE, C::component_id(registry)),
            (D::MUTABLE, D::component_id(registry)),
        ]);
    }

    unsafe fn fetch_row<'w>(columns: &[*mut u8], row: usize) -> Self::Item<'w> {
        (
            A::fetch(columns[0], row),
            B::fetch(columns[1], row),
            C::fetch(columns[2], row),
            D::fetch(columns[3], row),
        )
    }
}

// ---------------------------------------------------------------------------
// Typed iteration
// ---------------------------------------------------------------------------

/// One chunk with its column base addresses rearranged into tuple order.
struct TypedChunk {
    columns: Vec<*mut u8>,
    entities: *const Entity,
    len: usize,
}

/// Resolve matching chunks for `Q` and rearrange each chunk's ascending-bit
/// column pool into tuple order.
fn typed_chunks<Q: Query>(world: &World) -> Vec<TypedChunk> {
    let Some(ids) = Q::component_ids(world.registry()) else {
        return Vec::new();
    };
    let mut required = ComponentMask::EMPTY;
    for id in &ids {
        required.insert(*id);
    }

    let mut engine = ChunkQuery::new();
    engine.fetch(world.archetypes(), required);

    let ranks: Vec<usize> = ids
        .iter()
        .map(|id| required.index_of(*id).expect("id was inserted into the mask"))
        .collect();

    engine
        .chunks()
        .map(|chunk| TypedChunk {
            columns: ranks.iter().map(|&rank| chunk.column(rank)).collect(),
            entities: chunk.entities_ptr(),
            len: chunk.len(),
        })
        .collect()
}

/// Iterator yielding `(Entity, Q::Item)` for every matching row.
/// Produced by [`World::query`]; the shared world borrow keeps the recorded
/// pointers valid for the iterator's lifetime.
pub struct QueryIter<'w, Q: Query> {
    chunks: Vec<TypedChunk>,
    chunk_cursor: usize,
    row_cursor: usize,
    _world: PhantomData<&'w World>,
    _query: PhantomData<Q>,
}

impl<'w, Q: Query> Iterator for QueryIter<'w, Q> {
    type Item = (Entity, Q::Item<'w>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let chunk = self.chunks.get(self.chunk_cursor)?;
            if self.row_cursor < chunk.len {
                let row = self.row_cursor;
                self.row_cursor += 1;
                #[allow(unsafe_code)]
                unsafe {
                    let entity = *chunk.entities.add(row);
                    return Some((entity, Q::fetch_row(&chunk.columns, row)));
                }
            }
            self.chunk_cursor += 1;
            self.row_cursor = 0;
        }
    }
}

/// Iterator yielding `(Entity, Q::Item)` for every matching row, with
/// mutable items allowed. Produced by [`World::query_mut`]; the exclusive
/// world borrow makes handing out `&mut T` sound.
pub struct QueryIterMut<'w, Q: Query> {
    chunks: Vec<TypedChunk>,
    chunk_cursor: usize,
    row_cursor: usize,
    _world: PhantomData<&'w mut World>,
    _query: PhantomData<Q>,
}

impl<'w, Q: Query> Iterator for QueryIterMut<'w, Q> {
    type Item = (Entity, Q::Item<'w>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let chunk = self.chunks.get(self.chunk_cursor)?;
            if self.row_cursor < chunk.len {
                let row = self.row_cursor;
                self.row_cursor += 1;
                #[allow(unsafe_code)]
                unsafe {
                    let entity = *chunk.entities.add(row);
                    return Some((entity, Q::fetch_row(&chunk.columns, row)));
                }
            }
            self.chunk_cursor += 1;
            self.row_cursor = 0;
        }
    }
}

// ---------------------------------------------------------------------------
// World query methods
// ---------------------------------------------------------------------------

impl World {
    /// Run a read-only query over all matching entities.
    ///
    /// # Panics
    ///
    /// Panics if the query tuple contains `&mut T` items; use
    /// [`query_mut`](Self::query_mut) for those.
    ///
    /// ```ignore
    /// for (entity, (pos, vel)) in world.query::<(&Pos, &Vel)>() {
    ///     println!("{entity}: {pos:?} {vel:?}");
    /// }
    /// ```
    pub fn query<Q: Query>(&self) -> QueryIter<'_, Q> {
        assert!(
            !Q::HAS_MUTABLE,
            "World::query() cannot be used with mutable query items (&mut T). \
             Use World::query_mut() instead, which requires &mut self."
        );
        QueryIter {
            chunks: typed_chunks::<Q>(self),
            chunk_cursor: 0,
            row_cursor: 0,
            _world: PhantomData,
            _query: PhantomData,
        }
    }

    /// Run a query that may mutate components. Takes `&mut self`, so no other
    /// access to the world can exist while the iterator lives.
    ///
    /// # Panics
    ///
    /// Panics if the same component type is requested as `&mut T` twice, or
    /// as both `&T` and `&mut T`.
    ///
    /// ```ignore
    /// for (_entity, (pos, vel)) in world.query_mut::<(&mut Pos, &Vel)>() {
    ///     pos.x += vel.dx;
    /// }
    /// ```
    pub fn query_mut<Q: Query>(&mut self) -> QueryIterMut<'_, Q> {
        Q::validate_access(self.registry());
        QueryIterMut {
            chunks: typed_chunks::<Q>(self),
            chunk_cursor: 0,
            row_cursor: 0,
            _world: PhantomData,
            _query: PhantomData,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
