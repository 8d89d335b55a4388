//! Transient component bundles.
//!
//! A [`Bundle`] carries one value for each component in its mask, packed into
//! a contiguous byte buffer in ascending-bit order with no inter-element
//! padding. Bundles are consumed by exactly one transfer into an archetype;
//! an owned bundle that is never transferred destroys its remaining values on
//! drop, while a borrowed bundle never touches the caller-managed buffer.
//!
//! Because the buffer is packed, interior pointers are generally unaligned
//! and must never be dereferenced at their declared type. Values leave the
//! buffer only through byte transfers into properly aligned column slots
//! (or, for the drop path, through an aligned scratch allocation).

use std::alloc::{self, Layout};
use std::borrow::Cow;
use std::fmt;
use std::ptr;

use crate::column::ComponentVtable;
use crate::component::{ComponentId, ComponentMask, ComponentRegistry};

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// One component of a bundle: its bit plus the erased operations needed to
/// size the packed layout and destroy an untransferred value.
#[derive(Debug, Clone, Copy)]
struct BundleEntry {
    id: ComponentId,
    vtable: ComponentVtable,
}

/// A transient, move-only set of component values awaiting insertion.
pub struct Bundle<'a> {
    mask: ComponentMask,
    /// Ascending-bit order, parallel to the packed layout of `data`.
    entries: Vec<BundleEntry>,
    /// Packed value bytes; owned for builder-made bundles, borrowed for
    /// caller-managed buffers.
    data: Cow<'a, [u8]>,
    /// Set once the values have been transferred out.
    consumed: bool,
}

impl Bundle<'static> {
    /// Create an empty, owned bundle.
    pub fn new() -> Self {
        Self {
            mask: ComponentMask::EMPTY,
            entries: Vec::new(),
            data: Cow::Owned(Vec::new()),
            consumed: false,
        }
    }

    /// Add a component value. The component type must already be registered.
    ///
    /// # Panics
    ///
    /// Panics if the type is not registered or if the bundle already carries
    /// a value for it.
    pub fn add<T: Send + Sync + 'static>(&mut self, registry: &ComponentRegistry, value: T) {
        let id = registry.lookup::<T>().unwrap_or_else(|| {
            panic!(
                "component type '{}' is not registered -- call register_component::<T>() first",
                std::any::type_name::<T>()
            )
        });
        assert!(
            !self.mask.contains(id),
            "duplicate component type '{}' in bundle",
            std::any::type_name::<T>()
        );
        let vtable = *registry.vtable(id).expect("registered component has a vtable");
        debug_assert_eq!(vtable.size(), std::mem::size_of::<T>());

        // Keep entries (and the packed bytes) in ascending-bit order.
        let position = self.entries.iter().take_while(|e| e.id < id).count();
        let offset: usize = self.entries[..position]
            .iter()
            .map(|e| e.vtable.size())
            .sum();

        let size = std::mem::size_of::<T>();
        let data = self.data.to_mut();
        data.splice(offset..offset, std::iter::repeat(0u8).take(size));
        unsafe {
            ptr::copy_nonoverlapping(
                &value as *const T as *const u8,
                data.as_mut_ptr().add(offset),
                size,
            );
        }
        std::mem::forget(value);

        self.entries.insert(position, BundleEntry { id, vtable });
        self.mask.insert(id);
    }
}

impl<'a> Bundle<'a> {
    /// Wrap a caller-managed packed buffer without taking ownership of the
    /// values. The bundle never destroys borrowed contents.
    ///
    /// # Safety
    ///
    /// `bytes` must hold exactly one initialized value per set bit of `mask`,
    /// in ascending-bit order, each occupying its component's registered size
    /// with no padding. Every bit of `mask` must be registered. Transferring
    /// the bundle moves the values out; the caller must not separately
    /// destroy transferred values.
    pub unsafe fn from_packed_bytes(
        registry: &ComponentRegistry,
        mask: ComponentMask,
        bytes: &'a [u8],
    ) -> Self {
        let entries: Vec<BundleEntry> = mask
            .iter()
            .map(|id| BundleEntry {
                id,
                vtable: *registry
                    .vtable(id)
                    .unwrap_or_else(|| panic!("component {id:?} is not registered")),
            })
            .collect();
        debug_assert_eq!(
            bytes.len(),
            entries.iter().map(|e| e.vtable.size()).sum::<usize>(),
            "packed buffer length does not match the mask's layout"
        );
        Self {
            mask,
            entries,
            data: Cow::Borrowed(bytes),
            consumed: false,
        }
    }

    /// The set of components this bundle carries.
    #[inline]
    pub fn mask(&self) -> ComponentMask {
        self.mask
    }

    /// Number of component values.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the bundle carries no values.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consume the bundle, yielding `(bit, pointer-into-buffer)` for each
    /// component in ascending-bit order. The callback is expected to move the
    /// value into an archetype column; after `transfer` returns, the bundle
    /// considers its values moved out and its destructor does nothing.
    ///
    /// The yielded pointers may be unaligned; values must leave through byte
    /// copies into aligned storage.
    pub(crate) fn transfer(mut self, mut dest: impl FnMut(ComponentId, *const u8)) {
        let base = self.data.as_ref().as_ptr();
        let mut offset = 0;
        for entry in &self.entries {
            #[allow(unsafe_code)]
            let ptr = unsafe { base.add(offset) };
            dest(entry.id, ptr);
            offset += entry.vtable.size();
        }
        self.consumed = true;
    }
}

impl Default for Bundle<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Bundle<'_> {
    fn drop(&mut self) {
        // Borrowed buffers are the caller's to manage; transferred values
        // have moved out. Only an owned, untransferred bundle still holds
        // values that need destroying.
        if self.consumed || !matches!(self.data, Cow::Owned(_)) {
            return;
        }
        let base = self.data.as_ref().as_ptr();
        let mut offset = 0;
        for entry in &self.entries {
            let vtable = &entry.vtable;
            if !vtable.trivially_relocatable() {
                #[allow(unsafe_code)]
                unsafe {
                    if vtable.size() == 0 {
                        // An aligned dangling pointer is enough to run a
                        // zero-sized destructor.
                        (vtable.drop_fn)(vtable.align() as *mut u8);
                    } else {
                        // The packed slot may be unaligned; destroy through
                        // an aligned scratch allocation.
                        let layout = Layout::from_size_align(vtable.size(), vtable.align())
                            .expect("bundle layout invalid");
                        let scratch = alloc::alloc(layout);
                        assert!(!scratch.is_null(), "bundle allocation failed");
                        ptr::copy_nonoverlapping(base.add(offset), scratch, vtable.size());
                        (vtable.drop_fn)(scratch);
                        alloc::dealloc(scratch, layout);
                    }
                }
            }
            offset += vtable.size();
        }
    }
}

impl fmt::Debug for Bundle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bundle")
            .field("mask", &self.mask)
            .field("len", &self.entries.len())
            .field("owned", &matches!(self.data, Cow::Owned(_)))
            .field("consumed", &self.consumed)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
