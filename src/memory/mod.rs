//! The tiered memory subsystem (L3-L7): a monotonic/linear buffer, a TLSF
//! resource layered over it, a small size-class multi-pool, a per-thread
//! temporary ring allocator, and a per-thread global pool.

pub mod global_pool;
pub mod monotonic;
pub mod small_pool;
pub mod temporary;
pub mod tlsf;

use std::ptr::NonNull;

/// A backing allocator that the tiered resources above can be layered over.
/// `MonotonicResource` implements this directly against the OS; `Tlsf` and
/// `SmallMultiPool` both consume one `Resource` and produce another.
pub trait Resource {
    /// Allocates at least `size` bytes aligned to `align`. Returns `None`
    /// on exhaustion rather than panicking (§7: sentinel return).
    fn allocate(&self, size: usize, align: usize) -> Option<NonNull<u8>>;

    /// Returns a block to the resource.
    ///
    /// # Safety
    /// `ptr` must have been returned by `allocate` on this same resource
    /// with this same `size`/`align`, and must not be in use.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, align: usize);
}

fn align_up(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (size + align - 1) & !(align - 1)
}

/// Number of alignment classes the size-classed allocators (`tlsf`,
/// `small_pool`) keep separate free lists for; covers alignments 8..1024.
pub(crate) const ALIGN_CLASSES: usize = 8;

/// Buckets an alignment into one of [`ALIGN_CLASSES`] classes so blocks are
/// only ever recycled into a request whose header offset the block's actual
/// backing alignment can satisfy.
pub(crate) fn align_class(align: usize) -> usize {
    (align.trailing_zeros() as usize).saturating_sub(3).min(ALIGN_CLASSES - 1)
}
