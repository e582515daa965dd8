//! L5: the small multi-pool. Three size tiers (low/mid/high step sizes),
//! each with its own bucket count; alignment classes are kept as
//! independent free lists (§4.2). Backed by any [`Resource`] -- in practice
//! a [`MonotonicResource`](super::monotonic::MonotonicResource).

use std::ptr::NonNull;
use std::sync::Mutex;

use super::{align_class, align_up, Resource, ALIGN_CLASSES};

/// Tiering configuration: `{step, bucket_count}` per tier.
#[derive(Debug, Clone, Copy)]
pub struct Tiers {
    pub low_step: usize,
    pub low_buckets: usize,
    pub mid_step: usize,
    pub mid_buckets: usize,
    pub high_step: usize,
    pub high_buckets: usize,
}

impl Default for Tiers {
    fn default() -> Self {
        // Matches the teacher's mimalloc-derived size classing in spirit:
        // small steps for the hot small-object range, coarser steps further
        // out.
        Tiers { low_step: 16, low_buckets: 16, mid_step: 64, mid_buckets: 16, high_step: 256, high_buckets: 16 }
    }
}

impl Tiers {
    fn low_max(&self) -> usize {
        self.low_step * self.low_buckets
    }

    fn mid_max(&self) -> usize {
        self.low_max() + self.mid_step * self.mid_buckets
    }

    fn high_max(&self) -> usize {
        self.mid_max() + self.high_step * self.high_buckets
    }

    /// Maps a requested size to a global bucket id, or `None` if it exceeds
    /// every tier (the caller should fall back to a different allocator).
    fn bucket_of(&self, size: usize) -> Option<(usize, usize)> {
        if size <= self.low_max() {
            let bucket = size.saturating_sub(1) / self.low_step;
            let rounded = (bucket + 1) * self.low_step;
            Some((bucket, rounded))
        } else if size <= self.mid_max() {
            let rel = size - self.low_max();
            let bucket = rel.saturating_sub(1) / self.mid_step;
            let rounded = self.low_max() + (bucket + 1) * self.mid_step;
            Some((self.low_buckets + bucket, rounded))
        } else if size <= self.high_max() {
            let rel = size - self.mid_max();
            let bucket = rel.saturating_sub(1) / self.high_step;
            let rounded = self.mid_max() + (bucket + 1) * self.high_step;
            Some((self.low_buckets + self.mid_buckets + bucket, rounded))
        } else {
            None
        }
    }

    fn total_buckets(&self) -> usize {
        self.low_buckets + self.mid_buckets + self.high_buckets
    }
}

struct BlockHeader {
    list_id: u32,
}

const HEADER_SIZE: usize = std::mem::size_of::<BlockHeader>();

#[repr(C)]
struct FreeNode {
    next: *mut FreeNode,
}

struct Inner {
    // indexed by `bucket * ALIGN_CLASSES + align_class`
    free_lists: Vec<*mut FreeNode>,
}

unsafe impl Send for Inner {}

/// Scenario 1 of §8: allocate 7/30/200-byte blocks at 8/16/8-byte alignment,
/// free in reverse order, expect no leak and correct alignment. This type is
/// what services that scenario.
pub struct SmallMultiPool<B: Resource> {
    tiers: Tiers,
    backing: B,
    inner: Mutex<Inner>,
}

impl<B: Resource> SmallMultiPool<B> {
    pub fn new(tiers: Tiers, backing: B) -> Self {
        let lists = vec![std::ptr::null_mut(); tiers.total_buckets() * ALIGN_CLASSES];
        SmallMultiPool { tiers, backing, inner: Mutex::new(Inner { free_lists: lists }) }
    }

    pub fn max_size(&self) -> usize {
        self.tiers.high_max()
    }

    fn list_index(&self, bucket: usize, align: usize) -> usize {
        bucket * ALIGN_CLASSES + align_class(align)
    }
}

impl<B: Resource> Resource for SmallMultiPool<B> {
    fn allocate(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let (bucket, rounded) = self.tiers.bucket_of(size)?;
        let list_id = self.list_index(bucket, align);
        let header_slot = align_up(HEADER_SIZE, align);
        let chunk_size = header_slot + rounded;

        let mut inner = self.inner.lock().unwrap();
        let head = inner.free_lists[list_id];
        let block = if head.is_null() {
            drop(inner);
            self.backing.allocate(chunk_size, align.max(std::mem::align_of::<BlockHeader>()))?
        } else {
            let next = unsafe { (*head).next };
            inner.free_lists[list_id] = next;
            unsafe { NonNull::new_unchecked(head as *mut u8) }
        };

        unsafe {
            block.as_ptr().cast::<BlockHeader>().write(BlockHeader { list_id: list_id as u32 });
            Some(NonNull::new_unchecked(block.as_ptr().add(header_slot)))
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _size: usize, align: usize) {
        let header_slot = align_up(HEADER_SIZE, align);
        let block = unsafe { ptr.as_ptr().sub(header_slot) };
        let list_id = unsafe { (*block.cast::<BlockHeader>()).list_id } as usize;
        let node = block.cast::<FreeNode>();
        let mut inner = self.inner.lock().unwrap();
        unsafe { (*node).next = inner.free_lists[list_id] };
        inner.free_lists[list_id] = node;
    }
}
