//! L4: a two-level segregated-fit allocator layered over a backing
//! [`Resource`] (typically a [`MonotonicResource`](super::monotonic::MonotonicResource)).
//! Allocate/free are O(1): requests are rounded up to one of a fixed set of
//! size classes, each backed by its own free list. Requests above
//! `max_block_size` fall through to the backing resource directly (§4.2).

use std::ptr::NonNull;
use std::sync::Mutex;

use super::{align_class, align_up, Resource, ALIGN_CLASSES};

const SL_BITS: u32 = 2;
const SL_COUNT: usize = 1 << SL_BITS;

/// First-level index (roughly `log2(size)`) of the largest class this TLSF
/// resource will service through its free lists; requests above
/// `size_for_class(FL_COUNT-1, SL_COUNT-1)` fall through to the backing
/// resource.
const FL_COUNT: u32 = 32;

fn class_of(size: usize) -> (u32, usize) {
    let size = size.max(1);
    let fl = usize::BITS - 1 - size.leading_zeros();
    let fl = fl.max(SL_BITS);
    let sl = (size >> (fl - SL_BITS)) & (SL_COUNT - 1);
    (fl, sl)
}

fn size_for_class(fl: u32, sl: usize) -> usize {
    (1usize << fl) | (sl << (fl - SL_BITS))
}

/// Free lists are additionally split by alignment class so a recycled block
/// is never handed back for a request whose header offset (which depends on
/// `align`, see `allocate`) the block's own backing alignment can't satisfy.
fn class_index(fl: u32, sl: usize, align_cls: usize) -> usize {
    ((fl as usize) * SL_COUNT + sl) * ALIGN_CLASSES + align_cls
}

#[repr(C)]
struct FreeNode {
    next: *mut FreeNode,
}

struct ClassHeader {
    class_idx: u32,
}

const HEADER_SIZE: usize = std::mem::size_of::<ClassHeader>();

struct Inner {
    free_lists: Vec<*mut FreeNode>,
}

unsafe impl Send for Inner {}

/// A TLSF-style resource. `max_block_size` bounds the largest request
/// serviced through the segregated free lists; `align` is the maximum
/// alignment the resource will hand back (§4.2: "alignment up to
/// `max_align`"). Owns its backing resource by value so it composes
/// directly into per-thread state (§4.4) without lifetime gymnastics.
pub struct Tlsf<B: Resource> {
    backing: B,
    max_block_size: usize,
    inner: Mutex<Inner>,
}

impl<B: Resource> Tlsf<B> {
    pub fn new(backing: B, max_block_size: usize) -> Self {
        let (fl, _) = class_of(max_block_size);
        let class_count = class_index(fl.min(FL_COUNT - 1), SL_COUNT - 1, ALIGN_CLASSES - 1) + 1;
        Tlsf {
            backing,
            max_block_size,
            inner: Mutex::new(Inner { free_lists: vec![std::ptr::null_mut(); class_count] }),
        }
    }

    fn class_for_request(&self, size: usize) -> Option<(u32, usize, usize)> {
        if size > self.max_block_size {
            return None;
        }
        let (fl, sl) = class_of(size.max(HEADER_SIZE));
        let fl = fl.min(FL_COUNT - 1);
        Some((fl, sl, size_for_class(fl, sl)))
    }
}

impl<B: Resource> Tlsf<B> {
    pub fn backing(&self) -> &B {
        &self.backing
    }
}

impl<B: Resource> Resource for Tlsf<B> {
    fn allocate(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        // The header sits immediately before the payload, so it must be
        // offset by a multiple of `align`, not just its own size (the
        // payload pointer itself has to land on an `align` boundary).
        let header_slot = align_up(HEADER_SIZE, align);
        let requested = header_slot + size;
        let Some((fl, sl, class_size)) = self.class_for_request(requested) else {
            // oversized request: fall through to the backing resource.
            return self.backing.allocate(size, align);
        };
        let idx = class_index(fl, sl, align_class(align));

        let mut inner = self.inner.lock().unwrap();
        let head = inner.free_lists[idx];
        let block: NonNull<u8> = if head.is_null() {
            drop(inner);
            let block = self.backing.allocate(class_size, align.max(std::mem::align_of::<ClassHeader>()))?;
            block
        } else {
            let next = unsafe { (*head).next };
            inner.free_lists[idx] = next;
            unsafe { NonNull::new_unchecked(head as *mut u8) }
        };

        unsafe {
            block.as_ptr().cast::<ClassHeader>().write(ClassHeader { class_idx: idx as u32 });
            Some(NonNull::new_unchecked(block.as_ptr().add(header_slot)))
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        let header_slot = align_up(HEADER_SIZE, align);
        let requested = header_slot + size;
        if self.class_for_request(requested).is_none() {
            unsafe { self.backing.deallocate(ptr, size, align) };
            return;
        }
        let block = unsafe { ptr.as_ptr().sub(header_slot) };
        let header = unsafe { &*block.cast::<ClassHeader>() };
        let idx = header.class_idx as usize;

        let node = block.cast::<FreeNode>();
        let mut inner = self.inner.lock().unwrap();
        unsafe { (*node).next = inner.free_lists[idx] };
        inner.free_lists[idx] = node;
    }
}
