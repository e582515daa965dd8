//! L6: the per-thread temporary (ring) allocator. Each thread owns a ring
//! of cache-line-aligned pages; allocation bumps a per-page cursor on the
//! owning (producer) thread, deallocation increments an atomic
//! `total_consumed` counter that any thread may touch (§3, §4.3).

use std::alloc::{alloc, dealloc, Layout};
use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::align_up;

const PAGE_ALIGN: usize = 64; // cache-line aligned, per §3.
const HEADER_ALIGN: usize = 8; // page-max-alignment, per §3.

struct HeaderPrefix {
    page_tag: usize, // 0 for "no owning page" (fallback path)
    payload_size: u32,
}
const HEADER_SIZE: usize = std::mem::size_of::<HeaderPrefix>();

/// One page in a thread's ring. Shared via `Arc` so a consumer on any
/// thread can record a deallocation against it after the producer thread
/// has moved on to a different page.
pub struct Page {
    buffer: NonNull<u8>,
    capacity: usize,
    pos: AtomicUsize,
    total_produced: AtomicUsize,
    total_consumed: AtomicUsize,
}

unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    fn new(capacity: usize) -> Self {
        let layout = Layout::from_size_align(capacity, PAGE_ALIGN).unwrap();
        let buffer = NonNull::new(unsafe { alloc(layout) }).expect("temporary page allocation failed");
        Page {
            buffer,
            capacity,
            pos: AtomicUsize::new(0),
            total_produced: AtomicUsize::new(0),
            total_consumed: AtomicUsize::new(0),
        }
    }

    /// A page is "empty" iff everything produced has also been consumed
    /// (§3). Empty pages are safe for the producer to reuse from offset 0.
    pub fn is_empty(&self) -> bool {
        self.total_produced.load(Ordering::Acquire) == self.total_consumed.load(Ordering::Acquire)
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.capacity, PAGE_ALIGN).unwrap();
        unsafe { dealloc(self.buffer.as_ptr(), layout) };
    }
}

/// A block handed out by [`TemporaryAllocator::allocate`].
pub struct TempBlock {
    pub ptr: NonNull<u8>,
    size: usize,
    /// `None` means this block used the fallback path (system allocator)
    /// because no page had room and the per-thread page budget was spent.
    page: Option<Arc<Page>>,
    /// Exact byte count this block added to its page's `total_produced`
    /// (header + any cursor-realignment padding + payload), so
    /// `deallocate` can credit `total_consumed` by the same amount.
    produced: usize,
}

struct Ring {
    pages: Vec<Arc<Page>>,
}

thread_local! {
    static RING: RefCell<Ring> = RefCell::new(Ring { pages: Vec::new() });
}

/// Per-thread ring-of-pages allocator (§4.3).
pub struct TemporaryAllocator {
    page_capacity: usize,
    max_pages_per_thread: usize,
}

impl TemporaryAllocator {
    pub fn new(page_capacity: usize, max_pages_per_thread: usize) -> Self {
        TemporaryAllocator { page_capacity, max_pages_per_thread }
    }

    pub fn allocate(&self, size: usize, align: usize) -> TempBlock {
        let header_slot = align_up(HEADER_SIZE, HEADER_ALIGN.max(align));
        // Worst case the cursor needs realigning too; used only to decide
        // whether a fresh page is even worth allocating for this request.
        let worst_case = header_slot + align + size;

        RING.with(|ring| {
            let mut ring = ring.borrow_mut();

            if let Some(page) = ring.pages.last() {
                if let Some(block) = try_bump(page, align, header_slot, size) {
                    return block;
                }
            }

            if let Some(idx) = ring.pages.iter().position(|p| p.is_empty()) {
                let page = ring.pages.remove(idx);
                page.pos.store(0, Ordering::Relaxed);
                page.total_produced.store(0, Ordering::Relaxed);
                page.total_consumed.store(0, Ordering::Relaxed);
                ring.pages.push(page);
                if let Some(block) = try_bump(ring.pages.last().unwrap(), align, header_slot, size) {
                    return block;
                }
            }

            if ring.pages.len() < self.max_pages_per_thread && worst_case <= self.page_capacity {
                ring.pages.push(Arc::new(Page::new(self.page_capacity)));
                if let Some(block) = try_bump(ring.pages.last().unwrap(), align, header_slot, size) {
                    return block;
                }
            }

            fallback_allocate(size, align)
        })
    }

    pub fn deallocate(&self, block: TempBlock) {
        if let Some(page) = &block.page {
            page.total_consumed.fetch_add(block.produced, Ordering::AcqRel);
        } else {
            let layout = Layout::from_size_align(block.size, HEADER_ALIGN).unwrap();
            unsafe { dealloc(block.ptr.as_ptr(), layout) };
        }
    }
}

fn try_bump(page: &Arc<Page>, align: usize, header_slot: usize, payload_size: usize) -> Option<TempBlock> {
    let pos = page.pos.load(Ordering::Relaxed);
    // Only `buffer` itself is guaranteed `PAGE_ALIGN`-aligned; a prior
    // allocation can leave `pos` at any offset, so the cursor has to be
    // re-aligned to this request before it's used to place the header.
    let aligned_pos = align_up(pos, align);
    let needed = (aligned_pos - pos) + header_slot + payload_size;
    if pos + needed > page.capacity {
        return None;
    }
    page.pos.store(pos + needed, Ordering::Relaxed);
    page.total_produced.fetch_add(needed, Ordering::AcqRel);

    let base = unsafe { page.buffer.as_ptr().add(aligned_pos) };
    unsafe {
        base.cast::<HeaderPrefix>().write(HeaderPrefix {
            page_tag: Arc::as_ptr(page) as usize,
            payload_size: payload_size as u32,
        });
        let payload = NonNull::new_unchecked(base.add(header_slot));
        Some(TempBlock { ptr: payload, size: payload_size, page: Some(page.clone()), produced: needed })
    }
}

fn fallback_allocate(size: usize, align: usize) -> TempBlock {
    let layout = Layout::from_size_align(size.max(1), align.max(HEADER_ALIGN)).unwrap();
    let ptr = NonNull::new(unsafe { alloc(layout) }).expect("temporary fallback allocation failed");
    TempBlock { ptr, size, page: None, produced: 0 }
}
