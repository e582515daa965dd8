//! L7: the global per-thread pool. Each thread owns a TLSF resource sitting
//! inside a page-scoped monotonic region; blocks above `max_small_block` go
//! straight to the OS and are tagged with [`platform::NO_THREAD`] (§4.4).
//!
//! Every block's header records the owning thread's id (`tracker::Header`).
//! A free issued from a foreign thread cannot touch the owner's thread-local
//! TLSF directly, so it is pushed onto the owner's MPSC "defer-free" queue
//! instead; the owner drains that queue before its own next allocation.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, OnceLock};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::platform::{self, os};
use crate::tag::MemoryTag;
use crate::tracker::{Layer, Tracker};

use super::monotonic::MonotonicResource;
use super::tlsf::Tlsf;
use super::Resource;

/// A block freed from a thread other than the one that owns it, queued for
/// the owner to reclaim on its own thread (§4.4).
struct DeferredFree {
    raw: NonNull<u8>,
    block_size: usize,
    align: usize,
}

unsafe impl Send for DeferredFree {}

struct ThreadPool {
    tlsf: Tlsf<MonotonicResource>,
    defer_rx: Receiver<DeferredFree>,
    defer_tx: Sender<DeferredFree>,
}

impl ThreadPool {
    fn new(region_step: usize, max_small_block: usize) -> Self {
        let backing = MonotonicResource::new(region_step);
        let (defer_tx, defer_rx) = unbounded();
        ThreadPool { tlsf: Tlsf::new(backing, max_small_block), defer_rx, defer_tx }
    }

    /// Drains any frees other threads queued for us, returning each block to
    /// the thread-local TLSF. Must run before this thread services a new
    /// allocation (§4.4: "the owner drains this queue before any subsequent
    /// allocation").
    fn drain_deferred(&self) {
        while let Ok(block) = self.defer_rx.try_recv() {
            unsafe { self.tlsf.deallocate(block.raw, block.block_size, block.align) };
        }
    }
}

/// Registry of live per-thread defer-free senders, so a foreign thread can
/// find the right queue for a block it is freeing (§4.4).
struct Registry {
    senders: Mutex<HashMap<u16, Sender<DeferredFree>>>,
    live_allocations: AtomicI64,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry { senders: Mutex::new(HashMap::new()), live_allocations: AtomicI64::new(0) })
}

thread_local! {
    static LOCAL: RefCell<Option<ThreadPool>> = const { RefCell::new(None) };
}

/// The global per-thread pool facade (§4.4). Stateless by design: all state
/// lives behind the thread-local `LOCAL` and the process-wide `REGISTRY`, so
/// this type can be freely constructed and shared.
pub struct GlobalPool {
    region_step: usize,
    max_small_block: usize,
}

impl GlobalPool {
    pub fn new(region_step: usize, max_small_block: usize) -> Self {
        GlobalPool { region_step, max_small_block }
    }

    fn with_local<R>(&self, f: impl FnOnce(&ThreadPool) -> R) -> R {
        LOCAL.with(|cell| {
            let mut slot = cell.borrow_mut();
            if slot.is_none() {
                let pool = ThreadPool::new(self.region_step, self.max_small_block);
                registry().senders.lock().unwrap().insert(platform::thread_id(), pool.defer_tx.clone());
                *slot = Some(pool);
            }
            let pool = slot.as_ref().unwrap();
            pool.drain_deferred();
            f(pool)
        })
    }

    /// Allocates a tagged block. Blocks within `max_small_block` come from
    /// this thread's TLSF-over-monotonic pool (`Layer::Global`); larger
    /// requests go straight to the OS and are tagged with
    /// [`platform::NO_THREAD`] so any thread may free them without deferral
    /// (§4.4).
    pub fn allocate(&self, size: usize, align: usize, tag: MemoryTag) -> Option<NonNull<u8>> {
        let (block_size, block_align) = Tracker::block_layout(size, align);

        let payload = if block_size <= self.max_small_block {
            let raw = self.with_local(|pool| pool.tlsf.allocate(block_size, block_align))?;
            unsafe { Tracker::global().place_in(raw, size, align, tag, Layer::Global) }
        } else {
            let raw = os::alloc_pages(block_size)?;
            let payload = unsafe { Tracker::global().place_in(raw, size, align, tag, Layer::Os) };
            unsafe { stamp_no_thread(payload, align) };
            payload
        };

        registry().live_allocations.fetch_add(1, Ordering::Relaxed);
        Some(payload)
    }

    /// Releases a block obtained from [`allocate`](Self::allocate). If the
    /// block's owning thread differs from the caller's, the raw memory is
    /// handed to the owner's defer-free queue instead of being reclaimed
    /// directly (§4.4).
    ///
    /// # Safety
    /// `payload` must have been returned by `allocate` on this pool with
    /// this same `align`, and must not already be released.
    pub unsafe fn deallocate(&self, payload: NonNull<u8>, align: usize) {
        // Peek the layer by re-deriving it from whichever layer recorded the
        // live byte count; `release` itself is layer-agnostic about which
        // counter it decrements once told, so try `Global` first and fall
        // back to `Os` -- the header's owning thread id is what actually
        // decides the free path.
        let owner = unsafe { peek_owner(payload, align) };

        if owner == platform::NO_THREAD {
            let info = unsafe { Tracker::global().release(payload, align, Layer::Os) };
            unsafe { os::free_pages(info.raw, info.block_size) };
        } else if owner == platform::thread_id() {
            let info = unsafe { Tracker::global().release(payload, align, Layer::Global) };
            self.with_local(|pool| unsafe { pool.tlsf.deallocate(info.raw, info.block_size, info.align) });
        } else {
            let info = unsafe { Tracker::global().release(payload, align, Layer::Global) };
            let senders = registry().senders.lock().unwrap();
            if let Some(sender) = senders.get(&owner) {
                let _ = sender.send(DeferredFree { raw: info.raw, block_size: info.block_size, align: info.align });
            } else {
                // Owner thread is gone; nothing left to drain into. Reclaim
                // directly rather than leak.
                drop(senders);
                self.with_local(|pool| unsafe { pool.tlsf.deallocate(info.raw, info.block_size, info.align) });
            }
        }

        registry().live_allocations.fetch_sub(1, Ordering::Relaxed);
    }

    /// Number of blocks currently outstanding across every thread's pool.
    pub fn live_allocations() -> i64 {
        registry().live_allocations.load(Ordering::Relaxed)
    }
}

unsafe fn peek_owner(payload: NonNull<u8>, align: usize) -> u16 {
    // Mirrors `tracker::header_of`'s layout without taking ownership of the
    // block: thread id is the second field of the tracked header.
    #[repr(C)]
    struct HeaderPeek {
        _tag: u16,
        thread_id: u16,
    }
    unsafe { payload.as_ptr().sub(align).cast::<HeaderPeek>().read_unaligned().thread_id }
}

unsafe fn stamp_no_thread(payload: NonNull<u8>, align: usize) {
    #[repr(C)]
    struct HeaderPeek {
        _tag: u16,
        thread_id: u16,
    }
    unsafe {
        let header = payload.as_ptr().sub(align).cast::<HeaderPeek>();
        let mut h = header.read_unaligned();
        h.thread_id = platform::NO_THREAD;
        header.write_unaligned(h);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_block_round_trips_on_the_same_thread() {
        let pool = GlobalPool::new(64 * 1024, 4096);
        let p = pool.allocate(128, 16, MemoryTag::Gameplay).unwrap();
        assert_eq!(p.as_ptr() as usize % 16, 0);
        unsafe { pool.deallocate(p, 16) };
        assert_eq!(GlobalPool::live_allocations(), 0);
    }

    #[test]
    fn oversized_block_falls_through_to_the_os_and_is_tagged_no_thread() {
        let pool = GlobalPool::new(64 * 1024, 4096);
        let p = pool.allocate(64 * 1024, 8, MemoryTag::Test).unwrap();
        let owner = unsafe { peek_owner(p, 8) };
        assert_eq!(owner, platform::NO_THREAD);
        unsafe { pool.deallocate(p, 8) };
    }

    #[test]
    fn cross_thread_free_is_deferred_and_drained_by_the_owner() {
        let pool = std::sync::Arc::new(GlobalPool::new(64 * 1024, 4096));
        let pool2 = pool.clone();

        let p = pool.allocate(64, 8, MemoryTag::Gameplay).unwrap();
        let addr = p.as_ptr() as usize;

        std::thread::spawn(move || {
            let p = unsafe { NonNull::new_unchecked(addr as *mut u8) };
            unsafe { pool2.deallocate(p, 8) };
        })
        .join()
        .unwrap();

        // drained on this thread's next allocation, which also exercises
        // `drain_deferred` via `with_local`.
        let q = pool.allocate(64, 8, MemoryTag::Gameplay).unwrap();
        unsafe { pool.deallocate(q, 8) };
    }
}
