//! L2: the memory tracker. Every tracked allocation is laid out as
//! `[header][user-aligned payload][footer]` (§3); the tracker places that
//! layout, verifies it on free, and keeps per-tag, per-layer counters (§4.1).

use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;

use crate::tag::MemoryTag;

/// Which allocator layer produced a tracked block, used to key the leak
/// report (§4.1: "leaks per tag per layer {Native, Global, Os}").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    /// Arena/TLSF/small-pool allocations backed by a monotonic buffer.
    Native,
    /// The per-thread global pool (L7).
    Global,
    /// Allocated directly from the OS (oversized requests, L7 fallthrough).
    Os,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::Native, Layer::Global, Layer::Os];

    fn as_index(self) -> usize {
        match self {
            Layer::Native => 0,
            Layer::Global => 1,
            Layer::Os => 2,
        }
    }
}

const FOOTER_GUARD: u32 = 0xF00D_CAFE;
const WIPE_BYTE: u8 = 0xFE;

#[repr(C)]
struct Header {
    tag: u16,
    thread_id: u16,
    size: u32,
    align: u32,
}

const HEADER_SIZE: usize = std::mem::size_of::<Header>();
const FOOTER_SIZE: usize = std::mem::size_of::<u32>();

/// Metadata returned when a tracked block is released, so the caller (one of
/// the allocator layers) knows how to return the raw backing memory.
#[derive(Debug, Clone, Copy)]
pub struct BlockInfo {
    pub raw: NonNull<u8>,
    pub block_size: usize,
    pub align: usize,
    pub tag: MemoryTag,
    pub thread_id: u16,
}

#[derive(Default)]
struct Counter {
    count: AtomicI64,
    bytes: AtomicI64,
    peak_bytes: AtomicI64,
}

impl Counter {
    fn record_alloc(&self, size: i64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let bytes = self.bytes.fetch_add(size, Ordering::Relaxed) + size;
        self.peak_bytes.fetch_max(bytes, Ordering::Relaxed);
    }

    fn record_free(&self, size: i64) {
        self.count.fetch_sub(1, Ordering::Relaxed);
        self.bytes.fetch_sub(size, Ordering::Relaxed);
    }
}

/// A point-in-time view of one (tag, layer) counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagLayerStats {
    pub tag: MemoryTag,
    pub layer: Layer,
    pub count: i64,
    pub bytes: i64,
    pub peak_bytes: i64,
}

/// A leak flagged by [`Tracker::final_report`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakEntry {
    pub tag: MemoryTag,
    pub layer: Layer,
    pub bytes: i64,
    pub count: i64,
}

/// Process-wide allocation tracker. Construct one per process (see
/// [`Tracker::global`] for the lazily-initialized singleton used by the rest
/// of the crate); tests may construct their own instance to assert in
/// isolation.
pub struct Tracker {
    counters: Box<[Counter]>,
    ignore_leaks: std::sync::atomic::AtomicBool,
}

static GLOBAL: OnceLock<Tracker> = OnceLock::new();

impl Tracker {
    pub fn new() -> Self {
        let mut counters = Vec::with_capacity(MemoryTag::COUNT * Layer::ALL.len());
        counters.resize_with(MemoryTag::COUNT * Layer::ALL.len(), Counter::default);
        Tracker {
            counters: counters.into_boxed_slice(),
            ignore_leaks: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// The process-wide tracker, created lazily (§9: "initialize lazily in
    /// dependency order").
    pub fn global() -> &'static Tracker {
        GLOBAL.get_or_init(Tracker::new)
    }

    /// Marks the process as being in pre-init or late-teardown, during which
    /// every allocation's tag is rewritten to `IgnoreLeaks` (§4.1, §9).
    pub fn set_lifecycle_ignoring_leaks(&self, ignoring: bool) {
        self.ignore_leaks.store(ignoring, Ordering::Relaxed);
    }

    fn index(&self, tag: MemoryTag, layer: Layer) -> usize {
        tag.as_index() * Layer::ALL.len() + layer.as_index()
    }

    /// The total backing-block size a caller must reserve to track a
    /// `size`-byte, `align`-aligned payload. `align` must be a power of two
    /// and at least `size_of::<Header>()` (§3: "the smallest alignment must
    /// be >= size_of(header)").
    pub fn block_layout(size: usize, align: usize) -> (usize, usize) {
        debug_assert!(align.is_power_of_two());
        debug_assert!(align >= HEADER_SIZE);
        (align + size + FOOTER_SIZE, align)
    }

    /// Places a header/payload/footer layout inside a freshly-obtained raw
    /// block of at least `Tracker::block_layout(size, align).0` bytes,
    /// aligned to `align`, and returns the payload pointer. Updates the
    /// (tag, layer) counters.
    ///
    /// # Safety
    /// `raw` must point to a live allocation of at least
    /// `block_layout(size, align).0` bytes, aligned to `align`, that is not
    /// otherwise in use.
    pub unsafe fn place(
        &self,
        raw: NonNull<u8>,
        size: usize,
        align: usize,
        mut tag: MemoryTag,
    ) -> NonNull<u8> {
        debug_assert!(align.is_power_of_two());
        debug_assert!(align >= HEADER_SIZE);
        if self.ignore_leaks.load(Ordering::Relaxed) {
            tag = MemoryTag::IgnoreLeaks;
        }
        let thread_id = crate::platform::thread_id();
        let header = Header {
            tag: tag as u16,
            thread_id,
            size: size as u32,
            align: align as u32,
        };
        unsafe {
            raw.as_ptr().cast::<Header>().write_unaligned(header);
            let payload = NonNull::new_unchecked(raw.as_ptr().add(align));
            let footer_ptr = payload.as_ptr().add(size).cast::<u32>();
            footer_ptr.write_unaligned(FOOTER_GUARD);
            self.counter(tag, Layer::Native).record_alloc(size as i64);
            payload
        }
    }

    /// Like [`place`](Self::place) but records into an explicit layer
    /// (L7's global pool and its OS fallthrough use this).
    ///
    /// # Safety
    /// Same preconditions as [`place`](Self::place).
    pub unsafe fn place_in(
        &self,
        raw: NonNull<u8>,
        size: usize,
        align: usize,
        tag: MemoryTag,
        layer: Layer,
    ) -> NonNull<u8> {
        let payload = unsafe { self.place(raw, size, align, tag) };
        // `place` always books to `Layer::Native`; correct the ledger if the
        // caller wanted a different layer.
        if layer != Layer::Native {
            let tag = self.payload_tag(payload, align);
            self.counter(tag, Layer::Native).record_free(size as i64);
            self.counter(tag, layer).record_alloc(size as i64);
        }
        payload
    }

    fn payload_tag(&self, payload: NonNull<u8>, align: usize) -> MemoryTag {
        unsafe { header_of(payload, align).tag_enum() }
    }

    /// Verifies and releases a tracked block, returning the metadata needed
    /// to give the raw memory back to its backing allocator. Wipes the
    /// payload to a debug pattern before returning (§4.1). The caller
    /// supplies `align`: every allocator layer above the tracker already
    /// knows the alignment it requested (size-class/free-list metadata), so
    /// the tracker does not need to recover it by guesswork.
    ///
    /// # Safety
    /// `payload` must be a pointer previously returned by
    /// [`place`](Self::place)/[`place_in`](Self::place_in) with this same
    /// `align`, that has not already been released.
    pub unsafe fn release(&self, payload: NonNull<u8>, align: usize, layer: Layer) -> BlockInfo {
        let header = unsafe { header_of(payload, align) };
        let size = header.size as usize;
        let tag = header.tag_enum();
        let thread_id = header.thread_id;

        unsafe {
            let footer_ptr = payload.as_ptr().add(size).cast::<u32>();
            let footer = footer_ptr.read_unaligned();
            crate::error::checked_assert(footer == FOOTER_GUARD, "tracked allocation footer corrupted");
            std::ptr::write_bytes(payload.as_ptr(), WIPE_BYTE, size);
        }

        self.counter(tag, layer).record_free(size as i64);

        let raw = unsafe { NonNull::new_unchecked(payload.as_ptr().sub(align)) };
        BlockInfo { raw, block_size: align + size + FOOTER_SIZE, align, tag, thread_id }
    }

    fn counter(&self, tag: MemoryTag, layer: Layer) -> &Counter {
        &self.counters[self.index(tag, layer)]
    }

    /// A point-in-time snapshot of every non-empty (tag, layer) counter.
    pub fn stats_snapshot(&self) -> Vec<TagLayerStats> {
        let mut out = Vec::new();
        for tag_idx in 0..MemoryTag::COUNT {
            let tag = tag_from_index(tag_idx);
            for layer in Layer::ALL {
                let c = self.counter(tag, layer);
                let count = c.count.load(Ordering::Relaxed);
                let bytes = c.bytes.load(Ordering::Relaxed);
                if count != 0 || bytes != 0 {
                    out.push(TagLayerStats {
                        tag,
                        layer,
                        count,
                        bytes,
                        peak_bytes: c.peak_bytes.load(Ordering::Relaxed),
                    });
                }
            }
        }
        out
    }

    /// Lists every (tag, layer) that still has outstanding bytes above
    /// `threshold_bytes`, excluding tags that are never leak-flagged
    /// (`IgnoreLeaks`, `Profiling`).
    pub fn final_report(&self, threshold_bytes: i64) -> Vec<LeakEntry> {
        self.stats_snapshot()
            .into_iter()
            .filter(|s| !s.tag.never_leak_flagged() && s.bytes > threshold_bytes)
            .map(|s| LeakEntry { tag: s.tag, layer: s.layer, bytes: s.bytes, count: s.count })
            .collect()
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Header {
    fn tag_enum(&self) -> MemoryTag {
        tag_from_index(self.tag as usize)
    }
}

unsafe fn header_of(payload: NonNull<u8>, align: usize) -> Header {
    unsafe { payload.as_ptr().sub(align).cast::<Header>().read_unaligned() }
}

fn tag_from_index(idx: usize) -> MemoryTag {
    // SAFETY: `MemoryTag` is `#[repr(u16)]` and contiguous from 0..COUNT.
    unsafe { std::mem::transmute::<u16, MemoryTag>(idx as u16) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc, dealloc, Layout};

    fn alloc_raw(block_size: usize, align: usize) -> NonNull<u8> {
        let layout = Layout::from_size_align(block_size, align).unwrap();
        NonNull::new(unsafe { alloc(layout) }).unwrap()
    }

    unsafe fn free_raw(raw: NonNull<u8>, block_size: usize, align: usize) {
        let layout = Layout::from_size_align(block_size, align).unwrap();
        unsafe { dealloc(raw.as_ptr(), layout) };
    }

    #[test]
    fn place_and_release_round_trips_counters() {
        let tracker = Tracker::new();
        let before = tracker.stats_snapshot();
        assert!(before.is_empty());

        let (block_size, align) = Tracker::block_layout(128, 16);
        let raw = alloc_raw(block_size, align);
        let payload = unsafe { tracker.place(raw, 128, align, MemoryTag::Gameplay) };
        assert_eq!(payload.as_ptr() as usize % align, 0);

        let snapshot = tracker.stats_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].bytes, 128);

        let info = unsafe { tracker.release(payload, align, Layer::Native) };
        assert_eq!(info.block_size, block_size);
        unsafe { free_raw(info.raw, block_size, align) };

        assert!(tracker.stats_snapshot().is_empty());
    }

    #[test]
    fn final_report_exempts_ignore_leaks_and_profiling() {
        let tracker = Tracker::new();
        for tag in [MemoryTag::IgnoreLeaks, MemoryTag::Profiling, MemoryTag::Gameplay] {
            let (block_size, align) = Tracker::block_layout(64, 16);
            let raw = alloc_raw(block_size, align);
            unsafe { tracker.place(raw, 64, align, tag) };
        }
        let leaks = tracker.final_report(0);
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].tag, MemoryTag::Gameplay);
    }
}
