//! L1: thread-local id, OS sleep/yield, page size, high-resolution clock.
//!
//! Grounded on the teacher's `os.rs` (page-size probing, mmap/VirtualAlloc
//! split) generalized from a global-allocator helper into the platform
//! facade every other component calls into.

pub mod os;

use std::cell::Cell;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

static NEXT_THREAD_ID: AtomicU16 = AtomicU16::new(1);

thread_local! {
    static THREAD_ID: Cell<u16> = Cell::new(0);
}

/// A thread id with no owner (used to tag OS-direct blocks in L7).
pub const NO_THREAD: u16 = 0;

/// Returns a small, stable 16-bit id for the calling thread, assigned
/// lazily on first use. Ids are never reused while the process is alive.
pub fn thread_id() -> u16 {
    THREAD_ID.with(|cell| {
        let mut id = cell.get();
        if id == NO_THREAD {
            id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
            cell.set(id);
        }
        id
    })
}

/// Yields the remainder of the calling thread's timeslice.
pub fn yield_now() {
    std::thread::yield_now();
}

/// Sleeps for `usec` microseconds, with a short spin tail for sub-millisecond
/// precision (§5: `Thread::sleep(usec)` "OS sleep with a fine-grained spin
/// tail").
pub fn sleep_usec(usec: u64) {
    const SPIN_TAIL_USEC: u64 = 500;
    if usec > SPIN_TAIL_USEC {
        std::thread::sleep(Duration::from_micros(usec - SPIN_TAIL_USEC));
    }
    let deadline = Instant::now() + Duration::from_micros(usec.min(SPIN_TAIL_USEC));
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

/// Returns the OS page size in bytes (probed once, cached thereafter).
pub fn page_size() -> usize {
    os::page_size()
}

/// A monotonic, high-resolution clock. All timed-job and profiler timestamps
/// are relative to one process-wide `Clock::epoch()`.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Clock { epoch: Instant::now() }
    }

    /// Microseconds elapsed since this clock was created.
    pub fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    pub fn now_instant(&self) -> Instant {
        Instant::now()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_is_stable_and_nonzero() {
        let a = thread_id();
        let b = thread_id();
        assert_eq!(a, b);
        assert_ne!(a, NO_THREAD);
    }

    #[test]
    fn distinct_threads_get_distinct_ids() {
        let main_id = thread_id();
        let other_id = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(main_id, other_id);
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = Clock::new();
        let a = clock.now_us();
        std::thread::sleep(Duration::from_micros(50));
        let b = clock.now_us();
        assert!(b >= a);
    }

    #[test]
    fn page_size_is_plausible() {
        let size = page_size();
        assert!(size >= 4096);
        assert_eq!(size & (size - 1), 0, "page size must be a power of two");
    }
}
