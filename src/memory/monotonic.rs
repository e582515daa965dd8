//! L3: the monotonic/linear buffer. A growable chain of blocks obtained from
//! the OS (§3, §4.2): allocation bumps a cursor within the current block;
//! deallocation of individual allocations is a no-op; the whole chain can be
//! `rewind()`-ed back to its first block.

use std::ptr::NonNull;
use std::sync::Mutex;

use crate::platform::os;

use super::{align_up, Resource};

struct Block {
    raw: NonNull<u8>,
    capacity: usize,
    used: usize,
}

struct Inner {
    blocks: Vec<Block>,
}

/// A chain of OS-backed blocks, bump-allocated within the current (last)
/// block and grown by a full `block_step`-sized block on overflow.
pub struct MonotonicResource {
    block_step: usize,
    inner: Mutex<Inner>,
}

impl MonotonicResource {
    pub fn new(block_step: usize) -> Self {
        MonotonicResource {
            block_step: block_step.max(os::page_size()),
            inner: Mutex::new(Inner { blocks: Vec::new() }),
        }
    }

    /// Resets every block's bump cursor to zero. Block growth never
    /// relocates prior allocations, so this invalidates all outstanding
    /// pointers obtained from this resource -- callers must ensure nothing
    /// is still live.
    ///
    /// If `keep_only_first` is set, every block past the first is returned
    /// to the OS.
    pub fn rewind(&self, keep_only_first: bool) {
        let mut inner = self.inner.lock().unwrap();
        if keep_only_first && inner.blocks.len() > 1 {
            for block in inner.blocks.drain(1..) {
                unsafe { os::free_pages(block.raw, block.capacity) };
            }
        }
        for block in inner.blocks.iter_mut() {
            block.used = 0;
        }
    }

    /// Total bytes reserved across every block in the chain.
    pub fn reserved_bytes(&self) -> usize {
        self.inner.lock().unwrap().blocks.iter().map(|b| b.capacity).sum()
    }

    fn grow(&self, inner: &mut Inner, min_size: usize) -> bool {
        let size = min_size.max(self.block_step);
        match os::alloc_pages(size) {
            Some(raw) => {
                inner.blocks.push(Block { raw, capacity: size, used: 0 });
                true
            }
            None => false,
        }
    }
}

impl Resource for MonotonicResource {
    fn allocate(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(block) = inner.blocks.last() {
            let base = block.raw.as_ptr() as usize;
            let offset = align_up(base + block.used, align) - base;
            if offset + size <= block.capacity {
                let ptr = unsafe { NonNull::new_unchecked(block.raw.as_ptr().add(offset)) };
                inner.blocks.last_mut().unwrap().used = offset + size;
                return Some(ptr);
            }
        }

        if !self.grow(&mut inner, size + align) {
            return None;
        }
        let block = inner.blocks.last_mut().unwrap();
        let base = block.raw.as_ptr() as usize;
        let offset = align_up(base, align) - base;
        debug_assert!(offset + size <= block.capacity);
        let ptr = unsafe { NonNull::new_unchecked(block.raw.as_ptr().add(offset)) };
        block.used = offset + size;
        Some(ptr)
    }

    /// A no-op by design (§4.2): the monotonic buffer reclaims space only on
    /// `rewind`, never per-allocation.
    unsafe fn deallocate(&self, _ptr: NonNull<u8>, _size: usize, _align: usize) {}
}

impl Drop for MonotonicResource {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap();
        for block in inner.blocks.drain(..) {
            unsafe { os::free_pages(block.raw, block.capacity) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocates_within_a_block_without_relocating() {
        let res = MonotonicResource::new(4096);
        let a = res.allocate(64, 8).unwrap();
        let b = res.allocate(64, 8).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
        assert!(b.as_ptr() as usize >= a.as_ptr() as usize + 64);
    }

    #[test]
    fn growth_adds_a_new_block_when_current_is_full() {
        let res = MonotonicResource::new(4096);
        let _first = res.allocate(4096, 8).unwrap();
        let _second = res.allocate(4096, 8).unwrap();
        assert!(res.reserved_bytes() >= 8192);
    }

    #[test]
    fn rewind_resets_bump_cursors() {
        let res = MonotonicResource::new(4096);
        let before_bytes = {
            let _ = res.allocate(1024, 8).unwrap();
            res.reserved_bytes()
        };
        res.rewind(false);
        let _ = res.allocate(1024, 8).unwrap();
        assert_eq!(res.reserved_bytes(), before_bytes, "rewind must not grow the chain");
    }

    #[test]
    fn respects_alignment() {
        let res = MonotonicResource::new(4096);
        let _ = res.allocate(1, 8).unwrap();
        let p = res.allocate(64, 64).unwrap();
        assert_eq!(p.as_ptr() as usize % 64, 0);
    }
}
