//! Raw OS page allocation, grounded on the teacher's `os.rs`: a thin,
//! corrected rewrite of its `os_mem_alloc`/`os_mem_free`/page-size probing,
//! trimmed to the primitives the monotonic buffer (L3) and the OS-direct
//! path of the global pool (L7) actually need.

use std::ptr::NonNull;
use std::sync::OnceLock;

#[cfg(not(windows))]
use libc::{mmap, munmap, sysconf, MAP_ANONYMOUS, MAP_PRIVATE, PROT_READ, PROT_WRITE, _SC_PAGESIZE};

#[cfg(windows)]
use winapi::{
    shared::minwindef::LPVOID,
    um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        sysinfoapi::{GetSystemInfo, SYSTEM_INFO},
        winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
    },
};

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// The OS (small) page size, probed once and cached.
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(probe_page_size)
}

#[cfg(not(windows))]
fn probe_page_size() -> usize {
    let result = unsafe { sysconf(_SC_PAGESIZE) };
    if result > 0 {
        result as usize
    } else {
        4096
    }
}

#[cfg(windows)]
fn probe_page_size() -> usize {
    unsafe {
        let mut si: SYSTEM_INFO = std::mem::zeroed();
        GetSystemInfo(&mut si);
        if si.dwPageSize > 0 {
            si.dwPageSize as usize
        } else {
            4096
        }
    }
}

fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Reserves and commits `size` bytes of anonymous memory from the OS. `size`
/// is rounded up to a whole number of pages. Returns `None` on failure,
/// matching the allocator layers' sentinel-return error convention (§7).
pub fn alloc_pages(size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
        return None;
    }
    let size = align_up(size, page_size());

    #[cfg(not(windows))]
    {
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            log::warn!("mmap failed: {}", std::io::Error::last_os_error());
            return None;
        }
        NonNull::new(ptr as *mut u8)
    }

    #[cfg(windows)]
    {
        let ptr = unsafe {
            VirtualAlloc(
                std::ptr::null_mut(),
                size,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
            )
        };
        NonNull::new(ptr as *mut u8)
    }
}

/// Releases memory previously returned by [`alloc_pages`]. `size` must match
/// the (page-rounded) size that was allocated.
///
/// # Safety
/// `ptr` must have been returned by [`alloc_pages`] with the same `size`,
/// and must not be in use.
pub unsafe fn free_pages(ptr: NonNull<u8>, size: usize) {
    let size = align_up(size, page_size());

    #[cfg(not(windows))]
    {
        let rc = unsafe { munmap(ptr.as_ptr() as *mut _, size) };
        if rc != 0 {
            log::warn!("munmap failed: {}", std::io::Error::last_os_error());
        }
    }

    #[cfg(windows)]
    {
        let _ = size;
        let ok = unsafe { VirtualFree(ptr.as_ptr() as LPVOID, 0, MEM_RELEASE) };
        if ok == 0 {
            log::warn!("VirtualFree failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_free_round_trips() {
        let size = page_size() * 4;
        let ptr = alloc_pages(size).expect("os allocation should succeed");
        unsafe {
            // touch every page to prove it's actually mapped read/write.
            std::ptr::write_bytes(ptr.as_ptr(), 0xAB, size);
            assert_eq!(*ptr.as_ptr(), 0xAB);
            free_pages(ptr, size);
        }
    }

    #[test]
    fn page_size_is_cached_and_consistent() {
        assert_eq!(page_size(), page_size());
    }
}
