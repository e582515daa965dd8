//! §8: alloc/free round trip across a size/alignment grid, exercised
//! against both the TLSF resource directly and the global per-thread pool.

use kiln_core::memory::global_pool::GlobalPool;
use kiln_core::memory::monotonic::MonotonicResource;
use kiln_core::memory::tlsf::Tlsf;
use kiln_core::memory::Resource;
use kiln_core::tag::MemoryTag;
use proptest::prelude::*;

fn align_strategy() -> impl Strategy<Value = usize> {
    prop_oneof![Just(8usize), Just(16), Just(32), Just(64)]
}

proptest! {
    #[test]
    fn tlsf_round_trips_every_size_in_range(size in 1usize..=65536, align in align_strategy()) {
        let backing = MonotonicResource::new(1 << 20);
        let tlsf = Tlsf::new(backing, 1 << 18);
        let ptr = tlsf.allocate(size, align);
        prop_assert!(ptr.is_some());
        let ptr = ptr.unwrap();
        prop_assert_eq!(ptr.as_ptr() as usize % align, 0);
        unsafe { tlsf.deallocate(ptr, size, align) };
    }

    #[test]
    fn global_pool_round_trips_every_size_in_range(size in 1usize..=65536, align in align_strategy()) {
        let pool = GlobalPool::new(1 << 20, 4096);
        let ptr = pool.allocate(size, align, MemoryTag::Test);
        prop_assert!(ptr.is_some());
        let ptr = ptr.unwrap();
        prop_assert_eq!(ptr.as_ptr() as usize % align, 0);
        unsafe { pool.deallocate(ptr, align) };
    }

    #[test]
    fn global_pool_cross_thread_free_does_not_lose_the_block(size in 1usize..=4096, align in align_strategy()) {
        let pool = std::sync::Arc::new(GlobalPool::new(1 << 20, 4096));
        let before = GlobalPool::live_allocations();
        let ptr = pool.allocate(size, align, MemoryTag::Test).unwrap();
        let addr = ptr.as_ptr() as usize;

        let pool2 = pool.clone();
        std::thread::spawn(move || {
            let ptr = std::ptr::NonNull::new(addr as *mut u8).unwrap();
            unsafe { pool2.deallocate(ptr, align) };
        })
        .join()
        .unwrap();

        // One more local allocation drains the deferred free and restores
        // the live count.
        let drain = pool.allocate(8, 8, MemoryTag::Test).unwrap();
        unsafe { pool.deallocate(drain, 8) };
        prop_assert_eq!(GlobalPool::live_allocations(), before);
    }
}
