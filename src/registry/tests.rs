use std::prelude::v1::*;

use super::*;
use crate::{
    policy::{Bare, Instrumented, Traced},
    tests::{scribble, verify},
};

fn options(alias: MemType, name: &'static str) -> PoolOptions {
    PoolOptions {
        alias: Some(alias),
        name: Some(name),
        ..PoolOptions::INIT
    }
}

fn leak_region(len: usize) -> &'static mut [MaybeUninit<u8>] {
    let region = Box::leak(std::vec![MaybeUninit::uninit(); len + 16].into_boxed_slice());
    let skip = region.as_ptr().align_offset(16);
    &mut region[skip..skip + len]
}

/// `fast` (1 KiB), `mid` (2 KiB) and `slow` (4 KiB), in that order.
fn three_pools<H: Heap, P: Policy>(heap: H) -> Registry<'static, H, P> {
    let registry = Registry::new(heap, RegistryConfig::INIT);
    registry
        .create_pool(leak_region(1024), options(MemType::Pool1, "fast"))
        .unwrap();
    registry
        .create_pool(leak_region(2048), options(MemType::Pool2, "mid"))
        .unwrap();
    registry
        .create_pool(leak_region(4096), options(MemType::Pool3, "slow"))
        .unwrap();
    registry
}

#[test]
fn any_fast_and_any_slow() {
    let _ = env_logger::builder().is_test(true).try_init();

    let registry: Registry<'_, NoHeap, Bare> = three_pools(NoHeap);
    assert_eq!(registry.pool_count(), 3);

    let fast = registry.alloc(MemType::AnyFast, 64).unwrap();
    assert!(registry.check_ptr(MemType::Pool1, fast));

    let slow = registry.alloc(MemType::AnySlow, 64).unwrap();
    assert!(registry.check_ptr(MemType::Pool3, slow));

    // Too large for the fastest pool
    let mid = registry.alloc(MemType::AnyFast, 1500).unwrap();
    assert!(registry.check_ptr(MemType::Pool2, mid));

    // Too large for every pool, and the heap has nothing
    assert_eq!(
        registry.try_alloc(MemType::AnyFast, 8000),
        Err(Error::Headroom {
            size: 8000,
            limit: DEFAULT_HEAP_LIMIT
        })
    );

    unsafe {
        registry.free(Some(fast));
        registry.free(Some(slow));
        registry.free(Some(mid));
        registry.free(None);
    }
    for mem_type in [MemType::Pool1, MemType::Pool2, MemType::Pool3] {
        assert_eq!(registry.pool_from_type(mem_type, |pool| pool.fragments()), Some(1));
    }
}

#[test]
fn explicit_type() {
    let registry: Registry<'_, NoHeap, Bare> = three_pools(NoHeap);

    let ptr = registry.alloc(MemType::Pool2, 64).unwrap();
    assert!(registry.check_ptr(MemType::Pool2, ptr));
    assert!(!registry.check_ptr(MemType::Pool1, ptr));
    assert!(registry.check_ptr(MemType::AnySlow, ptr));

    // No fallback to other pools
    assert_eq!(registry.alloc(MemType::Pool2, 3000), None);

    // Nothing is registered under `Pool7`
    assert_eq!(registry.alloc(MemType::Pool7, 8), None);
    assert_eq!(
        registry.try_alloc(MemType::Unmapped, 8),
        Err(Error::Unmapped(MemType::Unmapped))
    );
    assert!(!registry.check_ptr(MemType::Unmapped, ptr));

    unsafe { registry.free(Some(ptr)) };
    assert!(!registry.check_ptr(MemType::Pool2, ptr));
}

#[test]
fn falls_back_to_the_heap() {
    let registry: Registry<'_, SystemHeap, Bare> = Registry::new(
        SystemHeap::new(),
        RegistryConfig::INIT,
    );
    registry
        .create_pool(leak_region(1024), options(MemType::Pool1, "fast"))
        .unwrap();

    // The heap can't report its free space, so the headroom is not enforced
    let ptr = registry.alloc(MemType::Pool1, 4096).unwrap();
    assert!(!registry.check_ptr(MemType::Pool1, ptr));
    assert!(registry.check_ptr(MemType::Heap, ptr));
    assert_eq!(unsafe { registry.size_of_ptr(ptr) }, 0);
    scribble(ptr, 4096, 9);

    let ptr = unsafe { registry.realloc(MemType::Pool1, Some(ptr), 8192) }.unwrap();
    verify(ptr, 4096, 9);
    unsafe { registry.free(Some(ptr)) };
}

#[test]
fn heap_headroom() {
    let _ = env_logger::builder().is_test(true).try_init();

    let registry: Registry<'_, SystemHeap, Bare> = Registry::new(
        SystemHeap::with_budget(1100),
        RegistryConfig { heap_limit: 1024 },
    );

    assert_eq!(
        registry.try_alloc(MemType::Heap, 200),
        Err(Error::Headroom {
            size: 200,
            limit: 1024
        })
    );
    let ptr = registry.alloc(MemType::AnyFast, 50).unwrap();
    // 1050 bytes left
    assert_eq!(registry.alloc(MemType::AnySlow, 30), None);
    unsafe { registry.free(Some(ptr)) };

    registry.set_config(RegistryConfig { heap_limit: 0 });
    assert_eq!(registry.config().heap_limit, 0);
    let ptr = registry.alloc(MemType::Heap, 200).unwrap();
    unsafe { registry.free(Some(ptr)) };
}

#[test]
fn disabled_pools_are_skipped() {
    let registry: Registry<'_, NoHeap, Bare> = Registry::new(NoHeap, RegistryConfig::INIT);
    registry
        .create_pool(
            leak_region(1024),
            PoolOptions {
                flags: PoolFlags::DISABLED,
                ..options(MemType::Pool1, "off")
            },
        )
        .unwrap();
    registry
        .create_pool(leak_region(1024), options(MemType::Pool2, "on"))
        .unwrap();
    assert_eq!(registry.pool_count(), 2);

    let ptr = registry.alloc(MemType::AnyFast, 64).unwrap();
    assert!(registry.check_ptr(MemType::Pool2, ptr));
    assert_eq!(registry.alloc(MemType::Pool1, 8), None);
    assert!(!registry.check_ptr(MemType::Pool1, ptr));
    assert_eq!(registry.pool_from_type(MemType::Pool1, |_| ()), None);
    assert_eq!(registry.type_from_name("off"), MemType::Pool1);

    let info = registry.info();
    assert!(info[0].unmapped);
    assert!(!info[1].unmapped);
}

#[test]
fn nested_regions_resolve_to_the_smallest() {
    let registry: Registry<'static, NoHeap, Bare> = Registry::new(NoHeap, RegistryConfig::INIT);
    registry
        .create_pool(leak_region(8192), options(MemType::Pool1, "outer"))
        .unwrap();

    let inner = registry.alloc(MemType::Pool1, 2048).unwrap();
    unsafe {
        registry
            .create_pool_raw(inner, 2048, options(MemType::Pool2, "inner"))
            .unwrap();
    }

    let ptr = registry.alloc(MemType::Pool2, 64).unwrap();
    assert_eq!(
        registry.pool_from_ptr(ptr, |pool| pool.name()),
        Some(Some("inner"))
    );
    assert_eq!(unsafe { registry.size_of_ptr(ptr) }, 64);

    unsafe { registry.free(Some(ptr)) };
    assert_eq!(registry.pool_from_type(MemType::Pool2, |pool| pool.fragments()), Some(1));
    assert_eq!(registry.pool_from_type(MemType::Pool1, |pool| pool.fragments()), Some(2));
}

#[test]
fn realloc_moves_across_pools() {
    let _ = env_logger::builder().is_test(true).try_init();

    let registry: Registry<'_, NoHeap, Bare> = Registry::new(NoHeap, RegistryConfig::INIT);
    registry
        .create_pool(leak_region(256), options(MemType::Pool1, "small"))
        .unwrap();
    registry
        .create_pool(leak_region(4096), options(MemType::Pool2, "large"))
        .unwrap();

    let ptr = unsafe { registry.realloc(MemType::Pool1, None, 100) }.unwrap();
    assert!(registry.check_ptr(MemType::Pool1, ptr));
    scribble(ptr, 100, 5);

    let moved = unsafe { registry.realloc(MemType::Pool2, Some(ptr), 1000) }.unwrap();
    assert!(registry.check_ptr(MemType::Pool2, moved));
    assert!(!registry.check_ptr(MemType::Pool1, ptr));
    verify(moved, 100, 5);
    assert_eq!(registry.pool_from_type(MemType::Pool1, |pool| pool.fragments()), Some(1));

    // A failed resize leaves the block alone
    assert_eq!(
        unsafe { registry.realloc(MemType::Pool1, Some(moved), 100_000) },
        None
    );
    assert!(registry.check_ptr(MemType::Pool2, moved));
    verify(moved, 100, 5);

    unsafe { registry.free(Some(moved)) };
}

#[test]
fn update_string() {
    let registry: Registry<'_, NoHeap, Instrumented> = three_pools(NoHeap);
    let mut slot = None;

    let read = |slot: &Option<NonNull<u8>>, len: usize| -> Vec<u8> {
        let ptr = slot.unwrap();
        unsafe { core::slice::from_raw_parts(ptr.as_ptr(), len) }.to_vec()
    };

    unsafe {
        assert!(registry.update_string(&mut slot, Some("hello")));
        assert!(registry.check_ptr(MemType::Pool3, slot.unwrap()));
        assert_eq!(read(&slot, 6), b"hello\0");

        assert!(registry.update_string(&mut slot, Some("hello, world")));
        assert_eq!(read(&slot, 13), b"hello, world\0");

        assert!(registry.update_string(&mut slot, Some("hi")));
        assert_eq!(read(&slot, 3), b"hi\0");

        // Too long for any pool
        let long: String = core::iter::repeat('x').take(8000).collect();
        assert!(!registry.update_string(&mut slot, Some(long.as_str())));
        assert_eq!(read(&slot, 3), b"hi\0");

        assert!(registry.update_string(&mut slot, None));
        assert!(registry.update_string(&mut slot, None));
    }
    assert_eq!(slot, None);
    assert_eq!(registry.pool_from_type(MemType::Pool3, |pool| pool.fragments()), Some(1));
}

#[test]
fn check_ptr_without_pools() {
    let registry: Registry<'_, SystemHeap, Bare> = Registry::new(
        SystemHeap::new(),
        RegistryConfig { heap_limit: 0 },
    );
    let ptr = registry.alloc(MemType::AnyFast, 16).unwrap();
    // Every type designates the heap
    assert!(registry.check_ptr(MemType::Pool3, ptr));
    assert!(registry.check_ptr(MemType::Unmapped, ptr));
    unsafe { registry.free(Some(ptr)) };

    let registry: Registry<'_, NoHeap, Bare> = Registry::new(NoHeap, RegistryConfig::INIT);
    assert!(!registry.check_ptr(MemType::Heap, NonNull::dangling()));
}

#[test]
fn type_from_name() {
    let registry: Registry<'_, NoHeap, Bare> = three_pools(NoHeap);
    assert_eq!(registry.type_from_name("HEAP"), MemType::Heap);
    assert_eq!(registry.type_from_name("fast"), MemType::Pool1);
    assert_eq!(registry.type_from_name("slow"), MemType::Pool3);
    assert_eq!(registry.type_from_name("nope"), MemType::Unmapped);
}

#[test]
fn generic_hooks() {
    let registry: Registry<'_, NoHeap, Bare> = three_pools(NoHeap);

    let fast = registry.generic_malloc(100).unwrap();
    assert!(registry.check_ptr(MemType::Pool1, fast));
    let slow = registry.generic_malloc_slow(100).unwrap();
    assert!(registry.check_ptr(MemType::Pool3, slow));

    unsafe {
        // Grows out of the fastest pool
        let fast = registry.generic_realloc_fast(Some(fast), 1500).unwrap();
        assert!(registry.check_ptr(MemType::Pool2, fast));

        // A failed resize releases the block
        assert_eq!(registry.generic_realloc_slow(Some(slow), 100_000), None);
        assert_eq!(registry.pool_from_type(MemType::Pool3, |pool| pool.fragments()), Some(1));

        let fresh = registry.generic_realloc_fast(None, 8).unwrap();
        assert!(registry.check_ptr(MemType::Pool1, fresh));

        registry.generic_free(Some(fast));
        registry.generic_free(Some(fresh));
        registry.generic_free(None);
    }
}

#[test]
fn calloc() {
    let registry: Registry<'_, NoHeap, Bare> = three_pools(NoHeap);

    let ptr = registry.alloc(MemType::Pool1, 64).unwrap();
    scribble(ptr, 64, 1);
    unsafe { registry.free(Some(ptr)) };

    let ptr = registry.calloc(MemType::Pool1, 4, 16).unwrap();
    let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), 64) };
    assert!(bytes.iter().all(|&b| b == 0));

    assert_eq!(registry.calloc(MemType::AnyFast, usize::MAX, 2), None);
}

#[test]
fn info_and_print_frags() {
    let registry: Registry<'_, NoHeap, Bare> = three_pools(NoHeap);
    let _ptr = registry.alloc(MemType::Pool1, 100).unwrap();

    let info = registry.info();
    assert_eq!(info.len(), 3);
    assert_eq!(info[0].name, Some("fast"));
    assert_eq!(info[0].mem_type, Some(MemType::Pool1));
    assert_eq!(info[0].size, 1024);
    assert_eq!(info[0].fragments, 2);
    assert!(info[0].free < 1024 - 100);
    assert_eq!(info[0].high_water, 1024 - info[0].free);
    assert_eq!(info[2].name, Some("slow"));
    assert_eq!(info[2].fragments, 1);

    let mut out = String::new();
    registry.print_frags(&mut out).unwrap();
    let lines: Vec<_> = out.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("poolFrag\tfast\t+\t0\t"));
    assert!(lines[1].starts_with("poolFrag\tfast\t-\t1\t"));
    assert!(lines[3].starts_with("poolFrag\tslow\t-\t0\t"));
}

#[test]
fn registry_full() {
    let registry: Registry<'_, NoHeap, Bare> = Registry::new(NoHeap, RegistryConfig::INIT);
    for i in 0..MAX_POOLS {
        assert_eq!(registry.add_pool(Pool::INIT), Ok(i));
    }
    assert_eq!(
        registry.add_pool(Pool::INIT),
        Err(Error::RegistryFull(MAX_POOLS))
    );
}

#[test]
fn leak_detector_and_reset() {
    let registry: Registry<'_, NoHeap, Instrumented> = three_pools(NoHeap);
    let mut out = String::new();

    assert_eq!(registry.leak_detector(MemType::AnyFast, LeakPhase::Snapshot, 1, &mut out), 0);
    let _a = registry.alloc(MemType::Pool1, 16).unwrap();
    let _b = registry.alloc(MemType::Pool3, 16).unwrap();

    assert_eq!(registry.leak_detector(MemType::Pool1, LeakPhase::Report, 1, &mut out), 1);
    assert_eq!(registry.leak_detector(MemType::AnySlow, LeakPhase::Report, 1, &mut out), 2);
    assert_eq!(registry.leak_detector(MemType::Pool9, LeakPhase::Report, 1, &mut out), 0);
    assert_eq!(out.lines().count(), 3);

    registry.reset(MemType::AnyFast);
    assert_eq!(registry.pool_from_type(MemType::Pool1, |pool| pool.fragments()), Some(2));
    registry.reset(MemType::Pool1);
    assert_eq!(registry.pool_from_type(MemType::Pool1, |pool| pool.fragments()), Some(1));
    assert_eq!(registry.pool_from_type(MemType::Pool3, |pool| pool.fragments()), Some(2));
}

#[test]
fn origin_is_the_caller() {
    let registry: Registry<'_, NoHeap, Traced> = three_pools(NoHeap);

    let (ptr, line) = (registry.alloc(MemType::AnyFast, 8).unwrap(), line!());
    let origin = registry
        .pool_from_ptr(ptr, |pool| pool.blocks().next().and_then(|block| block.origin))
        .flatten()
        .unwrap();
    assert_eq!(origin.file(), file!());
    assert_eq!(origin.line(), line);
}

#[test]
fn system_heap_budget() {
    let mut heap = SystemHeap::with_budget(1000);
    assert_eq!(heap.free_size(), Some(1000));

    let ptr = heap.alloc(100).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 16, 0);
    assert_eq!(heap.in_use(), 100);
    assert_eq!(heap.free_size(), Some(900));
    scribble(ptr, 100, 2);

    let ptr = unsafe { heap.realloc(ptr, 300) }.unwrap();
    verify(ptr, 100, 2);
    assert_eq!(heap.free_size(), Some(700));

    let zeroed = heap.calloc(10, 10).unwrap();
    let bytes = unsafe { core::slice::from_raw_parts(zeroed.as_ptr(), 100) };
    assert!(bytes.iter().all(|&b| b == 0));

    unsafe {
        heap.free(ptr);
        heap.free(zeroed);
    }
    assert_eq!(heap.in_use(), 0);
    assert_eq!(SystemHeap::new().free_size(), None);
}
