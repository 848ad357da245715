mod common;

use common::{MEDIUM, Machine, SMALL};
use core::alloc::{GlobalAlloc, Layout};
use kernel_alloc::{
    AllocError, GlobalHeap, HEADER_BYTES, HEAP_MAGIC, HeapHeader, LADDER, LADDER_STEPS,
    MIN_OBJECT_SIZE, ObjectPool, PoolRegistry, SlabLayout,
};
use kernel_sync::PreemptCounter;
use std::ptr;

#[test]
fn bootstrap_takes_one_seed_page_and_shutdown_returns_it() {
    let machine = Machine::new(2, 4);
    let before = machine.free_bytes();
    let registry = PoolRegistry::bootstrap(machine.env()).unwrap();
    assert_eq!(machine.free_bytes(), before - 4096);
    assert_eq!(registry.shared_pools(), 0);
    assert_eq!(registry.exclusive_pools(), 0);

    registry.shutdown().unwrap();
    assert_eq!(machine.free_bytes(), before);
}

#[test]
fn shared_pools_are_reused_per_ladder_step() {
    let machine = Machine::new(1, 4);
    let registry = PoolRegistry::bootstrap(machine.env()).unwrap();

    let a = registry.acquire_shared(20).unwrap();
    let b = registry.acquire_shared(24).unwrap();
    let c = registry.acquire_shared(25).unwrap();
    assert_eq!(a.obj_size(), 24);
    assert!(ptr::eq::<ObjectPool<'_>>(&*a, &*b));
    assert_eq!(c.obj_size(), LADDER[2]);
    assert_eq!(a.stats().shared_refs, 2);
    assert_eq!(registry.shared_pools(), 2);

    registry.release_shared(a).unwrap();
    assert_eq!(b.stats().shared_refs, 1);
    registry.release_shared(b).unwrap();
    registry.release_shared(c).unwrap();
    assert_eq!(registry.shared_pools(), 0);
}

#[test]
fn shared_sizes_beyond_the_ladder_are_rejected() {
    let machine = Machine::new(1, 4);
    let registry = PoolRegistry::bootstrap(machine.env()).unwrap();
    let too_big = LADDER[LADDER_STEPS - 1] + 1;
    assert!(matches!(
        registry.acquire_shared(too_big),
        Err(AllocError::InvalidArgument(_))
    ));
    // on the ladder, but larger than the largest 64 KiB page
    assert!(matches!(
        registry.acquire_shared(100_000),
        Err(AllocError::InvalidArgument(_))
    ));
}

#[test]
fn shared_pools_prefer_a_page_holding_several_objects() {
    let machine = Machine::new(1, 4);
    let registry = PoolRegistry::bootstrap(machine.env()).unwrap();
    let small = registry.acquire_shared(64).unwrap();
    assert_eq!(small.class(), SMALL);
    let large = registry.acquire_shared(2000).unwrap();
    assert_eq!(large.obj_size(), 2520);
    assert_eq!(large.class(), MEDIUM);
    assert!(large.page_objs() >= 4);
    registry.release_shared(small).unwrap();
    registry.release_shared(large).unwrap();
}

#[test]
fn drained_pools_linger_until_trimmed() {
    let machine = Machine::new(1, 4);
    let registry = PoolRegistry::bootstrap(machine.env()).unwrap();

    let handle = registry.acquire_shared(96).unwrap();
    let obj = handle.acquire().unwrap();
    let raw: *const ObjectPool<'_> = &*handle;
    registry.release_shared(handle).unwrap();
    assert_eq!(registry.shared_pools(), 1, "live object keeps the pool");
    assert_eq!(registry.trim().unwrap(), 0);

    // a lingering pool is found again by the next acquire
    let again = registry.acquire_shared(96).unwrap();
    assert!(ptr::eq(&*again, raw));
    assert_eq!(again.stats().shared_refs, 1);
    registry.release_shared(again).unwrap();

    // SAFETY: the pool lingers on the shared chain while `obj` is live.
    unsafe { (*raw).release(obj) }.unwrap();
    assert_eq!(registry.trim().unwrap(), 1);
    assert_eq!(registry.shared_pools(), 0);
}

#[test]
fn release_shared_rejects_exclusive_handles() {
    let machine = Machine::new(1, 4);
    let registry = PoolRegistry::bootstrap(machine.env()).unwrap();
    let exclusive = registry.create_exclusive(64, SMALL, None).unwrap();
    assert!(matches!(
        registry.release_shared(exclusive),
        Err(AllocError::InvalidArgument(_))
    ));
    assert_eq!(registry.exclusive_pools(), 1);
}

#[test]
fn exclusive_pools_honor_an_explicit_layout() {
    let machine = Machine::new(1, 4);
    let registry = PoolRegistry::bootstrap(machine.env()).unwrap();
    let onpage = registry
        .create_exclusive(600, SMALL, Some(SlabLayout::OnPage))
        .unwrap();
    assert_eq!(onpage.layout(), SlabLayout::OnPage);
    assert_eq!(onpage.page_objs(), 6);
    assert!(matches!(
        registry.create_exclusive(8192, SMALL, Some(SlabLayout::OnPage)),
        Err(AllocError::InvalidArgument(_))
    ));
    registry.destroy_exclusive(onpage).unwrap();
}

#[test]
fn zero_sized_exclusive_pools_use_minimal_slots() {
    let machine = Machine::new(1, 4);
    let registry = PoolRegistry::bootstrap(machine.env()).unwrap();
    let pool = registry.create_exclusive(0, SMALL, None).unwrap();
    assert_eq!(pool.obj_size(), MIN_OBJECT_SIZE);
    assert!(pool.page_objs() > 0);

    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    assert_ne!(a, b);
    unsafe {
        pool.release(a).unwrap();
        pool.release(b).unwrap();
    }
    registry.destroy_exclusive(pool).unwrap();
    registry.shutdown().unwrap();
}

#[test]
fn shutdown_with_live_objects_hands_the_registry_back() {
    let machine = Machine::new(2, 4);
    let before = machine.free_bytes();
    let registry = PoolRegistry::bootstrap(machine.env()).unwrap();
    let block = registry.allocate(200).unwrap();

    let refused = registry.shutdown().unwrap_err();
    assert!(matches!(refused.error, AllocError::InternalInconsistency(_)));
    let registry = refused.value;

    unsafe { registry.deallocate(block) }.unwrap();
    registry.shutdown().unwrap();
    assert_eq!(machine.free_bytes(), before);
}

#[test]
fn heap_blocks_carry_their_pool_in_a_header() {
    let machine = Machine::new(2, 4);
    let registry = PoolRegistry::bootstrap(machine.env()).unwrap();

    let tiny = registry.allocate(1).unwrap();
    let mid = registry.allocate(100).unwrap();
    assert_eq!(tiny.as_ptr() as usize % 8, 0);
    assert_eq!(mid.as_ptr() as usize % 8, 0);

    let header = unsafe { HeapHeader::from_bits(tiny.sub(HEADER_BYTES).cast::<u64>().read()) };
    assert_eq!(header.magic(), HEAP_MAGIC);
    // 1 + 8 fits the 16-byte step, 100 + 8 the 144-byte step
    assert_eq!(registry.shared_pools(), 2);

    unsafe {
        mid.as_ptr().write_bytes(0x5a, 100);
        registry.deallocate(mid).unwrap();
        registry.deallocate(tiny).unwrap();
    }
    // heap pools stay pinned while empty
    assert_eq!(registry.shared_pools(), 2);
    assert_eq!(registry.trim().unwrap(), 0);
    registry.shutdown().unwrap();
}

#[test]
fn heap_rejects_foreign_blocks() {
    let machine = Machine::new(1, 4);
    let registry = PoolRegistry::bootstrap(machine.env()).unwrap();
    let pool = registry.create_exclusive(64, SMALL, None).unwrap();
    let obj = pool.acquire().unwrap();
    unsafe { obj.as_ptr().write_bytes(0, 64) };

    let inside = unsafe { obj.add(HEADER_BYTES) };
    assert!(matches!(
        unsafe { registry.deallocate(inside) },
        Err(AllocError::InvalidArgument(_))
    ));

    // right magic, wrong pool
    let forged = HeapHeader::for_pool(&*pool);
    unsafe { obj.cast::<u64>().write(forged.into_bits()) };
    assert!(matches!(
        unsafe { registry.deallocate(inside) },
        Err(AllocError::InvalidArgument(_))
    ));

    assert!(matches!(
        registry.allocate(usize::MAX),
        Err(AllocError::InvalidArgument(_))
    ));
    unsafe { pool.release(obj) }.unwrap();
    registry.destroy_exclusive(pool).unwrap();
}

#[test]
fn global_heap_serves_small_aligned_layouts() {
    static PREEMPT: PreemptCounter = PreemptCounter::new();

    let machine = Machine::new(1, 4);
    let heap = GlobalHeap::new(&PREEMPT);
    let layout = Layout::from_size_align(48, 8).unwrap();
    assert!(unsafe { heap.alloc(layout) }.is_null(), "nothing installed yet");

    heap.install(PoolRegistry::bootstrap(machine.env()).unwrap())
        .unwrap();
    let second = PoolRegistry::bootstrap(machine.env()).unwrap();
    let second = heap.install(second).unwrap_err();
    second.shutdown().unwrap();

    let p = unsafe { heap.alloc(layout) };
    assert!(!p.is_null());
    assert!(!PREEMPT.is_disabled());
    unsafe {
        p.write_bytes(0xcc, 48);
        heap.dealloc(p, layout);
    }

    let wide = Layout::from_size_align(64, 16).unwrap();
    assert!(unsafe { heap.alloc(wide) }.is_null());

    let zeroed = unsafe { heap.alloc_zeroed(layout) };
    assert!(unsafe { std::slice::from_raw_parts(zeroed, 48) }.iter().all(|&b| b == 0));
    unsafe { heap.dealloc(zeroed, layout) };

    let registry = heap.registry().unwrap();
    assert_eq!(registry.shared_pools(), 1);
}
