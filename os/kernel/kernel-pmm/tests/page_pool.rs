use kernel_memory_addresses::{AddressRange, PhysicalAddress};
use kernel_pmm::{LevelStats, PageAllocError, PhysicalPagePool, SizeClass, SizeClassTable};
use std::collections::BTreeMap;

const MIB: u64 = 1 << 20;

fn range(low: u64, len: u64) -> AddressRange {
    AddressRange::from_base_len(PhysicalAddress::new(low), len).unwrap()
}

/// Runs the whole bootstrap sequence with every range fully free.
fn built<'a>(
    classes: SizeClassTable,
    ranges: &[AddressRange],
    workarea: &'a mut Vec<u8>,
) -> PhysicalPagePool<'a> {
    let mut pool = PhysicalPagePool::new(classes);
    for r in ranges {
        pool.add_range(*r).unwrap();
    }
    workarea.resize(pool.calc_workarea_bytes().unwrap(), 0);
    pool.init(workarea).unwrap();
    for r in ranges {
        pool.load_free_range(r.low(), r.len()).unwrap();
    }
    pool.build().unwrap();
    pool
}

fn stats(pool: &PhysicalPagePool<'_>) -> Vec<LevelStats> {
    pool.classes()
        .iter()
        .map(|c| pool.level_stats(c).unwrap())
        .collect()
}

const SMALL: SizeClass = SizeClass::new(0);
const LARGE: SizeClass = SizeClass::new(1);

#[test]
fn single_level_hands_out_every_page_once() {
    let mut wa = Vec::new();
    let classes = SizeClassTable::new(&[12]).unwrap();
    let mut pool = built(classes, &[range(MIB, MIB)], &mut wa);
    assert_eq!(pool.level_stats(SMALL).unwrap().free_pages, 256);

    let mut seen = std::collections::BTreeSet::new();
    for _ in 0..256 {
        let page = pool.allocate(SMALL).unwrap();
        assert!(page.is_aligned(4096));
        assert!(seen.insert(page), "page {page} handed out twice");
    }
    assert_eq!(pool.allocate(SMALL), Err(PageAllocError::OutOfMemory));
    assert_eq!(pool.level_stats(SMALL).unwrap().allocated_pages, 256);
    assert!(pool.check_consistency());
}

#[test]
fn freeing_the_last_sibling_promotes_the_cell() {
    let mut wa = Vec::new();
    let classes = SizeClassTable::new(&[12, 18]).unwrap();
    let mut pool = built(classes, &[range(MIB, MIB)], &mut wa);
    assert_eq!(pool.level_stats(SMALL).unwrap().free_pages, 0);
    assert_eq!(pool.level_stats(LARGE).unwrap().free_pages, 4);

    let pages: Vec<_> = (0..64).map(|_| pool.allocate(SMALL).unwrap()).collect();
    assert_eq!(pool.level_stats(SMALL).unwrap().free_pages, 0);
    assert_eq!(pool.level_stats(LARGE).unwrap().free_pages, 3);

    for page in &pages[..63] {
        pool.deallocate(SMALL, *page).unwrap();
    }
    assert_eq!(pool.level_stats(SMALL).unwrap().free_pages, 63);
    assert_eq!(pool.level_stats(LARGE).unwrap().free_pages, 3);

    pool.deallocate(SMALL, pages[63]).unwrap();
    assert_eq!(pool.level_stats(SMALL).unwrap().free_pages, 0);
    assert_eq!(pool.level_stats(LARGE).unwrap().free_pages, 4);
    assert!(pool.check_consistency());
}

#[test]
fn import_is_the_inverse_of_promotion() {
    let mut wa = Vec::new();
    let classes = SizeClassTable::new(&[12, 18]).unwrap();
    let mut pool = built(classes, &[range(MIB, MIB)], &mut wa);
    let before = stats(&pool);

    let page = pool.allocate(SMALL).unwrap();
    assert_eq!(pool.level_stats(SMALL).unwrap().free_pages, 63);
    assert_eq!(pool.level_stats(LARGE).unwrap().free_pages, 3);
    // imported pages are not allocations of the level above
    assert_eq!(pool.level_stats(LARGE).unwrap().allocated_pages, 0);

    pool.deallocate(SMALL, page).unwrap();
    assert_eq!(stats(&pool), before);
}

#[test]
fn reserve_then_free_is_a_round_trip() {
    let mut wa = Vec::new();
    let classes = SizeClassTable::new(&[12, 16, 20]).unwrap();
    let mut pool = built(classes, &[range(0x3000, 3 * MIB)], &mut wa);
    let _keep: Vec<_> = (0..37).map(|_| pool.allocate(SMALL).unwrap()).collect();
    let _big = pool.allocate(LARGE).unwrap();

    let before = stats(&pool);
    let page = pool.allocate(SMALL).unwrap();
    pool.deallocate(SMALL, page).unwrap();
    assert_eq!(stats(&pool), before);
    // the free list is back where it was
    assert_eq!(pool.allocate(SMALL).unwrap(), page);
}

#[test]
fn unaligned_ranges_keep_only_whole_pages() {
    let mut wa = Vec::new();
    let classes = SizeClassTable::new(&[12, 18]).unwrap();
    // 0x1800 into a page up to 0x800 short of one: 2 whole 4 KiB pages are lost
    let r = range(0x4_1800, 0x40_0000 - 0x1000);
    let pool = built(classes, &[r], &mut wa);
    assert_eq!(pool.free_bytes(), 0x40_0000 - 0x2000);
    assert!(pool.check_consistency());
}

#[test]
fn dealloc_outside_the_ranges_is_out_of_range() {
    let mut wa = Vec::new();
    let classes = SizeClassTable::new(&[12, 18]).unwrap();
    let mut pool = built(
        classes,
        &[range(MIB, MIB), range(4 * MIB, MIB)],
        &mut wa,
    );
    let gap = PhysicalAddress::new(3 * MIB);
    assert_eq!(
        pool.deallocate(SMALL, gap),
        Err(PageAllocError::OutOfRange(gap))
    );
    let far = PhysicalAddress::new(64 * MIB);
    assert_eq!(
        pool.deallocate(SMALL, far),
        Err(PageAllocError::OutOfRange(far))
    );
    assert_eq!(
        pool.allocate(SizeClass::new(2)),
        Err(PageAllocError::InvalidSizeClass(2))
    );
}

#[test]
fn double_free_is_reported() {
    let mut wa = Vec::new();
    let classes = SizeClassTable::new(&[12, 18]).unwrap();
    let mut pool = built(classes, &[range(MIB, MIB)], &mut wa);
    let a = pool.allocate(SMALL).unwrap();
    let b = pool.allocate(SMALL).unwrap();
    pool.deallocate(SMALL, a).unwrap();
    assert_eq!(pool.deallocate(SMALL, a), Err(PageAllocError::DoubleFree(a)));
    pool.deallocate(SMALL, b).unwrap();
    assert!(pool.check_consistency());
}

#[test]
fn empty_pool_is_out_of_memory() {
    let mut wa = Vec::new();
    let classes = SizeClassTable::DEFAULT;
    let mut pool = PhysicalPagePool::new(classes);
    pool.add_range(range(MIB, MIB)).unwrap();
    wa.resize(pool.calc_workarea_bytes().unwrap(), 0);
    pool.init(&mut wa).unwrap();
    pool.build().unwrap();
    for class in classes.iter() {
        assert_eq!(pool.allocate(class), Err(PageAllocError::OutOfMemory));
    }
}

/// Deterministic xorshift; enough to shuffle operations.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

#[test]
fn mixed_workload_keeps_counters_and_pages_consistent() {
    let mut wa = Vec::new();
    let classes = SizeClassTable::new(&[12, 14, 18]).unwrap();
    let ranges = [
        range(0x1_3000, 2 * MIB),
        range(5 * MIB + 0x400, 3 * MIB),
        range(16 * MIB, 256 * 1024),
    ];
    let mut pool = built(classes, &ranges, &mut wa);
    let initial = pool.free_bytes();

    let mut rng = Rng(0x9E37_79B9_7F4A_7C15);
    // base -> (class, size)
    let mut live: BTreeMap<u64, (SizeClass, u64)> = BTreeMap::new();
    let mut live_bytes = 0;

    for step in 0..4000 {
        let free = rng.next() % 3 == 0 && !live.is_empty();
        if free {
            let nth = usize::try_from(rng.next()).unwrap() % live.len();
            let (&base, &(class, size)) = live.iter().nth(nth).unwrap();
            pool.deallocate(class, PhysicalAddress::new(base)).unwrap();
            live.remove(&base);
            live_bytes -= size;
        } else {
            let class = classes.get(usize::try_from(rng.next() % 3).unwrap()).unwrap();
            match pool.allocate(class) {
                Ok(page) => {
                    let size = classes.size_of(class);
                    assert!(page.is_aligned(size));
                    assert!(ranges.iter().any(|r| r.contains_span(page, size)));
                    if let Some((&prev, &(_, prev_size))) = live.range(..page.as_u64()).next_back() {
                        assert!(prev + prev_size <= page.as_u64(), "overlap at step {step}");
                    }
                    if let Some((&next, _)) = live.range(page.as_u64()..).next() {
                        assert!(page.as_u64() + size <= next, "overlap at step {step}");
                    }
                    live.insert(page.as_u64(), (class, size));
                    live_bytes += size;
                }
                Err(PageAllocError::OutOfMemory) => {}
                Err(e) => panic!("unexpected error {e}"),
            }
        }

        for c in classes.iter() {
            let s = pool.level_stats(c).unwrap();
            assert!(s.free_pages + s.allocated_pages <= s.total_pages);
        }
        assert_eq!(pool.free_bytes() + live_bytes, initial);
        if step % 100 == 0 {
            assert!(pool.check_consistency(), "inconsistent at step {step}");
        }
    }

    for (base, (class, _)) in std::mem::take(&mut live) {
        pool.deallocate(class, PhysicalAddress::new(base)).unwrap();
    }
    assert_eq!(pool.free_bytes(), initial);
    assert!(pool.check_consistency());
}

#[test]
fn overlapping_loads_free_each_page_once() {
    let large_first = [(0x44_0000, 0x4_0000), (0x43_F000, 0x2000)];
    let small_first = [(0x43_F000, 0x2000), (0x44_0000, 0x4_0000)];
    for loads in [large_first, small_first] {
        let mut wa = Vec::new();
        let mut pool = PhysicalPagePool::new(SizeClassTable::new(&[12, 18]).unwrap());
        pool.add_range(range(0x40_0000, MIB)).unwrap();
        wa.resize(pool.calc_workarea_bytes().unwrap(), 0);
        pool.init(&mut wa).unwrap();
        for (low, len) in loads {
            pool.load_free_range(PhysicalAddress::new(low), len).unwrap();
        }
        pool.build().unwrap();

        assert_eq!(pool.free_bytes(), 0x4_1000);
        assert!(pool.check_consistency());
        assert_eq!(pool.allocate(LARGE).unwrap().as_u64(), 0x44_0000);
        assert_eq!(pool.allocate(SMALL).unwrap().as_u64(), 0x43_F000);
        assert_eq!(pool.allocate(SMALL), Err(PageAllocError::OutOfMemory));
        assert_eq!(pool.free_bytes(), 0);
    }
}
