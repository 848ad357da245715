use kernel_memory_addresses::{AddressRange, HhdmPhysMapper, PhysicalAddress};
use kernel_pmm::{
    MemoryRegion, PageAllocError, PagePoolSet, PageProvider, PhysicalPagePool, SizeClass,
    SizeClassTable,
};
use kernel_sync::{CpuId, SpinLock};

const MIB: u64 = 1 << 20;
const PAGE: u64 = 4096;

#[repr(C, align(4096))]
struct Aligned4K([u8; 4096]);

fn range(low: u64, len: u64) -> AddressRange {
    AddressRange::from_base_len(PhysicalAddress::new(low), len).unwrap()
}

fn single_range_pool<'a>(
    classes: SizeClassTable,
    r: AddressRange,
    wa: &'a mut Vec<u8>,
) -> PhysicalPagePool<'a> {
    let mut pool = PhysicalPagePool::new(classes);
    pool.add_range(r).unwrap();
    wa.resize(pool.calc_workarea_bytes().unwrap(), 0);
    pool.init(wa).unwrap();
    pool.load_free_range(r.low(), r.len()).unwrap();
    pool.build().unwrap();
    pool
}

#[test]
fn bootstrap_places_the_workarea_in_usable_memory() {
    let map = [
        MemoryRegion::reserved(range(0, MIB)),
        MemoryRegion::usable(range(MIB, 8 * MIB)),
        MemoryRegion::reserved(range(9 * MIB, MIB)),
        MemoryRegion::usable(range(10 * MIB, 2 * MIB)),
    ];
    // The workarea fits one page and goes to the top of the first usable range.
    let workarea_phys = 9 * MIB - PAGE;
    let mut ram: Vec<Aligned4K> = (0..1).map(|_| Aligned4K([0xAA; 4096])).collect();
    let offset = (ram.as_mut_ptr() as u64).wrapping_sub(workarea_phys);
    let mapper = HhdmPhysMapper::with_offset(offset);

    let classes = SizeClassTable::DEFAULT;
    let mut pool = unsafe { PhysicalPagePool::bootstrap(classes, &map[..], &mapper) }.unwrap();

    assert_eq!(pool.free_bytes(), 10 * MIB - PAGE);
    assert!(pool.check_consistency());
    assert!(!pool.contains(PhysicalAddress::new(9 * MIB)));

    let mut handed_out = Vec::new();
    while let Ok(page) = pool.allocate(SizeClass::new(0)) {
        assert_ne!(page.as_u64(), workarea_phys);
        handed_out.push(page);
    }
    assert_eq!(handed_out.len() as u64, (10 * MIB - PAGE) / PAGE);
    for page in handed_out {
        pool.deallocate(SizeClass::new(0), page).unwrap();
    }
    assert_eq!(pool.free_bytes(), 10 * MIB - PAGE);
    assert!(pool.check_consistency());
}

#[test]
fn bootstrap_without_usable_memory_fails() {
    let map = [MemoryRegion::reserved(range(0, MIB))];
    let mapper = HhdmPhysMapper::with_offset(0);
    let res = unsafe {
        PhysicalPagePool::bootstrap(SizeClassTable::DEFAULT, &map[..], &mapper)
    };
    assert_eq!(res.err(), Some(PageAllocError::WrongPhase));
}

#[test]
fn locked_pool_is_a_page_provider() {
    let mut wa = Vec::new();
    let classes = SizeClassTable::new(&[12, 18]).unwrap();
    let pool = SpinLock::new(single_range_pool(classes, range(MIB, MIB), &mut wa));
    let provider: &dyn PageProvider = &pool;

    assert_eq!(provider.size_classes(), classes);
    let page = provider
        .allocate_page(SizeClass::new(1), CpuId::new(2))
        .unwrap();
    assert!(page.is_aligned(256 * 1024));
    provider
        .deallocate_page(SizeClass::new(1), page, CpuId::new(2))
        .unwrap();
    assert_eq!(pool.lock().free_bytes(), MIB);
}

#[test]
fn pool_set_prefers_home_pool_and_falls_back() {
    let classes = SizeClassTable::new(&[12]).unwrap();
    let (mut wa0, mut wa1) = (Vec::new(), Vec::new());
    let near = range(MIB, 8 * PAGE);
    let far = range(256 * MIB, 8 * PAGE);
    let set = PagePoolSet::new([
        single_range_pool(classes, near, &mut wa0),
        single_range_pool(classes, far, &mut wa1),
    ])
    .unwrap();
    assert_eq!(set.len(), 2);

    let cpu1 = CpuId::new(1);
    let mut pages = Vec::new();
    for _ in 0..8 {
        let page = set.allocate_page(SizeClass::new(0), cpu1).unwrap();
        assert!(far.contains(page));
        pages.push(page);
    }
    // home pool exhausted: the next page comes from pool 0
    let spill = set.allocate_page(SizeClass::new(0), cpu1).unwrap();
    assert!(near.contains(spill));
    pages.push(spill);

    // frees are routed by ownership, whatever CPU frees them
    for page in pages {
        set.deallocate_page(SizeClass::new(0), page, CpuId::new(0))
            .unwrap();
    }
    assert_eq!(set.free_bytes(), 16 * PAGE);

    let stray = PhysicalAddress::new(64 * MIB);
    assert_eq!(
        set.deallocate_page(SizeClass::new(0), stray, cpu1),
        Err(PageAllocError::OutOfRange(stray))
    );
}

#[test]
fn pool_set_rejects_mixed_tables() {
    let (mut wa0, mut wa1) = (Vec::new(), Vec::new());
    let a = single_range_pool(SizeClassTable::new(&[12]).unwrap(), range(MIB, MIB), &mut wa0);
    let b = single_range_pool(SizeClassTable::new(&[12, 18]).unwrap(), range(4 * MIB, MIB), &mut wa1);
    assert!(matches!(
        PagePoolSet::new([a, b]),
        Err(PageAllocError::InvalidSizeClassTable)
    ));
}
