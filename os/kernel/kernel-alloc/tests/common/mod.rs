//! Simulated machine for the allocator tests: leaked RAM frames behind an
//! offset mapper, one locked page pool, and a thread-local current CPU.

#![allow(dead_code)]

use kernel_alloc::{AllocConfig, AllocEnv, CpuTopology};
use kernel_memory_addresses::{AddressRange, HhdmPhysMapper, PhysicalAddress};
use kernel_pmm::{PhysicalPagePool, SizeClass, SizeClassTable};
use kernel_sync::{CpuId, SpinLock};
use std::cell::Cell;

pub const RAM_BASE: u64 = 0x1000_0000;
pub const MIB: usize = 1 << 20;
pub const SMALL: SizeClass = SizeClass::new(0);
pub const MEDIUM: SizeClass = SizeClass::new(1);

#[repr(C, align(4096))]
struct Aligned4K([u8; 4096]);

thread_local! {
    static CURRENT: Cell<u32> = const { Cell::new(0) };
}

/// Makes the calling thread run as `cpu`.
pub fn run_as(cpu: u32) {
    CURRENT.set(cpu);
}

pub const fn cpu(id: u32) -> CpuId {
    CpuId::new(id)
}

pub struct TestCpus {
    count: usize,
}

impl CpuTopology for TestCpus {
    fn cpu_count(&self) -> usize {
        self.count
    }

    fn current_cpu(&self) -> CpuId {
        CpuId::new(CURRENT.get())
    }
}

pub struct Machine {
    pub pages: &'static SpinLock<PhysicalPagePool<'static>>,
    pub mapper: &'static HhdmPhysMapper,
    pub cpus: &'static TestCpus,
    pub ram_bytes: usize,
}

impl Machine {
    /// 4 KiB / 16 KiB / 64 KiB pages over `ram_mib` MiB at [`RAM_BASE`].
    pub fn new(cpus: usize, ram_mib: usize) -> Self {
        let ram_bytes = ram_mib * MIB;
        let frames: Vec<Aligned4K> = (0..ram_bytes / 4096).map(|_| Aligned4K([0; 4096])).collect();
        let frames = Box::leak(frames.into_boxed_slice());
        let offset = (frames.as_mut_ptr() as u64).wrapping_sub(RAM_BASE);
        let mapper = Box::leak(Box::new(HhdmPhysMapper::with_offset(offset)));

        let classes = SizeClassTable::new(&[12, 14, 16]).unwrap();
        let ram = AddressRange::from_base_len(PhysicalAddress::new(RAM_BASE), ram_bytes as u64)
            .unwrap();
        let mut pool = PhysicalPagePool::new(classes);
        pool.add_range(ram).unwrap();
        let workarea = Box::leak(vec![0u8; pool.calc_workarea_bytes().unwrap()].into_boxed_slice());
        pool.init(workarea).unwrap();
        pool.load_free_range(ram.low(), ram.len()).unwrap();
        pool.build().unwrap();

        Self {
            pages: Box::leak(Box::new(SpinLock::new(pool))),
            mapper,
            cpus: Box::leak(Box::new(TestCpus { count: cpus })),
            ram_bytes,
        }
    }

    pub fn env(&self) -> AllocEnv<'static> {
        AllocEnv::new(self.pages, self.mapper, self.cpus)
    }

    pub fn env_with(&self, config: AllocConfig) -> AllocEnv<'static> {
        self.env().with_config(config)
    }

    pub fn free_bytes(&self) -> u64 {
        self.pages.lock().free_bytes()
    }

    /// Whether `addr` lies in the simulated RAM.
    pub fn owns(&self, addr: usize) -> bool {
        let low = self.mapper.offset().wrapping_add(RAM_BASE) as usize;
        (low..low + self.ram_bytes).contains(&addr)
    }
}
