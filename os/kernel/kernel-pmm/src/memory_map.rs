//! # Bootstrapping from the firmware memory map
//!
//! Firmware reports physical memory as a list of regions. The pool answers for
//! every usable region and needs a workarea for its cell tables before any
//! allocator exists, so [`PhysicalPagePool::bootstrap`] takes that workarea
//! from the top of the first usable region that is large enough and loads
//! everything else as free memory.

use crate::{PageAllocError, PhysicalPagePool, SizeClassTable};
use kernel_memory_addresses::{AddressRange, PhysMapper, PhysicalAddress, align_down, align_up};
use log::info;

/// What a region of physical memory may be used for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionKind {
    /// Free RAM.
    Usable,
    /// Firmware, MMIO, the loaded kernel image, anything not to be touched.
    Reserved,
}

/// One entry of the memory map.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    pub range: AddressRange,
    pub kind: RegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn usable(range: AddressRange) -> Self {
        Self {
            range,
            kind: RegionKind::Usable,
        }
    }

    #[must_use]
    pub const fn reserved(range: AddressRange) -> Self {
        Self {
            range,
            kind: RegionKind::Reserved,
        }
    }
}

/// Source of the physical ranges considered usable.
pub trait AddressRangeProvider {
    fn usable_ranges(&self) -> impl Iterator<Item = AddressRange> + '_;
}

impl AddressRangeProvider for [MemoryRegion] {
    fn usable_ranges(&self) -> impl Iterator<Item = AddressRange> + '_ {
        self.iter()
            .filter(|r| r.kind == RegionKind::Usable)
            .map(|r| r.range)
    }
}

impl<'a> PhysicalPagePool<'a> {
    /// Builds a pool over every usable range of `map`.
    ///
    /// The cell tables are placed at the top of the first usable range with
    /// room for them and accessed through `mapper`; that memory stays
    /// allocated for the lifetime of the pool.
    ///
    /// # Errors
    /// Any error of the bootstrap sequence, or
    /// [`WorkareaTooSmall`](PageAllocError::WorkareaTooSmall) if no usable
    /// range can hold the workarea.
    ///
    /// # Safety
    /// `mapper` must translate every usable range to memory that is mapped
    /// read-write for `'a` and used by nothing else.
    pub unsafe fn bootstrap<P, M>(
        classes: SizeClassTable,
        map: &P,
        mapper: &M,
    ) -> Result<Self, PageAllocError>
    where
        P: AddressRangeProvider + ?Sized,
        M: PhysMapper + ?Sized,
    {
        let mut pool = Self::new(classes);
        for range in map.usable_ranges() {
            pool.add_range(range)?;
        }

        let needed = pool.calc_workarea_bytes()?;
        let page = classes.size_of(classes.smallest());
        let steal = align_up(needed as u64, page);
        let workarea = map
            .usable_ranges()
            .find_map(|r| {
                let end = align_down(r.high().as_u64().checked_add(1)?, page);
                let start = end.checked_sub(steal)?;
                if start < r.low().as_u64() {
                    return None;
                }
                AddressRange::from_base_len(PhysicalAddress::new(start), steal)
            })
            .ok_or(PageAllocError::WorkareaTooSmall {
                needed,
                available: 0,
            })?;
        let len = usize::try_from(steal).map_err(|_| PageAllocError::OutOfMemory)?;

        let ptr = mapper.phys_to_virt(workarea.low()).as_mut_ptr::<u8>();
        // SAFETY: the caller guarantees the usable ranges are mapped and unused;
        // the stolen span is excluded from the free memory loaded below.
        let buffer: &'a mut [u8] = unsafe { core::slice::from_raw_parts_mut(ptr, len) };
        pool.init(buffer)?;

        for range in map.usable_ranges() {
            let end = range.high().as_u64() + 1;
            if range.overlaps(&workarea) {
                let below = range.low().as_u64();
                let above = workarea.high().as_u64() + 1;
                pool.load_free_range(range.low(), workarea.low().as_u64().saturating_sub(below))?;
                pool.load_free_range(PhysicalAddress::new(above), end.saturating_sub(above))?;
            } else {
                pool.load_free_range(range.low(), range.len())?;
            }
        }
        pool.build()?;
        info!("page pool workarea at {workarea} ({needed} bytes used)");
        Ok(pool)
    }
}
