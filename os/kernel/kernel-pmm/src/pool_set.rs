//! # Several page pools behind one provider
//!
//! Physical memory is partitioned into one [`PhysicalPagePool`] per affinity
//! domain so CPUs rarely contend on the same lock. Allocation starts at the
//! calling CPU's home pool and moves on when that pool runs dry; a free is
//! routed to whichever pool reports that it owns the address.

use crate::{PageAllocError, PageProvider, PhysicalPagePool, SizeClass, SizeClassTable};
use kernel_memory_addresses::PhysicalAddress;
use kernel_sync::{CpuId, SpinLock};
use log::trace;

/// `N` locked page pools sharing one size-class table.
pub struct PagePoolSet<'a, const N: usize> {
    classes: SizeClassTable,
    pools: [SpinLock<PhysicalPagePool<'a>>; N],
}

impl<'a, const N: usize> PagePoolSet<'a, N> {
    /// Wraps built pools. Pool `i` is the home of every CPU `c` with `c % N == i`.
    ///
    /// # Errors
    /// [`PageAllocError::InvalidSizeClassTable`] if `N` is zero or the pools
    /// disagree on their size classes.
    pub fn new(pools: [PhysicalPagePool<'a>; N]) -> Result<Self, PageAllocError> {
        let classes = *pools
            .first()
            .ok_or(PageAllocError::InvalidSizeClassTable)?
            .classes();
        if pools.iter().any(|p| *p.classes() != classes) {
            return Err(PageAllocError::InvalidSizeClassTable);
        }
        Ok(Self {
            classes,
            pools: pools.map(SpinLock::new),
        })
    }

    /// Number of pools.
    #[must_use]
    pub const fn len(&self) -> usize {
        N
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        N == 0
    }

    /// The pool at `index`, for inspection.
    #[must_use]
    pub fn pool(&self, index: usize) -> Option<&SpinLock<PhysicalPagePool<'a>>> {
        self.pools.get(index)
    }

    /// Reserves a page from `cpu`'s home pool, then from the others in turn.
    ///
    /// # Errors
    /// [`PageAllocError::OutOfMemory`] once every pool has refused; any other
    /// error is returned immediately.
    pub fn allocate(
        &self,
        class: SizeClass,
        cpu: CpuId,
    ) -> Result<PhysicalAddress, PageAllocError> {
        let home = cpu.index() % N;
        for step in 0..N {
            let idx = (home + step) % N;
            match self.pools[idx].lock_as(cpu).allocate(class) {
                Err(PageAllocError::OutOfMemory) => {
                    trace!("pool {idx} exhausted for {class}");
                }
                other => return other,
            }
        }
        Err(PageAllocError::OutOfMemory)
    }

    /// Returns a page to the pool that owns it.
    ///
    /// # Errors
    /// [`PageAllocError::OutOfRange`] if no pool owns `page`, otherwise the
    /// owning pool's error.
    pub fn deallocate(
        &self,
        class: SizeClass,
        page: PhysicalAddress,
        cpu: CpuId,
    ) -> Result<(), PageAllocError> {
        for pool in &self.pools {
            match pool.lock_as(cpu).deallocate(class, page) {
                Err(PageAllocError::OutOfRange(_)) => {}
                other => return other,
            }
        }
        Err(PageAllocError::OutOfRange(page))
    }

    /// Free bytes over all pools.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.pools.iter().map(|p| p.lock().free_bytes()).sum()
    }
}

impl<const N: usize> PageProvider for PagePoolSet<'_, N> {
    fn size_classes(&self) -> SizeClassTable {
        self.classes
    }

    fn allocate_page(
        &self,
        class: SizeClass,
        cpu: CpuId,
    ) -> Result<PhysicalAddress, PageAllocError> {
        self.allocate(class, cpu)
    }

    fn deallocate_page(
        &self,
        class: SizeClass,
        page: PhysicalAddress,
        cpu: CpuId,
    ) -> Result<(), PageAllocError> {
        self.deallocate(class, page, cpu)
    }
}
