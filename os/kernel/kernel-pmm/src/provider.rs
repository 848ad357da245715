use crate::{PageAllocError, PhysicalPagePool, SizeClass, SizeClassTable};
use kernel_memory_addresses::PhysicalAddress;
use kernel_sync::{CpuId, SpinLock};

/// The page-allocation call object allocators make.
///
/// `cpu` names the calling CPU. Implementations use it to pick a nearby pool
/// and to detect lock re-entry; it never changes which pages are valid.
pub trait PageProvider {
    /// The size classes pages are handed out in.
    fn size_classes(&self) -> SizeClassTable;

    /// Reserves one page of `class`.
    ///
    /// # Errors
    /// [`PageAllocError::OutOfMemory`] when no page is left.
    fn allocate_page(&self, class: SizeClass, cpu: CpuId)
    -> Result<PhysicalAddress, PageAllocError>;

    /// Returns a page obtained from [`allocate_page`](Self::allocate_page).
    ///
    /// # Errors
    /// [`PageAllocError::OutOfRange`] if the page is not managed here.
    fn deallocate_page(
        &self,
        class: SizeClass,
        page: PhysicalAddress,
        cpu: CpuId,
    ) -> Result<(), PageAllocError>;
}

impl PageProvider for SpinLock<PhysicalPagePool<'_>> {
    fn size_classes(&self) -> SizeClassTable {
        *self.lock().classes()
    }

    fn allocate_page(
        &self,
        class: SizeClass,
        cpu: CpuId,
    ) -> Result<PhysicalAddress, PageAllocError> {
        self.lock_as(cpu).allocate(class)
    }

    fn deallocate_page(
        &self,
        class: SizeClass,
        page: PhysicalAddress,
        cpu: CpuId,
    ) -> Result<(), PageAllocError> {
        self.lock_as(cpu).deallocate(class, page)
    }
}
