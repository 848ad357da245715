//! # Collaborators
//!
//! The object allocator runs on top of three services it does not implement:
//! a page source, a physical-to-virtual translation, and the CPU topology.
//! [`AllocEnv`] bundles them with the [`AllocConfig`] and is passed explicitly
//! to everything that needs them.

use crate::{AllocConfig, AllocError, frame::PageFrame};
use kernel_memory_addresses::{PhysMapper, PhysicalAddress};
use kernel_pmm::{PageProvider, SizeClass};
use kernel_sync::CpuId;

/// Which CPUs exist and which one is running.
pub trait CpuTopology {
    /// Number of CPUs; ids are `0..cpu_count()`.
    fn cpu_count(&self) -> usize;

    /// The CPU executing the caller. Only meaningful while the caller cannot
    /// migrate (preemption disabled).
    fn current_cpu(&self) -> CpuId;
}

/// Everything an object pool needs from the outside world.
#[derive(Copy, Clone)]
pub struct AllocEnv<'k> {
    pub pages: &'k (dyn PageProvider + Sync),
    pub mapper: &'k (dyn PhysMapper + Sync),
    pub cpus: &'k (dyn CpuTopology + Sync),
    pub config: AllocConfig,
}

impl<'k> AllocEnv<'k> {
    #[must_use]
    pub const fn new(
        pages: &'k (dyn PageProvider + Sync),
        mapper: &'k (dyn PhysMapper + Sync),
        cpus: &'k (dyn CpuTopology + Sync),
    ) -> Self {
        Self {
            pages,
            mapper,
            cpus,
            config: AllocConfig::DEFAULT,
        }
    }

    #[must_use]
    pub const fn with_config(mut self, config: AllocConfig) -> Self {
        self.config = config;
        self
    }

    #[inline]
    pub(crate) fn current_cpu(&self) -> CpuId {
        self.cpus.current_cpu()
    }

    /// Byte size of a page of `class`.
    pub(crate) fn page_bytes(&self, class: SizeClass) -> Result<usize, AllocError> {
        let classes = self.pages.size_classes();
        classes.check(class)?;
        usize::try_from(classes.size_of(class))
            .map_err(|_| AllocError::InvalidArgument("page size exceeds the address space"))
    }

    /// Reserves one page of `class` and maps it.
    pub(crate) fn allocate_frame(
        &self,
        class: SizeClass,
        cpu: CpuId,
    ) -> Result<PageFrame, AllocError> {
        let len = self.page_bytes(class)?;
        let page = self.pages.allocate_page(class, cpu)?;
        match PageFrame::map(self.mapper, page, len) {
            Ok(frame) => Ok(frame),
            Err(e) => {
                self.pages.deallocate_page(class, page, cpu)?;
                Err(e)
            }
        }
    }

    /// Returns a page obtained from [`allocate_frame`](Self::allocate_frame).
    pub(crate) fn free_page(
        &self,
        class: SizeClass,
        page: PhysicalAddress,
        cpu: CpuId,
    ) -> Result<(), AllocError> {
        self.pages.deallocate_page(class, page, cpu)?;
        Ok(())
    }
}

impl core::fmt::Debug for AllocEnv<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AllocEnv")
            .field("cpus", &self.cpus.cpu_count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
