//! # Physical page pool
//!
//! A [`PhysicalPagePool`] owns one [`FreePageLevel`] per size class over a
//! set of disjoint address ranges. Setting one up is a fixed sequence:
//!
//! 1. [`add_range`](PhysicalPagePool::add_range) for every range the pool
//!    answers for,
//! 2. [`calc_workarea_bytes`](PhysicalPagePool::calc_workarea_bytes) and
//!    [`init`](PhysicalPagePool::init) with a buffer of that size,
//! 3. [`load_free_range`](PhysicalPagePool::load_free_range) for all memory
//!    that is actually free,
//! 4. [`build`](PhysicalPagePool::build).
//!
//! Calls out of order fail with [`PageAllocError::WrongPhase`].
//!
//! The pool is not locked. Share it between CPUs through a
//! [`SpinLock`](kernel_sync::SpinLock) or partition memory into several pools
//! ([`PagePoolSet`](crate::PagePoolSet)).

use crate::free_level::{Cell, FreePageLevel, LevelStats};
use crate::{MAX_CLASSES, PageAllocError, SizeClass, SizeClassTable};
use kernel_memory_addresses::{AddressRange, PhysicalAddress, align_down};
use log::{debug, info};

/// Maximum number of address ranges per pool.
pub const MAX_RANGES: usize = 16;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Phase {
    Collecting,
    Initialized,
    Built,
}

/// Multi-level page-frame allocator over a fixed set of address ranges.
#[derive(Debug)]
pub struct PhysicalPagePool<'a> {
    classes: SizeClassTable,
    levels: [FreePageLevel<'a>; MAX_CLASSES],
    ranges: [Option<AddressRange>; MAX_RANGES],
    range_count: usize,
    /// Lowest range base, aligned down to the largest page size.
    offset: u64,
    /// Bytes from `offset` to the end of the highest range.
    length: u64,
    phase: Phase,
}

impl<'a> PhysicalPagePool<'a> {
    #[must_use]
    pub fn new(classes: SizeClassTable) -> Self {
        Self {
            classes,
            levels: core::array::from_fn(|_| FreePageLevel::empty()),
            ranges: [None; MAX_RANGES],
            range_count: 0,
            offset: 0,
            length: 0,
            phase: Phase::Collecting,
        }
    }

    #[inline]
    #[must_use]
    pub const fn classes(&self) -> &SizeClassTable {
        &self.classes
    }

    /// Registered ranges in insertion order.
    pub fn ranges(&self) -> impl Iterator<Item = AddressRange> + '_ {
        self.ranges[..self.range_count].iter().flatten().copied()
    }

    /// Whether `addr` lies in one of the registered ranges.
    #[must_use]
    pub fn contains(&self, addr: PhysicalAddress) -> bool {
        self.ranges().any(|r| r.contains(addr))
    }

    /// Registers one more range the pool answers for.
    ///
    /// # Errors
    /// [`WrongPhase`](PageAllocError::WrongPhase) after [`init`](Self::init),
    /// [`OverlappingRange`](PageAllocError::OverlappingRange),
    /// [`TooManyRanges`](PageAllocError::TooManyRanges), or
    /// [`OutOfRange`](PageAllocError::OutOfRange) for a range touching the top
    /// of the address space.
    pub fn add_range(&mut self, range: AddressRange) -> Result<(), PageAllocError> {
        if self.phase != Phase::Collecting {
            return Err(PageAllocError::WrongPhase);
        }
        if self.ranges().any(|r| r.overlaps(&range)) {
            return Err(PageAllocError::OverlappingRange);
        }
        if self.range_count == MAX_RANGES {
            return Err(PageAllocError::TooManyRanges);
        }
        range
            .high()
            .as_u64()
            .checked_add(1)
            .ok_or(PageAllocError::OutOfRange(range.high()))?;

        self.ranges[self.range_count] = Some(range);
        self.range_count += 1;

        let top = self.classes.size_of(self.classes.largest());
        let low = self.ranges().map(|r| r.low().as_u64()).min().unwrap_or(0);
        let end = self.ranges().map(|r| r.high().as_u64() + 1).max().unwrap_or(0);
        self.offset = align_down(low, top);
        self.length = end - self.offset;
        Ok(())
    }

    /// Configures every level and returns the cells each one needs.
    fn plan(&mut self) -> Result<[usize; MAX_CLASSES], PageAllocError> {
        if self.range_count == 0 {
            return Err(PageAllocError::WrongPhase);
        }
        let mut cells = [0usize; MAX_CLASSES];
        let largest = self.classes.largest();
        for class in self.classes.iter() {
            let level = &mut self.levels[class.index()];
            level.configure(
                self.classes.shift(class),
                self.classes.cell_shift(class),
                self.offset,
                class != largest,
            );
            let count = level.cells_for(self.length);
            if count >= u64::from(u32::MAX) {
                return Err(PageAllocError::OutOfRange(PhysicalAddress::new(
                    self.offset + self.length - 1,
                )));
            }
            cells[class.index()] =
                usize::try_from(count).map_err(|_| PageAllocError::OutOfMemory)?;
        }
        Ok(cells)
    }

    /// Bytes of workarea [`init`](Self::init) needs for the registered ranges,
    /// including slack for aligning the cell tables.
    ///
    /// # Errors
    /// [`WrongPhase`](PageAllocError::WrongPhase) if no range is registered or
    /// the pool is already initialized.
    pub fn calc_workarea_bytes(&mut self) -> Result<usize, PageAllocError> {
        if self.phase != Phase::Collecting {
            return Err(PageAllocError::WrongPhase);
        }
        let cells: usize = self.plan()?.iter().sum();
        Ok(cells * size_of::<Cell>() + align_of::<Cell>() - 1)
    }

    /// Carves the cell tables out of `workarea`, largest class first, and
    /// marks every page occupied.
    ///
    /// # Errors
    /// [`WrongPhase`](PageAllocError::WrongPhase) out of order, or
    /// [`WorkareaTooSmall`](PageAllocError::WorkareaTooSmall).
    pub fn init(&mut self, workarea: &'a mut [u8]) -> Result<(), PageAllocError> {
        let needed = self.calc_workarea_bytes()?;
        let available = workarea.len();
        let counts = self.plan()?;

        // SAFETY: `Cell` is plain old data; every cell is overwritten by `attach`.
        let (_, mut cells, _) = unsafe { workarea.align_to_mut::<Cell>() };
        let total: usize = counts.iter().sum();
        if cells.len() < total {
            return Err(PageAllocError::WorkareaTooSmall { needed, available });
        }

        for class in self.classes.iter().rev() {
            let (mine, rest) = core::mem::take(&mut cells).split_at_mut(counts[class.index()]);
            cells = rest;
            self.levels[class.index()].attach(mine);
        }
        self.phase = Phase::Initialized;
        debug!(
            "page pool at {:#x}+{:#x}: {total} cells in {} levels",
            self.offset,
            self.length,
            self.classes.len()
        );
        Ok(())
    }

    /// Marks `[addr, addr + bytes)` free, clipped to the registered ranges.
    /// Parts smaller than the smallest page are ignored. Loads may overlap;
    /// memory loaded twice is still free only once.
    ///
    /// # Errors
    /// [`WrongPhase`](PageAllocError::WrongPhase) unless called between
    /// [`init`](Self::init) and [`build`](Self::build).
    pub fn load_free_range(
        &mut self,
        addr: PhysicalAddress,
        bytes: u64,
    ) -> Result<(), PageAllocError> {
        if self.phase != Phase::Initialized {
            return Err(PageAllocError::WrongPhase);
        }
        let Some(loaded) = AddressRange::from_base_len(addr, bytes) else {
            return Ok(());
        };
        let n = self.classes.len();
        for i in 0..self.range_count {
            let Some(part) = self.ranges[i].and_then(|r| r.intersect(&loaded)) else {
                continue;
            };
            if let Some((top, below)) = self.levels[..n].split_last_mut() {
                top.mark_free(part.low().as_u64(), part.high().as_u64() + 1, below);
            }
        }
        Ok(())
    }

    /// Builds the free lists, smallest class first, promoting complete cells.
    ///
    /// # Errors
    /// [`WrongPhase`](PageAllocError::WrongPhase) unless initialized.
    pub fn build(&mut self) -> Result<(), PageAllocError> {
        if self.phase != Phase::Initialized {
            return Err(PageAllocError::WrongPhase);
        }
        let n = self.classes.len();
        for i in (1..n).rev() {
            let (below, upper) = self.levels[..n].split_at_mut(i);
            upper[0].shadow_below(below);
        }
        for i in 0..n {
            let (lower, upper) = self.levels[..n].split_at_mut(i + 1);
            lower[i].build_free_chain(upper);
        }
        for class in self.classes.iter() {
            let level = &self.levels[class.index()];
            debug!(
                "{class} ({:#x}): {} of {} pages free",
                level.page_size(),
                level.free_pages(),
                level.total_pages()
            );
        }
        self.phase = Phase::Built;
        info!(
            "page pool ready: {} ranges, {} KiB free",
            self.range_count,
            self.free_bytes() / 1024
        );
        Ok(())
    }

    /// Reserves one page of `class`.
    ///
    /// # Errors
    /// [`OutOfMemory`](PageAllocError::OutOfMemory) if neither `class` nor a
    /// larger class has a free page; [`InvalidSizeClass`](PageAllocError::InvalidSizeClass)
    /// or [`WrongPhase`](PageAllocError::WrongPhase) for caller bugs.
    pub fn allocate(&mut self, class: SizeClass) -> Result<PhysicalAddress, PageAllocError> {
        if self.phase != Phase::Built {
            return Err(PageAllocError::WrongPhase);
        }
        self.classes.check(class)?;
        let (lower, upper) = self.levels[..self.classes.len()].split_at_mut(class.index() + 1);
        lower[class.index()].reserve_one(upper)
    }

    /// Returns a page of `class`.
    ///
    /// # Errors
    /// [`OutOfRange`](PageAllocError::OutOfRange) if `addr` is outside every
    /// registered range (checked first, so a dispatcher can try another pool),
    /// otherwise the errors of [`FreePageLevel::free_one`].
    pub fn deallocate(
        &mut self,
        class: SizeClass,
        addr: PhysicalAddress,
    ) -> Result<(), PageAllocError> {
        if !self.contains(addr) {
            return Err(PageAllocError::OutOfRange(addr));
        }
        if self.phase != Phase::Built {
            return Err(PageAllocError::WrongPhase);
        }
        self.classes.check(class)?;
        let (lower, upper) = self.levels[..self.classes.len()].split_at_mut(class.index() + 1);
        lower[class.index()].free_one(addr, upper)
    }

    /// Counters of one level.
    ///
    /// # Errors
    /// [`InvalidSizeClass`](PageAllocError::InvalidSizeClass).
    pub fn level_stats(&self, class: SizeClass) -> Result<LevelStats, PageAllocError> {
        self.classes.check(class)?;
        Ok(self.levels[class.index()].stats())
    }

    /// Free bytes over all levels.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.classes
            .iter()
            .map(|c| self.levels[c.index()].free_pages() * self.classes.size_of(c))
            .sum()
    }

    /// Whether every level's counters and free list match its bitmaps, and
    /// no free page is also covered by a free page of a larger level.
    #[must_use]
    pub fn check_consistency(&self) -> bool {
        let levels = &self.levels[..self.classes.len()];
        levels
            .iter()
            .enumerate()
            .all(|(i, level)| level.check_consistency() && !level.overlaps_above(&levels[i + 1..]))
    }
}
