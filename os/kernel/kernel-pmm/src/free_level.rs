//! # One size class of free pages
//!
//! A [`FreePageLevel`] tracks every page of one size class over the pool's
//! normalized span with one bit per page, packed into [`Cell`]s of
//! [`CELL_BITS`](crate::CELL_BITS) bits. Cells with at least one free page are
//! kept on an index-linked free list, so `reserve_one` and `free_one` never
//! search memory.
//!
//! Levels form a chain. A cell of this level spans exactly one page of the
//! level above:
//!
//! ```text
//!  level 1 (256 KiB)  |      page 0       |      page 1       |
//!  level 0 (4 KiB)    | cell 0: 64 bits   | cell 1: 64 bits   |
//! ```
//!
//! * **promotion**: when the last page of a cell becomes free, the cell is
//!   cleared and its whole span is freed as one page of the level above.
//! * **import**: when the free list is empty, one page is reserved from the
//!   level above and installed here as a completely free cell.
//!
//! Neighbours are passed in as slices of the pool's level array: `above[0]` is
//! the next larger level, `below.last()` the next smaller one.

use crate::PageAllocError;
use kernel_memory_addresses::{PhysicalAddress, align_down, align_up};
use log::{error, trace};

/// Nil index terminating the free list.
const NIL: u32 = u32::MAX;

/// One bitmap word and its free-list links. A set bit means "page is free".
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Cell {
    bits: u64,
    prev: u32,
    next: u32,
}

impl Cell {
    /// All pages occupied, not linked.
    pub(crate) const OCCUPIED: Self = Self {
        bits: 0,
        prev: NIL,
        next: NIL,
    };
}

/// Counter snapshot of one level.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LevelStats {
    /// Page size of this level in bytes.
    pub page_size: u64,
    /// Pages the cell table can describe.
    pub total_pages: u64,
    /// Pages currently free at this level.
    pub free_pages: u64,
    /// Pages handed out by [`FreePageLevel::reserve_one`] and not yet returned.
    pub allocated_pages: u64,
}

/// Free/occupied state of one size class.
#[derive(Debug)]
pub struct FreePageLevel<'a> {
    page_shift: u32,
    cell_shift: u32,
    /// Physical address of bit 0 of cell 0.
    base: u64,
    /// Bitmap value of a cell whose pages are all free.
    full_mask: u64,
    /// Whether a larger level exists to promote into.
    has_above: bool,
    cells: &'a mut [Cell],
    head: u32,
    free_pages: u64,
    allocated_pages: u64,
}

impl<'a> FreePageLevel<'a> {
    /// A level without cells; every reservation fails until it is configured
    /// and attached.
    pub(crate) fn empty() -> Self {
        Self {
            page_shift: 0,
            cell_shift: 0,
            base: 0,
            full_mask: 0,
            has_above: false,
            cells: Default::default(),
            head: NIL,
            free_pages: 0,
            allocated_pages: 0,
        }
    }

    /// Sets the geometry. Must precede [`attach`](Self::attach).
    pub(crate) const fn configure(
        &mut self,
        page_shift: u32,
        cell_shift: u32,
        base: u64,
        has_above: bool,
    ) {
        let pages_per_cell = 1u64 << (cell_shift - page_shift);
        self.page_shift = page_shift;
        self.cell_shift = cell_shift;
        self.base = base;
        self.has_above = has_above;
        self.full_mask = if pages_per_cell == 64 {
            u64::MAX
        } else {
            (1 << pages_per_cell) - 1
        };
    }

    /// Number of cells needed to cover `span` bytes from `base`.
    #[must_use]
    pub(crate) const fn cells_for(&self, span: u64) -> u64 {
        align_up(span, 1 << self.cell_shift) >> self.cell_shift
    }

    /// Takes ownership of the cell table and marks every page occupied.
    pub(crate) fn attach(&mut self, cells: &'a mut [Cell]) {
        cells.fill(Cell::OCCUPIED);
        self.cells = cells;
        self.head = NIL;
        self.free_pages = 0;
        self.allocated_pages = 0;
    }

    #[inline]
    #[must_use]
    pub const fn page_size(&self) -> u64 {
        1 << self.page_shift
    }

    #[inline]
    #[must_use]
    pub const fn pages_per_cell(&self) -> u64 {
        1 << (self.cell_shift - self.page_shift)
    }

    #[inline]
    #[must_use]
    pub const fn total_pages(&self) -> u64 {
        (self.cells.len() as u64) << (self.cell_shift - self.page_shift)
    }

    #[inline]
    #[must_use]
    pub const fn free_pages(&self) -> u64 {
        self.free_pages
    }

    #[inline]
    #[must_use]
    pub const fn allocated_pages(&self) -> u64 {
        self.allocated_pages
    }

    #[must_use]
    pub const fn stats(&self) -> LevelStats {
        LevelStats {
            page_size: self.page_size(),
            total_pages: self.total_pages(),
            free_pages: self.free_pages,
            allocated_pages: self.allocated_pages,
        }
    }

    /// Reserves one page, importing from the level above once if needed.
    ///
    /// # Errors
    /// [`PageAllocError::OutOfMemory`] if neither this level nor the levels
    /// above have a free page.
    pub fn reserve_one(
        &mut self,
        above: &mut [FreePageLevel<'a>],
    ) -> Result<PhysicalAddress, PageAllocError> {
        let page = self.take_page(above)?;
        self.allocated_pages += 1;
        Ok(page)
    }

    /// Returns a page reserved by [`reserve_one`](Self::reserve_one).
    ///
    /// # Errors
    /// [`Misaligned`](PageAllocError::Misaligned),
    /// [`OutOfRange`](PageAllocError::OutOfRange) or
    /// [`DoubleFree`](PageAllocError::DoubleFree) for a bad address. An error
    /// from promoting into the level above is returned unchanged; the page is
    /// then lost to the allocator.
    pub fn free_one(
        &mut self,
        addr: PhysicalAddress,
        above: &mut [FreePageLevel<'a>],
    ) -> Result<(), PageAllocError> {
        self.put_page(addr, above)?;
        self.allocated_pages = self.allocated_pages.saturating_sub(1);
        Ok(())
    }

    /// Pops one page without touching `allocated_pages`.
    fn take_page(
        &mut self,
        above: &mut [FreePageLevel<'a>],
    ) -> Result<PhysicalAddress, PageAllocError> {
        if self.head == NIL {
            self.import_from_above(above)?;
        }
        let idx = self.head;
        let cell = &mut self.cells[idx as usize];
        let bit = cell.bits.trailing_zeros();
        cell.bits &= !(1 << bit);
        let now_occupied = cell.bits == 0;
        self.free_pages -= 1;
        if now_occupied {
            self.unlink(idx);
        }
        Ok(self.page_address(idx, bit))
    }

    /// Splits one page of the level above into a free cell here.
    fn import_from_above(&mut self, above: &mut [FreePageLevel<'a>]) -> Result<(), PageAllocError> {
        let Some((next, rest)) = above.split_first_mut() else {
            return Err(PageAllocError::OutOfMemory);
        };
        let page = next.take_page(rest)?;
        let (idx, _) = self.locate(page)?;
        debug_assert_eq!(self.cells[idx as usize].bits, 0, "imported cell not empty");
        self.cells[idx as usize].bits = self.full_mask;
        self.push_front(idx);
        self.free_pages += self.pages_per_cell();
        trace!(
            "imported {page} from {:#x} into {:#x} pages",
            next.page_size(),
            self.page_size()
        );
        Ok(())
    }

    /// Sets one page free without touching `allocated_pages`, promoting the
    /// cell if it became completely free.
    fn put_page(
        &mut self,
        addr: PhysicalAddress,
        above: &mut [FreePageLevel<'a>],
    ) -> Result<(), PageAllocError> {
        let (idx, bit) = self.locate(addr)?;
        let mask = 1u64 << bit;
        let bits = self.cells[idx as usize].bits;
        if bits & mask != 0 {
            return Err(PageAllocError::DoubleFree(addr));
        }
        // An empty cell may be empty because its whole span is free further up.
        if bits == 0 && above.iter().any(|level| level.is_free(addr)) {
            return Err(PageAllocError::DoubleFree(addr));
        }

        self.cells[idx as usize].bits = bits | mask;
        self.free_pages += 1;
        if bits == 0 {
            self.push_front(idx);
        }

        if bits | mask == self.full_mask
            && let Some((next, rest)) = above.split_first_mut()
        {
            self.unlink(idx);
            self.cells[idx as usize].bits = 0;
            self.free_pages -= self.pages_per_cell();
            let promoted = self.cell_address(idx);
            trace!("promoting {promoted} to {:#x} page", next.page_size());
            if let Err(e) = next.put_page(promoted, rest) {
                error!("promotion of {promoted} failed: {e}");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Whether the page of this level containing `addr` is free.
    #[must_use]
    pub fn is_free(&self, addr: PhysicalAddress) -> bool {
        let page = PhysicalAddress::new(align_down(addr.as_u64(), self.page_size()));
        self.locate(page)
            .is_ok_and(|(idx, bit)| self.cells[idx as usize].bits & (1 << bit) != 0)
    }

    /// Whether `addr` lies inside the span this level describes.
    #[must_use]
    pub fn contains(&self, addr: PhysicalAddress) -> bool {
        addr.checked_offset_from(PhysicalAddress::new(self.base))
            .is_some_and(|off| (off >> self.cell_shift) < self.cells.len() as u64)
    }

    /// Marks `[start, end)` free. Whole pages of this level are flagged here;
    /// the unaligned head and tail are handed to the smaller level. The
    /// smallest level drops partial pages.
    pub(crate) fn mark_free(&mut self, start: u64, end: u64, below: &mut [FreePageLevel<'a>]) {
        if start >= end {
            return;
        }
        let size = self.page_size();
        let first = align_up(start, size);
        let last = align_down(end, size);
        if first >= last {
            if let Some((next, rest)) = below.split_last_mut() {
                next.mark_free(start, end, rest);
            }
            return;
        }
        if let Some((next, rest)) = below.split_last_mut() {
            next.mark_free(start, first, rest);
            next.mark_free(last, end, rest);
        }
        let mut page = first;
        while page < last {
            self.set_bit(page);
            page += size;
        }
    }

    /// Links every cell with a free page and computes `free_pages`. Complete
    /// cells are handed to the level above first; call bottom-up.
    pub(crate) fn build_free_chain(&mut self, above: &mut [FreePageLevel<'a>]) {
        self.head = NIL;
        let mut free = 0;
        let mut promoted = 0u64;
        #[allow(clippy::cast_possible_truncation)]
        for idx in (0..self.cells.len() as u32).rev() {
            let bits = self.cells[idx as usize].bits;
            if bits == 0 {
                continue;
            }
            if bits == self.full_mask
                && let Some(next) = above.first_mut()
            {
                self.cells[idx as usize].bits = 0;
                next.set_bit(self.cell_address(idx).as_u64());
                promoted += 1;
                continue;
            }
            self.push_front(idx);
            free += u64::from(bits.count_ones());
        }
        self.free_pages = free;
        if promoted > 0 {
            trace!("{promoted} complete cells promoted from {:#x} pages", self.page_size());
        }
    }

    /// Clears the bits of every smaller level that lie inside a free page of
    /// this one, so memory loaded twice is listed once. Call top-down after
    /// loading and before [`build_free_chain`](Self::build_free_chain).
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn shadow_below(&self, below: &mut [FreePageLevel<'a>]) {
        let size = self.page_size();
        for (idx, cell) in self.cells.iter().enumerate() {
            let mut bits = cell.bits;
            while bits != 0 {
                let page = self.page_address(idx as u32, bits.trailing_zeros()).as_u64();
                bits &= bits - 1;
                for level in below.iter_mut() {
                    level.clear_cells(page, page + size);
                }
            }
        }
    }

    /// Whether a free page of this level lies inside a free page of a larger
    /// level.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn overlaps_above(&self, above: &[FreePageLevel<'a>]) -> bool {
        for (idx, cell) in self.cells.iter().enumerate() {
            let mut bits = cell.bits;
            while bits != 0 {
                let page = self.page_address(idx as u32, bits.trailing_zeros());
                bits &= bits - 1;
                if above.iter().any(|level| level.is_free(page)) {
                    return true;
                }
            }
        }
        false
    }

    /// Recomputes the counters and free list membership from the bitmaps.
    #[must_use]
    pub fn check_consistency(&self) -> bool {
        let mut free = 0u64;
        let mut non_empty = 0usize;
        for cell in self.cells.iter() {
            if cell.bits & !self.full_mask != 0 {
                return false;
            }
            if self.has_above && cell.bits == self.full_mask {
                return false;
            }
            if cell.bits != 0 {
                non_empty += 1;
            }
            free += u64::from(cell.bits.count_ones());
        }
        if free != self.free_pages {
            return false;
        }

        let mut listed = 0usize;
        let mut prev = NIL;
        let mut idx = self.head;
        while idx != NIL {
            let Some(cell) = self.cells.get(idx as usize) else {
                return false;
            };
            if cell.bits == 0 || cell.prev != prev || listed >= non_empty {
                return false;
            }
            listed += 1;
            prev = idx;
            idx = cell.next;
        }
        listed == non_empty
    }

    /// Empties the cells covering `[start, end)`, a span of whole cells.
    #[allow(clippy::cast_possible_truncation)]
    fn clear_cells(&mut self, start: u64, end: u64) {
        let Some(off) = start.checked_sub(self.base) else {
            return;
        };
        let first = off >> self.cell_shift;
        let last = (first + ((end - start) >> self.cell_shift)).min(self.cells.len() as u64);
        for idx in first..last {
            self.cells[idx as usize].bits = 0;
        }
    }

    fn set_bit(&mut self, addr: u64) {
        if let Ok((idx, bit)) = self.locate(PhysicalAddress::new(addr)) {
            self.cells[idx as usize].bits |= 1 << bit;
        }
    }

    /// Cell index and bit of the page starting at `addr`.
    #[allow(clippy::cast_possible_truncation)]
    fn locate(&self, addr: PhysicalAddress) -> Result<(u32, u32), PageAllocError> {
        if !addr.is_aligned(self.page_size()) {
            return Err(PageAllocError::Misaligned {
                addr,
                page_size: self.page_size(),
            });
        }
        let off = addr
            .checked_offset_from(PhysicalAddress::new(self.base))
            .ok_or(PageAllocError::OutOfRange(addr))?;
        let idx = off >> self.cell_shift;
        if idx >= self.cells.len() as u64 {
            return Err(PageAllocError::OutOfRange(addr));
        }
        let bit = (off >> self.page_shift) & (self.pages_per_cell() - 1);
        Ok((idx as u32, bit as u32))
    }

    const fn cell_address(&self, idx: u32) -> PhysicalAddress {
        PhysicalAddress::new(self.base + ((idx as u64) << self.cell_shift))
    }

    const fn page_address(&self, idx: u32, bit: u32) -> PhysicalAddress {
        PhysicalAddress::new(
            self.base + ((idx as u64) << self.cell_shift) + ((bit as u64) << self.page_shift),
        )
    }

    fn push_front(&mut self, idx: u32) {
        let head = self.head;
        let cell = &mut self.cells[idx as usize];
        cell.prev = NIL;
        cell.next = head;
        if head != NIL {
            self.cells[head as usize].prev = idx;
        }
        self.head = idx;
    }

    fn unlink(&mut self, idx: u32) {
        let Cell { prev, next, .. } = self.cells[idx as usize];
        if prev == NIL {
            self.head = next;
        } else {
            self.cells[prev as usize].next = next;
        }
        if next != NIL {
            self.cells[next as usize].prev = prev;
        }
        let cell = &mut self.cells[idx as usize];
        cell.prev = NIL;
        cell.next = NIL;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x4000_0000;

    /// Two levels, 4 KiB pages below 256 KiB pages, four 256 KiB pages wide.
    fn pair<'a>(lower: &'a mut [Cell], upper: &'a mut [Cell]) -> [FreePageLevel<'a>; 2] {
        let mut levels = [FreePageLevel::empty(), FreePageLevel::empty()];
        levels[0].configure(12, 18, BASE, true);
        levels[1].configure(18, 24, BASE, false);
        levels[0].attach(lower);
        levels[1].attach(upper);
        levels
    }

    #[test]
    fn mark_free_splits_unaligned_edges() {
        let mut lower = [Cell::OCCUPIED; 4];
        let mut upper = [Cell::OCCUPIED; 1];
        let mut levels = pair(&mut lower, &mut upper);

        // 3 pages before the first 256 KiB boundary, one big page, 2 pages after.
        let start = BASE + 0x40000 - 0x3000;
        let end = BASE + 0x80000 + 0x2000;
        let (below, top) = levels.split_at_mut(1);
        top[0].mark_free(start, end, below);
        let (lower_level, above) = levels.split_at_mut(1);
        lower_level[0].build_free_chain(above);
        levels[1].build_free_chain(&mut []);

        assert_eq!(levels[0].free_pages(), 5);
        assert_eq!(levels[1].free_pages(), 1);
        assert!(levels[0].check_consistency());
        assert!(levels[1].check_consistency());
    }

    #[test]
    fn free_list_prefers_lowest_cell() {
        let mut lower = [Cell::OCCUPIED; 4];
        let mut upper = [Cell::OCCUPIED; 1];
        let mut levels = pair(&mut lower, &mut upper);
        let (lo, hi) = levels.split_at_mut(1);
        lo[0].mark_free(BASE + 0x1000, BASE + 0x2000, &mut []);
        lo[0].mark_free(BASE + 0xC_1000, BASE + 0xC_2000, &mut []);
        lo[0].build_free_chain(hi);

        let first = lo[0].reserve_one(hi).unwrap();
        assert_eq!(first.as_u64(), BASE + 0x1000);
        let second = lo[0].reserve_one(hi).unwrap();
        assert_eq!(second.as_u64(), BASE + 0xC_1000);
        assert_eq!(lo[0].reserve_one(hi), Err(PageAllocError::OutOfMemory));
    }

    #[test]
    fn free_rejects_bad_addresses() {
        let mut lower = [Cell::OCCUPIED; 4];
        let mut upper = [Cell::OCCUPIED; 1];
        let mut levels = pair(&mut lower, &mut upper);
        let (lo, hi) = levels.split_at_mut(1);
        hi[0].mark_free(BASE, BASE + 0x40000, lo);
        lo[0].build_free_chain(hi);
        hi[0].build_free_chain(&mut []);

        let page = lo[0].reserve_one(hi).unwrap();
        assert!(matches!(
            lo[0].free_one(page + 8, hi),
            Err(PageAllocError::Misaligned { .. })
        ));
        assert_eq!(
            lo[0].free_one(PhysicalAddress::new(BASE + 0x10_0000), hi),
            Err(PageAllocError::OutOfRange(PhysicalAddress::new(BASE + 0x10_0000)))
        );
        lo[0].free_one(page, hi).unwrap();
        // the free promoted the cell back up; the page is free above now
        assert_eq!(lo[0].free_one(page, hi), Err(PageAllocError::DoubleFree(page)));
        assert!(lo[0].check_consistency());
    }

    #[test]
    fn shadowing_drops_small_pages_inside_a_free_large_page() {
        let mut lower = [Cell::OCCUPIED; 4];
        let mut upper = [Cell::OCCUPIED; 1];
        let mut levels = pair(&mut lower, &mut upper);

        // a whole 256 KiB page, then a range straddling its first byte
        let (below, top) = levels.split_at_mut(1);
        top[0].mark_free(BASE + 0x40000, BASE + 0x80000, below);
        top[0].mark_free(BASE + 0x3F000, BASE + 0x41000, below);
        assert!(below[0].overlaps_above(top));

        top[0].shadow_below(below);
        assert!(!below[0].overlaps_above(top));
        below[0].build_free_chain(top);
        top[0].build_free_chain(&mut []);

        assert_eq!(levels[0].free_pages(), 1);
        assert!(levels[0].is_free(PhysicalAddress::new(BASE + 0x3F000)));
        assert!(!levels[0].is_free(PhysicalAddress::new(BASE + 0x40000)));
        assert_eq!(levels[1].free_pages(), 1);
    }
}
