//! # Page size classes
//!
//! A [`SizeClassTable`] lists the page sizes the frame allocator manages, as
//! powers of two, smallest first. The default table has four classes:
//!
//! | Class | Page size |
//! |-------|-----------|
//! | 0 | 4 KiB |
//! | 1 | 256 KiB |
//! | 2 | 16 MiB |
//! | 3 | 1 GiB |
//!
//! Each class's cell (one bitmap word, [`CELL_BITS`] pages) spans exactly one
//! page of the next larger class, which is why neighbouring classes may be at
//! most `log2(CELL_BITS)` bits apart.

use crate::PageAllocError;
use core::fmt;

/// Pages tracked per cell bitmap.
pub const CELL_BITS: u32 = u64::BITS;

/// `log2(CELL_BITS)`: the largest allowed step between neighbouring classes.
pub const CELL_SHIFT: u32 = CELL_BITS.trailing_zeros();

/// Upper bound on the number of classes in one table.
pub const MAX_CLASSES: usize = 8;

/// Smallest supported page: 4 KiB.
pub const MIN_PAGE_SHIFT: u8 = 12;

/// Largest supported page; the top level's cell must still fit in 64 bits.
pub const MAX_PAGE_SHIFT: u8 = 48;

const _: () = {
    assert!(CELL_BITS == 64);
    assert!(1 << CELL_SHIFT == CELL_BITS);
    assert!(MAX_PAGE_SHIFT as u32 + CELL_SHIFT < u64::BITS);
};

/// Index into a [`SizeClassTable`]; `0` is the smallest page size.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SizeClass(u8);

impl SizeClass {
    #[inline]
    #[must_use]
    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class{}", self.0)
    }
}

/// Ordered page sizes, stored as shifts.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SizeClassTable {
    shifts: [u8; MAX_CLASSES],
    len: u8,
}

impl SizeClassTable {
    /// 4 KiB / 256 KiB / 16 MiB / 1 GiB.
    pub const DEFAULT: Self = match Self::new(&[12, 18, 24, 30]) {
        Ok(table) => table,
        Err(_) => panic!("default size classes are invalid"),
    };

    /// Build a table from page shifts, smallest first.
    ///
    /// # Errors
    /// [`PageAllocError::InvalidSizeClassTable`] unless there are
    /// `1..=MAX_CLASSES` shifts in `MIN_PAGE_SHIFT..=MAX_PAGE_SHIFT`, strictly
    /// increasing and at most [`CELL_SHIFT`] apart.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(shifts: &[u8]) -> Result<Self, PageAllocError> {
        if shifts.is_empty() || shifts.len() > MAX_CLASSES {
            return Err(PageAllocError::InvalidSizeClassTable);
        }
        let mut table = [0u8; MAX_CLASSES];
        let mut i = 0;
        while i < shifts.len() {
            let s = shifts[i];
            if s < MIN_PAGE_SHIFT || s > MAX_PAGE_SHIFT {
                return Err(PageAllocError::InvalidSizeClassTable);
            }
            if i > 0 {
                let prev = shifts[i - 1];
                if s <= prev || (s - prev) as u32 > CELL_SHIFT {
                    return Err(PageAllocError::InvalidSizeClassTable);
                }
            }
            table[i] = s;
            i += 1;
        }
        Ok(Self {
            shifts: table,
            len: shifts.len() as u8,
        })
    }

    /// Number of classes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    /// A table always has at least one class.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    #[inline]
    #[must_use]
    pub const fn smallest(&self) -> SizeClass {
        SizeClass(0)
    }

    #[inline]
    #[must_use]
    pub const fn largest(&self) -> SizeClass {
        SizeClass(self.len - 1)
    }

    /// The class with the given index, if it exists.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn get(&self, index: usize) -> Option<SizeClass> {
        if index < self.len() {
            Some(SizeClass(index as u8))
        } else {
            None
        }
    }

    /// Fails with [`PageAllocError::InvalidSizeClass`] for foreign indices.
    ///
    /// # Errors
    /// See above.
    #[inline]
    pub const fn check(&self, class: SizeClass) -> Result<(), PageAllocError> {
        if class.index() < self.len() {
            Ok(())
        } else {
            Err(PageAllocError::InvalidSizeClass(class.index()))
        }
    }

    /// `log2` of the page size of `class`. `class` must be valid.
    #[inline]
    #[must_use]
    pub const fn shift(&self, class: SizeClass) -> u32 {
        self.shifts[class.index()] as u32
    }

    /// Page size of `class` in bytes. `class` must be valid.
    #[inline]
    #[must_use]
    pub const fn size_of(&self, class: SizeClass) -> u64 {
        1 << self.shift(class)
    }

    /// `log2` of the byte span of one cell of `class`: the next class's page
    /// size, or [`CELL_BITS`] pages for the largest class.
    #[inline]
    #[must_use]
    pub const fn cell_shift(&self, class: SizeClass) -> u32 {
        let next = class.index() + 1;
        if next < self.len() {
            self.shifts[next] as u32
        } else {
            self.shift(class) + CELL_SHIFT
        }
    }

    /// Smallest class whose page holds `bytes`; `None` if even the largest
    /// page is too small.
    #[must_use]
    pub fn classify(&self, bytes: u64) -> Option<SizeClass> {
        self.iter().find(|&c| self.size_of(c) >= bytes)
    }

    /// All classes, smallest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = SizeClass> + use<> {
        (0..self.len).map(SizeClass)
    }
}

impl Default for SizeClassTable {
    fn default() -> Self {
        Self::DEFAULT
    }
}
