//! # Physical page-frame allocator
//!
//! Tracks free and occupied physical pages in several fixed page sizes at
//! once. Each size class is a [`FreePageLevel`]: a table of 64-bit cells, one
//! bit per page, with the cells that still have a free page on a free list.
//! A cell of one class spans exactly one page of the next larger class, which
//! gives the two operations that tie the levels together:
//!
//! * freeing the last occupied page of a cell **promotes** the cell to one
//!   free page of the class above;
//! * reserving from a level without free pages **imports** one page from the
//!   class above and splits it into a fresh cell.
//!
//! A [`PhysicalPagePool`] owns one level per class over a set of address
//! ranges; a [`PagePoolSet`] spreads allocation over several pools. Object
//! allocators consume pages through the [`PageProvider`] trait.
//!
//! ## Example
//!
//! ```rust
//! use kernel_memory_addresses::{AddressRange, PhysicalAddress};
//! use kernel_pmm::{PhysicalPagePool, SizeClass, SizeClassTable};
//!
//! let classes = SizeClassTable::new(&[12, 18]).unwrap();
//! let mut pool = PhysicalPagePool::new(classes);
//! let ram = AddressRange::from_base_len(PhysicalAddress::new(0x10_0000), 0x10_0000).unwrap();
//! pool.add_range(ram).unwrap();
//!
//! let mut workarea = vec![0u8; pool.calc_workarea_bytes().unwrap()];
//! pool.init(&mut workarea).unwrap();
//! pool.load_free_range(ram.low(), ram.len()).unwrap();
//! pool.build().unwrap();
//!
//! let page = pool.allocate(SizeClass::new(0)).unwrap();
//! assert!(ram.contains(page));
//! pool.deallocate(SizeClass::new(0), page).unwrap();
//! assert_eq!(pool.free_bytes(), ram.len());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod error;
mod free_level;
mod memory_map;
mod page_pool;
mod pool_set;
mod provider;
mod size_class;

pub use error::PageAllocError;
pub use free_level::{FreePageLevel, LevelStats};
pub use memory_map::{AddressRangeProvider, MemoryRegion, RegionKind};
pub use page_pool::{MAX_RANGES, PhysicalPagePool};
pub use pool_set::PagePoolSet;
pub use provider::PageProvider;
pub use size_class::{
    CELL_BITS, CELL_SHIFT, MAX_CLASSES, MAX_PAGE_SHIFT, MIN_PAGE_SHIFT, SizeClass, SizeClassTable,
};
