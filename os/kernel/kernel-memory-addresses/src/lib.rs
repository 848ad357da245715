//! # Physical and Virtual Memory Address Types
//!
//! Strongly typed wrappers for the raw addresses handled by the page-frame and
//! object allocators.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A physical byte address (host RAM). |
//! | [`VirtualAddress`] | An address in the current virtual address space. |
//! | [`AddressRange`] | An inclusive `[low, high]` physical byte range. |
//! | [`PhysMapper`] | Translates physical addresses to usable virtual ones and back. |
//!
//! Keeping physical and virtual addresses apart at the type level prevents the
//! classic mistake of handing a physical page base to code that dereferences
//! it. The allocators only ever *compute* with physical addresses; whenever
//! they need to touch a page's bytes they go through a [`PhysMapper`].
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let range = AddressRange::from_base_len(PhysicalAddress::new(0x10_0000), 0x10_0000).unwrap();
//! assert_eq!(range.high().as_u64(), 0x1F_FFFF);
//! assert!(range.contains(PhysicalAddress::new(0x18_0000)));
//!
//! let pa = PhysicalAddress::new(0x12345);
//! assert_eq!(pa.align_down(4096).as_u64(), 0x12000);
//! assert_eq!(pa.align_up(4096).as_u64(), 0x13000);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod address_range;
mod phys_mapper;
mod physical_address;
mod virtual_address;

pub use address_range::AddressRange;
pub use phys_mapper::{HHDM_BASE, HhdmPhysMapper, PhysMapper};
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Align `x` down to the nearest multiple of `a`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
#[allow(clippy::inline_always)]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
/// - `x + (a - 1)` must not overflow `u64`.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
#[allow(clippy::inline_always)]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0x12345, 0x1000), 0x12000);
        assert_eq!(align_up(0x12345, 0x1000), 0x13000);
        assert_eq!(align_up(0x40000, 0x40000), 0x40000);
        assert_eq!(align_down(0x7FFFF, 0x40000), 0x40000);
    }

    #[test]
    fn physical_and_virtual_stay_distinct() {
        let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
        let mapper = HhdmPhysMapper::with_offset(0x1000);
        let va = mapper.phys_to_virt(pa);
        assert_eq!(va.as_u64(), 0x0000_0010_2000_1042);
        assert_eq!(mapper.virt_to_phys(va), pa);
    }
}
