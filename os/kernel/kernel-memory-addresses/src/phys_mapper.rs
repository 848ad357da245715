//! # Physical-to-virtual translation
//!
//! The allocators compute with physical addresses but must read and write the
//! bytes of Cell tables and Slab pages. [`PhysMapper`] is the seam through
//! which they obtain a usable pointer; the mapping strategy (HHDM, identity,
//! a test buffer) belongs to the caller.
//!
//! ## Example
//! ```rust
//! use kernel_memory_addresses::{HhdmPhysMapper, PhysMapper, PhysicalAddress};
//! let mapper = HhdmPhysMapper::KERNEL;
//! let va = mapper.phys_to_virt(PhysicalAddress::new(0x1234_0000));
//! assert_eq!(mapper.virt_to_phys(va).as_u64(), 0x1234_0000);
//! ```

use crate::{PhysicalAddress, VirtualAddress};

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything mapped at [`HHDM_BASE`] + `pa` lets the kernel access physical
/// memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Converts physical addresses to addresses usable in the current virtual
/// address space, and back.
///
/// Implementations must be pure: the same input always yields the same output
/// and the translation is linear within any page the allocators hand out.
pub trait PhysMapper {
    /// Virtual address at which the byte at `pa` is visible.
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress;

    /// Inverse of [`phys_to_virt`](Self::phys_to_virt).
    fn virt_to_phys(&self, va: VirtualAddress) -> PhysicalAddress;
}

/// [`PhysMapper`] for kernels with a direct map at a fixed offset.
///
/// The kernel uses [`HhdmPhysMapper::KERNEL`]; hosted tests pick an offset
/// that lands synthetic physical addresses inside a buffer they own.
///
/// # Safety
/// Translation itself is safe. Dereferencing the result is only sound if the
/// direct map is present and covers the referenced physical range.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HhdmPhysMapper {
    offset: u64,
}

impl HhdmPhysMapper {
    /// The kernel's higher-half direct map.
    pub const KERNEL: Self = Self::with_offset(HHDM_BASE);

    /// A direct map at `offset`; arithmetic wraps, so offsets may be "negative".
    #[must_use]
    pub const fn with_offset(offset: u64) -> Self {
        Self { offset }
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }
}

impl Default for HhdmPhysMapper {
    fn default() -> Self {
        Self::KERNEL
    }
}

impl PhysMapper for HhdmPhysMapper {
    #[inline]
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(pa.as_u64().wrapping_add(self.offset))
    }

    #[inline]
    fn virt_to_phys(&self, va: VirtualAddress) -> PhysicalAddress {
        PhysicalAddress::new(va.as_u64().wrapping_sub(self.offset))
    }
}
