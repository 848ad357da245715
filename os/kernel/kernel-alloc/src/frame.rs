//! # Typed views of mapped pages
//!
//! A [`PageFrame`] is one physical page together with the virtual address it
//! is reachable at. Structures placed on a page are obtained through
//! [`PageFrame::overlay`], which checks bounds and alignment, instead of
//! casting raw addresses.

use crate::AllocError;
use core::ptr::NonNull;
use kernel_memory_addresses::{PhysMapper, PhysicalAddress};

/// One mapped page.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PageFrame {
    phys: PhysicalAddress,
    virt: NonNull<u8>,
    len: usize,
}

impl PageFrame {
    /// Maps `len` bytes at `phys` through `mapper`.
    ///
    /// # Errors
    /// [`AllocError::InternalInconsistency`] if the mapper yields a null address.
    pub fn map(
        mapper: &(impl PhysMapper + ?Sized),
        phys: PhysicalAddress,
        len: usize,
    ) -> Result<Self, AllocError> {
        let virt = mapper
            .phys_to_virt(phys)
            .as_non_null::<u8>()
            .ok_or(AllocError::InternalInconsistency("page maps to null"))?;
        Ok(Self { phys, virt, len })
    }

    #[inline]
    #[must_use]
    pub const fn phys(&self) -> PhysicalAddress {
        self.phys
    }

    #[inline]
    #[must_use]
    pub const fn as_non_null(&self) -> NonNull<u8> {
        self.virt
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A pointer to `count` consecutive `T` starting `offset` bytes into the
    /// page, if they fit and the address is aligned for `T`.
    #[must_use]
    pub fn overlay<T>(&self, offset: usize, count: usize) -> Option<NonNull<T>> {
        let bytes = size_of::<T>().checked_mul(count)?;
        if offset.checked_add(bytes)? > self.len {
            return None;
        }
        // SAFETY: offset <= len, inside the mapped page.
        let ptr = unsafe { self.virt.add(offset) }.cast::<T>();
        ptr.as_ptr().is_aligned().then_some(ptr)
    }
}

// The frame is a description of memory, not an owner of it.
unsafe impl Send for PageFrame {}
unsafe impl Sync for PageFrame {}
