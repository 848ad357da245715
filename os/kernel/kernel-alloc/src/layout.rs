//! # Slab metadata placement
//!
//! Every slab needs a header (free-list head, live counter, list links).
//! **Onpage** slabs keep it at the start of their own page; **offpage** slabs
//! take it from a dedicated metadata pool so objects can use the whole page:
//!
//! ```text
//! onpage:  | header | obj | obj | obj | ... | leftover |
//! offpage: | obj | obj | obj | obj | ... | leftover |     header elsewhere
//! ```

use crate::config::{LARGE_OBJECT_DIVISOR, MIN_OBJECT_SIZE};
use crate::slab::SLAB_HEADER_BYTES;

/// Where a pool's slab headers live.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SlabLayout {
    OnPage,
    OffPage,
}

impl SlabLayout {
    /// Header bytes taken from each page.
    #[inline]
    #[must_use]
    pub const fn metadata_bytes(self) -> usize {
        match self {
            Self::OnPage => SLAB_HEADER_BYTES,
            Self::OffPage => 0,
        }
    }

    /// Objects of `obj_size` bytes fitting one `page_bytes` page.
    #[inline]
    #[must_use]
    pub const fn objects_per_page(self, page_bytes: usize, obj_size: usize) -> usize {
        page_bytes.saturating_sub(self.metadata_bytes()) / slot_size(obj_size)
    }
}

/// Bytes a slot takes for `obj_size`-byte objects; a free slot holds a link.
#[inline]
#[must_use]
pub(crate) const fn slot_size(obj_size: usize) -> usize {
    if obj_size < MIN_OBJECT_SIZE {
        MIN_OBJECT_SIZE
    } else {
        obj_size
    }
}

/// Threshold rule choosing [`SlabLayout`] for a new pool.
///
/// Offpage is chosen when the object exceeds `page / large_object_divisor`,
/// or, with `leftover_rule`, when the bytes left over after packing the page
/// with objects (`page % obj_size`) could not hold a header.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LayoutPolicy {
    pub large_object_divisor: usize,
    pub leftover_rule: bool,
}

impl LayoutPolicy {
    pub const DEFAULT: Self = Self {
        large_object_divisor: LARGE_OBJECT_DIVISOR,
        leftover_rule: true,
    };

    #[must_use]
    pub const fn with_large_object_divisor(mut self, divisor: usize) -> Self {
        self.large_object_divisor = divisor;
        self
    }

    #[must_use]
    pub const fn with_leftover_rule(mut self, enabled: bool) -> Self {
        self.leftover_rule = enabled;
        self
    }

    /// The layout for `obj_size`-byte objects on `page_bytes` pages.
    #[must_use]
    pub const fn choose(&self, page_bytes: usize, obj_size: usize) -> SlabLayout {
        let divisor = if self.large_object_divisor == 0 {
            1
        } else {
            self.large_object_divisor
        };
        let obj_size = slot_size(obj_size);
        let large = obj_size > page_bytes / divisor;
        let cramped = self.leftover_rule && page_bytes % obj_size < SLAB_HEADER_BYTES;
        if large || cramped {
            SlabLayout::OffPage
        } else {
            SlabLayout::OnPage
        }
    }
}

impl Default for LayoutPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}
