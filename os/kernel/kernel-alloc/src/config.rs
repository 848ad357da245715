//! # Allocator configuration
//!
//! Compile-time defaults, and the [`AllocConfig`] value an [`AllocEnv`](crate::AllocEnv)
//! carries so tests and bring-up code can tune them without rebuilding.

use crate::layout::LayoutPolicy;

/// Freed objects a CPU may hold back before one is reconciled with its slab.
pub const PENDING_WATERMARK: usize = 64;

/// An object larger than `page / LARGE_OBJECT_DIVISOR` gets offpage slab metadata.
pub const LARGE_OBJECT_DIVISOR: usize = 8;

/// Shared pools pick the smallest page holding at least this many objects.
pub const MIN_SLAB_OBJECTS: usize = 4;

/// Smallest object size; a free slot must hold one link pointer.
pub const MIN_OBJECT_SIZE: usize = size_of::<*mut u8>();

const _: () = {
    assert!(PENDING_WATERMARK > 0);
    assert!(LARGE_OBJECT_DIVISOR.is_power_of_two());
    assert!(MIN_SLAB_OBJECTS >= 1);
    assert!(MIN_OBJECT_SIZE.is_power_of_two());
};

/// Runtime tunables of the object allocator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AllocConfig {
    /// See [`PENDING_WATERMARK`].
    pub pending_watermark: usize,
    /// See [`MIN_SLAB_OBJECTS`].
    pub min_slab_objects: usize,
    /// Onpage/offpage metadata placement.
    pub layout: LayoutPolicy,
}

impl AllocConfig {
    pub const DEFAULT: Self = Self {
        pending_watermark: PENDING_WATERMARK,
        min_slab_objects: MIN_SLAB_OBJECTS,
        layout: LayoutPolicy::DEFAULT,
    };

    #[must_use]
    pub const fn with_pending_watermark(mut self, watermark: usize) -> Self {
        self.pending_watermark = watermark;
        self
    }

    #[must_use]
    pub const fn with_min_slab_objects(mut self, objects: usize) -> Self {
        self.min_slab_objects = objects;
        self
    }

    #[must_use]
    pub const fn with_layout(mut self, layout: LayoutPolicy) -> Self {
        self.layout = layout;
        self
    }
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
