//! # Kernel synchronization primitives
//!
//! * [`SpinLock`]: the non-reentrant lock guarding each per-CPU allocator
//!   cache and each physical page pool.
//! * [`preempt`]: the scoped preemption-disable seam callers hold around
//!   per-CPU critical sections.
//! * [`SyncOnceCell`]: write-once storage for `static` allocator handles.
//! * [`CpuId`]: the logical CPU index everything per-CPU is keyed by.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod preempt;
mod spin_lock;
mod sync_once_cell;

use core::fmt;

pub use preempt::{PreemptCounter, PreemptGuard, Preemption};
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;

/// Logical CPU index (`0..n`), as handed out by the architecture layer.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CpuId(u32);

impl CpuId {
    /// The bootstrap processor.
    pub const BOOT: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// The id as an array index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}
