//! # Scoped preemption control
//!
//! Per-CPU data such as the object allocator's caches is protected by a
//! non-reentrant [`SpinLock`](crate::SpinLock). Code reachable from an
//! interrupt handler must therefore keep the current CPU from being preempted
//! (and the lock from being re-entered) for the duration of the critical
//! section. How preemption is switched off belongs to the architecture and the
//! scheduler; this module only provides the seam and the RAII discipline.
//!
//! # Examples
//!
//! ```
//! use kernel_sync::preempt::{PreemptCounter, PreemptGuard};
//!
//! let counter = PreemptCounter::new();
//! {
//!     let _outer = PreemptGuard::new(&counter);
//!     let _inner = PreemptGuard::new(&counter);
//!     assert_eq!(counter.depth(), 2);
//! }
//! assert!(!counter.is_disabled());
//! ```

use core::sync::atomic::{AtomicU32, Ordering};

/// Architecture/scheduler hook that disables and re-enables preemption of the
/// current CPU. Calls nest: every `preempt_disable` is paired with exactly one
/// `preempt_enable`.
pub trait Preemption {
    fn preempt_disable(&self);
    fn preempt_enable(&self);
}

/// RAII guard that disables preemption on creation and re-enables it on drop.
///
/// Guards nest; the underlying [`Preemption`] implementation decides when the
/// CPU actually becomes preemptible again.
pub struct PreemptGuard<'a> {
    preemption: &'a dyn Preemption,
}

impl<'a> PreemptGuard<'a> {
    #[inline]
    #[must_use]
    pub fn new(preemption: &'a dyn Preemption) -> Self {
        preemption.preempt_disable();
        Self { preemption }
    }
}

impl Drop for PreemptGuard<'_> {
    fn drop(&mut self) {
        self.preemption.preempt_enable();
    }
}

/// A nesting counter standing in for a CPU's preempt count.
///
/// Used during bring-up before the scheduler exists, and by hosted tests.
/// One counter describes one CPU.
#[derive(Debug, Default)]
pub struct PreemptCounter {
    depth: AtomicU32,
}

impl PreemptCounter {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            depth: AtomicU32::new(0),
        }
    }

    /// Current nesting depth.
    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.depth() != 0
    }
}

impl Preemption for PreemptCounter {
    fn preempt_disable(&self) {
        self.depth.fetch_add(1, Ordering::Acquire);
    }

    fn preempt_enable(&self) {
        let prev = self.depth.fetch_sub(1, Ordering::Release);
        debug_assert!(prev != 0, "unbalanced preempt_enable");
    }
}
