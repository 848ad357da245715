//! # Per-CPU caches
//!
//! Each [`ObjectPool`](crate::ObjectPool) has one [`PerCpuCache`] per CPU.
//! A cache owns the slabs its CPU created, split into `partial` and `full`,
//! plus a `pending` list of objects freed on this CPU but not yet returned to
//! their slab. Freeing only pushes onto `pending`; matching an object to its
//! slab (a scan over the slab lists) is deferred to reconciliation.
//!
//! All three lists sit behind one [`SpinLock`]. Callers never hold two cache
//! locks at once and never call into the page provider while holding one.

use crate::slab::{Slab, SlabLists, SlabState, read_link, write_link};
use core::ptr::{self, NonNull};
use kernel_sync::{CpuId, SpinLock};

/// Freed objects awaiting reconciliation, linked through their first word.
#[derive(Debug, Default)]
struct PendingList {
    head: Option<NonNull<u8>>,
    len: usize,
}

impl PendingList {
    const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// # Safety
    /// `obj` must be a freed slot the caller owns.
    unsafe fn push(&mut self, obj: NonNull<u8>) -> usize {
        let next = self.head.map_or(ptr::null_mut(), NonNull::as_ptr);
        unsafe { write_link(obj, next) };
        self.head = Some(obj);
        self.len += 1;
        self.len
    }

    fn pop(&mut self) -> Option<NonNull<u8>> {
        let obj = self.head?;
        // SAFETY: every pending object holds a link written by `push`.
        self.head = NonNull::new(unsafe { read_link(obj) });
        self.len -= 1;
        Some(obj)
    }
}

#[derive(Debug)]
struct CacheLists {
    slabs: SlabLists,
    pending: PendingList,
}

// Slab headers and pending objects are only touched under the cache lock.
unsafe impl Send for CacheLists {}

/// Result of one reconciliation step on a cache.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum CacheStep {
    /// Nothing pending.
    Idle,
    /// The object went back to its slab. A slab that became completely free
    /// and was unlinked is handed back for deletion.
    Returned(Option<NonNull<Slab>>),
    /// The object belongs to no slab of this cache.
    Foreign(NonNull<u8>),
}

/// Counters of one cache.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct CacheStats {
    pub partial_slabs: usize,
    pub full_slabs: usize,
    pub pending: usize,
    /// Slots handed out from this cache's slabs, pending ones included.
    pub live_slots: usize,
}

/// One CPU's slabs and pending frees for one pool.
pub struct PerCpuCache {
    cpu: CpuId,
    lists: SpinLock<CacheLists>,
}

impl PerCpuCache {
    pub(crate) const fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            lists: SpinLock::new(CacheLists {
                slabs: SlabLists::new(),
                pending: PendingList::new(),
            }),
        }
    }

    #[inline]
    #[must_use]
    pub const fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Hands out a pending object, else a slot of the first partial slab.
    pub(crate) fn acquire(&self, me: CpuId) -> Option<NonNull<u8>> {
        let mut lists = self.lists.lock_as(me);
        if let Some(obj) = lists.pending.pop() {
            return Some(obj);
        }
        let mut slab = lists.slabs.partial.front()?;
        // SAFETY: linked headers are live and owned by this cache.
        unsafe {
            let obj = slab.as_mut().take()?;
            if slab.as_ref().is_full() {
                lists.slabs.relink(slab, SlabState::Full);
            }
            Some(obj)
        }
    }

    /// Adds a freshly formatted slab.
    ///
    /// # Safety
    /// `slab` must be a live header on no list.
    pub(crate) unsafe fn insert(&self, me: CpuId, slab: NonNull<Slab>) {
        let mut lists = self.lists.lock_as(me);
        unsafe { lists.slabs.relink(slab, SlabState::Partial) };
    }

    /// Parks a freed object; returns the pending count.
    ///
    /// # Safety
    /// `obj` must be an object of the owning pool that the caller gives up.
    pub(crate) unsafe fn release(&self, me: CpuId, obj: NonNull<u8>) -> usize {
        let mut lists = self.lists.lock_as(me);
        unsafe { lists.pending.push(obj) }
    }

    /// Matches one pending object against this cache's slabs.
    pub(crate) fn reconcile_one(&self, me: CpuId) -> CacheStep {
        let mut lists = self.lists.lock_as(me);
        let Some(obj) = lists.pending.pop() else {
            return CacheStep::Idle;
        };
        match lists.slabs.owner_of(obj) {
            // SAFETY: the slab is on this cache's lists and `obj` is its slot.
            Some(slab) => CacheStep::Returned(unsafe { Self::give_back(&mut lists, slab, obj) }),
            None => CacheStep::Foreign(obj),
        }
    }

    /// Returns `obj` to its slab if one of this cache's slabs owns it.
    /// `None` means not ours; `Some(emptied)` as for [`CacheStep::Returned`].
    pub(crate) fn claim(&self, me: CpuId, obj: NonNull<u8>) -> Option<Option<NonNull<Slab>>> {
        let mut lists = self.lists.lock_as(me);
        let slab = lists.slabs.owner_of(obj)?;
        // SAFETY: as in `reconcile_one`.
        Some(unsafe { Self::give_back(&mut lists, slab, obj) })
    }

    /// # Safety
    /// `slab` must be on `lists` and own `obj`.
    unsafe fn give_back(
        lists: &mut CacheLists,
        mut slab: NonNull<Slab>,
        obj: NonNull<u8>,
    ) -> Option<NonNull<Slab>> {
        unsafe {
            slab.as_mut().put(obj);
            if slab.as_ref().state() == SlabState::Full {
                lists.slabs.relink(slab, SlabState::Partial);
            }
            // The last partial slab stays as a warm spare.
            if slab.as_ref().is_empty() && lists.slabs.partial.len() > 1 {
                lists.slabs.relink(slab, SlabState::Free);
                return Some(slab);
            }
        }
        None
    }

    /// Unlinks one slab for teardown, empty ones first.
    pub(crate) fn drain(&self, me: CpuId) -> Option<NonNull<Slab>> {
        let mut lists = self.lists.lock_as(me);
        let slab = lists
            .slabs
            .partial
            .front()
            .or_else(|| lists.slabs.full.front())?;
        // SAFETY: the slab is on one of this cache's lists.
        unsafe { lists.slabs.relink(slab, SlabState::Free) };
        Some(slab)
    }

    #[must_use]
    pub fn stats(&self, me: CpuId) -> CacheStats {
        let lists = self.lists.lock_as(me);
        let live_slots = lists
            .slabs
            .partial
            .iter()
            .chain(lists.slabs.full.iter())
            // SAFETY: linked headers are live.
            .map(|slab| unsafe { slab.as_ref() }.live())
            .sum();
        CacheStats {
            partial_slabs: lists.slabs.partial.len(),
            full_slabs: lists.slabs.full.len(),
            pending: lists.pending.len,
            live_slots,
        }
    }
}
