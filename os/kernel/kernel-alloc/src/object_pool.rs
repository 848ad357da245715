//! # Object pools
//!
//! An [`ObjectPool`] hands out objects of one fixed size. It owns one
//! [`PerCpuCache`] per CPU, takes backing pages of one size class from the
//! [`PageProvider`](kernel_pmm::PageProvider), and formats each page as a
//! [`Slab`].
//!
//! ## Freeing across CPUs
//!
//! `release` parks the object on the releasing CPU's cache. Reconciliation
//! later looks for the owning slab on that cache and, failing that, probes
//! the other CPUs' caches round-robin, one lock at a time. An object no cache
//! claims is an *orphan*: it is logged, counted, and dropped.

use crate::AllocError;
use crate::cache::{CacheStats, CacheStep, PerCpuCache};
use crate::env::AllocEnv;
use crate::layout::{SlabLayout, slot_size};
use crate::slab::Slab;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use kernel_pmm::SizeClass;
use kernel_sync::CpuId;
use log::{debug, error, warn};

/// Outcome of [`ObjectPool::reconcile_one`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReconcileStep {
    /// Nothing was pending.
    Idle,
    /// One pending object was returned to its slab.
    Reconciled,
    /// One pending object belonged to no cache and was dropped.
    Orphaned,
}

/// Counter snapshot of a pool.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PoolStats {
    pub obj_size: usize,
    pub class: SizeClass,
    pub layout: SlabLayout,
    /// Objects per slab.
    pub page_objs: usize,
    /// Slabs (pages) currently held.
    pub pages: usize,
    /// Objects handed out and not released.
    pub allocations: usize,
    /// Released objects not yet reconciled, over all CPUs.
    pub pending: usize,
    /// Objects dropped because no cache claimed them.
    pub orphans: usize,
    /// References held through the registry's shared ladder.
    pub shared_refs: usize,
}

/// Fixed-size object allocator with per-CPU caches.
pub struct ObjectPool<'k> {
    env: AllocEnv<'k>,
    obj_size: usize,
    class: SizeClass,
    page_bytes: usize,
    layout: SlabLayout,
    page_objs: usize,
    caches: NonNull<PerCpuCache>,
    cpus: usize,
    /// Supplies offpage slab headers.
    meta: Option<NonNull<ObjectPool<'k>>>,
    pub(crate) shared_refs: AtomicUsize,
    allocations: AtomicUsize,
    pages: AtomicUsize,
    orphans: AtomicUsize,
    /// Link in the registry chain the pool is on.
    pub(crate) chain_next: AtomicPtr<ObjectPool<'k>>,
}

// Caches are locked; counters are atomic; the metadata pool outlives this one.
unsafe impl Send for ObjectPool<'_> {}
unsafe impl Sync for ObjectPool<'_> {}

impl<'k> ObjectPool<'k> {
    /// Describes a pool and formats its caches.
    ///
    /// `obj_size` is rounded up to one pointer. `caches` must hold one
    /// [`PerCpuCache`] per CPU of `env`; `meta` is required for offpage layout.
    ///
    /// # Errors
    /// [`AllocError::InvalidArgument`] if the class does not exist or cannot
    /// hold a single object, or offpage layout lacks a metadata pool.
    ///
    /// # Safety
    /// `caches` must be valid for writing `env.cpus.cpu_count()` caches and
    /// stay valid, like `meta`, for the lifetime of the pool.
    pub(crate) unsafe fn new(
        env: AllocEnv<'k>,
        obj_size: usize,
        class: SizeClass,
        layout: SlabLayout,
        caches: NonNull<PerCpuCache>,
        meta: Option<NonNull<ObjectPool<'k>>>,
    ) -> Result<Self, AllocError> {
        let obj_size = slot_size(obj_size);
        if u32::try_from(obj_size).is_err() {
            return Err(AllocError::InvalidArgument("object size too large"));
        }
        let page_bytes = env.page_bytes(class)?;
        let page_objs = layout.objects_per_page(page_bytes, obj_size);
        if page_objs == 0 {
            return Err(AllocError::InvalidArgument("object does not fit the size class"));
        }
        if layout == SlabLayout::OffPage && meta.is_none() {
            return Err(AllocError::InvalidArgument("offpage layout needs a metadata pool"));
        }
        let cpus = env.cpus.cpu_count();
        if cpus == 0 {
            return Err(AllocError::InvalidArgument("no CPUs"));
        }
        for i in 0..cpus {
            #[allow(clippy::cast_possible_truncation)]
            let cpu = CpuId::new(i as u32);
            // SAFETY: the caller provides room for `cpus` caches.
            unsafe { caches.add(i).write(PerCpuCache::new(cpu)) };
        }
        Ok(Self {
            env,
            obj_size,
            class,
            page_bytes,
            layout,
            page_objs,
            caches,
            cpus,
            meta,
            shared_refs: AtomicUsize::new(0),
            allocations: AtomicUsize::new(0),
            pages: AtomicUsize::new(0),
            orphans: AtomicUsize::new(0),
            chain_next: AtomicPtr::new(ptr::null_mut()),
        })
    }

    #[inline]
    #[must_use]
    pub const fn obj_size(&self) -> usize {
        self.obj_size
    }

    #[inline]
    #[must_use]
    pub const fn class(&self) -> SizeClass {
        self.class
    }

    #[inline]
    #[must_use]
    pub const fn layout(&self) -> SlabLayout {
        self.layout
    }

    /// Objects per slab.
    #[inline]
    #[must_use]
    pub const fn page_objs(&self) -> usize {
        self.page_objs
    }

    /// Objects handed out and not yet released.
    #[inline]
    #[must_use]
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) const fn caches_ptr(&self) -> NonNull<PerCpuCache> {
        self.caches
    }

    fn cache(&self, cpu: CpuId) -> Result<&PerCpuCache, AllocError> {
        if cpu.index() >= self.cpus {
            return Err(AllocError::InvalidArgument("CPU outside the topology"));
        }
        // SAFETY: `cpus` caches were written in `new` and live as long as the pool.
        Ok(unsafe { self.caches.add(cpu.index()).as_ref() })
    }

    fn meta(&self) -> Result<&ObjectPool<'k>, AllocError> {
        // SAFETY: the metadata pool outlives every pool referring to it.
        self.meta
            .map(|m| unsafe { m.as_ref() })
            .ok_or(AllocError::InternalInconsistency("offpage pool without metadata pool"))
    }

    /// One object for the current CPU.
    ///
    /// # Errors
    /// See [`acquire_on`](Self::acquire_on).
    pub fn acquire(&self) -> Result<NonNull<u8>, AllocError> {
        self.acquire_on(self.env.current_cpu())
    }

    /// One object from `cpu`'s cache, growing the cache by one slab if empty.
    /// The caller runs as `cpu`; locks are taken on its behalf.
    ///
    /// # Errors
    /// [`AllocError::OutOfMemory`] if no page could be obtained;
    /// [`AllocError::InvalidArgument`] for an unknown CPU.
    pub fn acquire_on(&self, cpu: CpuId) -> Result<NonNull<u8>, AllocError> {
        let cache = self.cache(cpu)?;
        let obj = match cache.acquire(cpu) {
            Some(obj) => obj,
            None => {
                let slab = self.new_page(cpu)?;
                // SAFETY: `new_page` returns a formatted slab on no list.
                unsafe { cache.insert(cpu, slab) };
                cache.acquire(cpu).ok_or(AllocError::OutOfMemory)?
            }
        };
        self.allocations.fetch_add(1, Ordering::AcqRel);
        Ok(obj)
    }

    /// Gives `obj` back on the current CPU.
    ///
    /// # Errors
    /// See [`release_on`](Self::release_on).
    ///
    /// # Safety
    /// See [`release_on`](Self::release_on).
    pub unsafe fn release(&self, obj: NonNull<u8>) -> Result<(), AllocError> {
        unsafe { self.release_on(self.env.current_cpu(), obj) }
    }

    /// Parks `obj` on `cpu`'s cache, reconciling one object once the cache
    /// holds more than the pending watermark.
    ///
    /// # Errors
    /// [`AllocError::InternalInconsistency`] if the pool has no outstanding
    /// allocation (the object is then not queued).
    ///
    /// # Safety
    /// `obj` must have been returned by `acquire`/`acquire_on` of this pool
    /// and not released since; the caller must not use it afterwards.
    pub unsafe fn release_on(&self, cpu: CpuId, obj: NonNull<u8>) -> Result<(), AllocError> {
        let cache = self.cache(cpu)?;
        self.allocations
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| AllocError::InternalInconsistency("release without matching acquire"))?;
        // SAFETY: forwarded from the caller.
        let pending = unsafe { cache.release(cpu, obj) };
        if pending > self.env.config.pending_watermark {
            self.reconcile_one(cpu)?;
        }
        Ok(())
    }

    /// Reserves a page and formats it as a slab owned by `cpu`.
    ///
    /// # Errors
    /// [`AllocError::OutOfMemory`] if no page or (offpage) no header is left.
    pub(crate) fn new_page(&self, cpu: CpuId) -> Result<NonNull<Slab>, AllocError> {
        let frame = self.env.allocate_frame(self.class, cpu)?;
        let header = match self.layout {
            SlabLayout::OnPage => frame
                .overlay::<Slab>(0, 1)
                .ok_or(AllocError::InternalInconsistency("page cannot hold a slab header")),
            SlabLayout::OffPage => self
                .meta()
                .and_then(|meta| meta.acquire_on(cpu))
                .map(NonNull::cast::<Slab>),
        };
        let header = match header {
            Ok(h) => h,
            Err(e) => {
                self.env.free_page(self.class, frame.phys(), cpu)?;
                return Err(e);
            }
        };
        // SAFETY: the frame was just reserved; the header is either its first
        // bytes (onpage) or an exclusive metadata object.
        let slab = unsafe {
            Slab::format(header, &frame, self.obj_size, self.page_objs, self.layout, cpu)
        };
        self.pages.fetch_add(1, Ordering::AcqRel);
        debug!(
            "new {}-byte slab at {} for {cpu} ({} objects)",
            self.obj_size,
            frame.phys(),
            self.page_objs
        );
        Ok(slab)
    }

    /// Returns the page of an emptied, unlinked slab.
    ///
    /// # Errors
    /// Errors of the page provider or the metadata pool.
    ///
    /// # Safety
    /// `slab` must belong to this pool, be on no cache list and have no live
    /// objects.
    pub(crate) unsafe fn delete_page(&self, slab: NonNull<Slab>, cpu: CpuId) -> Result<(), AllocError> {
        let (page, layout) = {
            // SAFETY: the header is live until released below.
            let s = unsafe { slab.as_ref() };
            debug_assert!(s.is_empty());
            (s.page(), s.layout())
        };
        self.env.free_page(self.class, page, cpu)?;
        if layout == SlabLayout::OffPage {
            // SAFETY: the header came from `meta.acquire_on` in `new_page`.
            unsafe { self.meta()?.release_on(cpu, slab.cast())? };
        }
        self.pages.fetch_sub(1, Ordering::AcqRel);
        debug!("deleted {}-byte slab at {page}", self.obj_size);
        Ok(())
    }

    /// Reconciles one pending object of `cpu`'s cache.
    ///
    /// # Errors
    /// Errors from deleting an emptied slab.
    pub fn reconcile_one(&self, cpu: CpuId) -> Result<ReconcileStep, AllocError> {
        self.reconcile_cache(cpu, cpu)
    }

    /// Reconciles one pending object of `home`'s cache, locking as `me`.
    fn reconcile_cache(&self, home: CpuId, me: CpuId) -> Result<ReconcileStep, AllocError> {
        let obj = match self.cache(home)?.reconcile_one(me) {
            CacheStep::Idle => return Ok(ReconcileStep::Idle),
            CacheStep::Returned(emptied) => {
                self.retire(emptied, me)?;
                return Ok(ReconcileStep::Reconciled);
            }
            CacheStep::Foreign(obj) => obj,
        };

        for step in 1..self.cpus {
            let other = (home.index() + step) % self.cpus;
            // SAFETY: `other < cpus`.
            let cache = unsafe { self.caches.add(other).as_ref() };
            if let Some(emptied) = cache.claim(me, obj) {
                self.retire(emptied, me)?;
                return Ok(ReconcileStep::Reconciled);
            }
        }

        self.orphans.fetch_add(1, Ordering::AcqRel);
        warn!(
            "{}-byte object {obj:p} released on {home} is owned by no cache",
            self.obj_size
        );
        Ok(ReconcileStep::Orphaned)
    }

    fn retire(&self, emptied: Option<NonNull<Slab>>, me: CpuId) -> Result<(), AllocError> {
        match emptied {
            // SAFETY: the cache unlinked the slab because it became empty.
            Some(slab) => unsafe { self.delete_page(slab, me) },
            None => Ok(()),
        }
    }

    /// Drains every CPU's pending list.
    ///
    /// # Errors
    /// [`AllocError::InternalInconsistency`] if any drained object was an
    /// orphan. A second call without new releases finds nothing and succeeds.
    pub fn reconcile_all(&self) -> Result<(), AllocError> {
        let me = self.env.current_cpu();
        let mut orphans = 0usize;
        for i in 0..self.cpus {
            #[allow(clippy::cast_possible_truncation)]
            let home = CpuId::new(i as u32);
            loop {
                match self.reconcile_cache(home, me)? {
                    ReconcileStep::Idle => break,
                    ReconcileStep::Reconciled => {}
                    ReconcileStep::Orphaned => orphans += 1,
                }
            }
        }
        if orphans > 0 {
            return Err(AllocError::InternalInconsistency("released objects owned by no cache"));
        }
        Ok(())
    }

    /// Returns every slab's page. Refused while objects are outstanding.
    pub(crate) fn teardown(&self) -> Result<(), AllocError> {
        let live = self.allocations();
        if live > 0 {
            error!(
                "refusing to tear down {}-byte pool with {live} live objects",
                self.obj_size
            );
            return Err(AllocError::InternalInconsistency("pool has live allocations"));
        }
        self.reconcile_all()?;
        let me = self.env.current_cpu();
        for i in 0..self.cpus {
            // SAFETY: `i < cpus`.
            let cache = unsafe { self.caches.add(i).as_ref() };
            while let Some(slab) = cache.drain(me) {
                // SAFETY: drained slabs are unlinked; no objects are live.
                unsafe { self.delete_page(slab, me)? };
            }
        }
        Ok(())
    }

    /// Counter snapshot; locks each cache briefly.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let me = self.env.current_cpu();
        PoolStats {
            obj_size: self.obj_size,
            class: self.class,
            layout: self.layout,
            page_objs: self.page_objs,
            pages: self.pages.load(Ordering::Acquire),
            allocations: self.allocations(),
            pending: self.cache_stats(me).map(|s| s.pending).sum(),
            orphans: self.orphans.load(Ordering::Acquire),
            shared_refs: self.shared_refs.load(Ordering::Acquire),
        }
    }

    /// Per-CPU cache counters, CPU 0 first.
    pub fn cache_stats(&self, me: CpuId) -> impl Iterator<Item = CacheStats> + '_ {
        // SAFETY: `i < cpus`.
        (0..self.cpus).map(move |i| unsafe { self.caches.add(i).as_ref() }.stats(me))
    }

    /// Bytes of one slab page.
    #[inline]
    #[must_use]
    pub const fn page_bytes(&self) -> usize {
        self.page_bytes
    }
}

impl core::fmt::Debug for ObjectPool<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("obj_size", &self.obj_size)
            .field("class", &self.class)
            .field("layout", &self.layout)
            .field("page_objs", &self.page_objs)
            .field("allocations", &self.allocations())
            .finish_non_exhaustive()
    }
}

