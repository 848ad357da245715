//! # Pool registry
//!
//! Object pools and their per-CPU cache arrays are themselves fixed-size
//! objects, so the registry allocates them from object pools too. The first
//! three pools cannot come from anywhere, so [`PoolRegistry::bootstrap`]
//! places them by hand on one seed page:
//!
//! ```text
//! seed page: | ObjectPool | [PerCpuCache; N] | ObjectPool | [PerCpuCache; N] | ObjectPool | [PerCpuCache; N] |
//!               offpage slab headers            ObjectPool structs              cache arrays
//! ```
//!
//! Every further pool is built from those seed pools. Pools live on one of two
//! chains: the size-ordered *shared* ladder, reference counted through
//! [`acquire_shared`](PoolRegistry::acquire_shared), and the *exclusive*
//! chain of pools owned by a single user.
//!
//! Lock order: chain locks, then seed-pool cache locks, then the page provider.

use crate::AllocError;
use crate::cache::PerCpuCache;
use crate::env::AllocEnv;
use crate::frame::PageFrame;
use crate::layout::{SlabLayout, slot_size};
use crate::object_pool::ObjectPool;
use crate::slab::SLAB_HEADER_BYTES;
use core::fmt;
use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};
use kernel_memory_addresses::align_up;
use kernel_pmm::SizeClass;
use kernel_sync::{CpuId, SpinLock};
use log::{debug, error, info};

/// Number of shared pool sizes.
pub const LADDER_STEPS: usize = 32;

/// Object size of the first shared pool.
pub const LADDER_BASE: usize = 16;

/// Object sizes of the shared pools, each about 1.5 times the previous one.
pub const LADDER: [usize; LADDER_STEPS] = {
    let mut steps = [0; LADDER_STEPS];
    steps[0] = LADDER_BASE;
    let mut i = 1;
    while i < LADDER_STEPS {
        #[allow(clippy::cast_possible_truncation)]
        let next = align_up((steps[i - 1] * 3 / 2) as u64, 8) as usize;
        steps[i] = next;
        i += 1;
    }
    steps
};

const _: () = {
    assert!(LADDER[1] == 24);
    assert!(LADDER[2] == 40);
    assert!(LADDER_BASE % 8 == 0);
};

/// Index of the smallest ladder step holding `bytes`.
#[must_use]
pub fn ladder_step(bytes: usize) -> Option<usize> {
    LADDER.iter().position(|&size| size >= bytes)
}

/// A value handed back together with the reason it was not consumed.
pub struct Refused<T> {
    pub value: T,
    pub error: AllocError,
}

impl<T> fmt::Debug for Refused<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Refused")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for Refused<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "refused: {}", self.error)
    }
}

impl<T> core::error::Error for Refused<T> {}

/// Pools linked through [`ObjectPool::chain_next`], kept sorted by object size.
struct PoolChain<'k> {
    head: Option<NonNull<ObjectPool<'k>>>,
    len: usize,
}

// Only reached through the chain's lock.
unsafe impl Send for PoolChain<'_> {}

impl<'k> PoolChain<'k> {
    const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    fn iter(&self) -> impl Iterator<Item = NonNull<ObjectPool<'k>>> + '_ {
        // SAFETY: linked pools stay live until unlinked.
        core::iter::successors(self.head, |pool| {
            NonNull::new(unsafe { pool.as_ref() }.chain_next.load(Ordering::Acquire))
        })
    }

    fn contains(&self, pool: NonNull<ObjectPool<'k>>) -> bool {
        self.iter().any(|p| p == pool)
    }

    /// # Safety
    /// `pool` must be live and on no chain.
    unsafe fn insert(&mut self, pool: NonNull<ObjectPool<'k>>) {
        let size = unsafe { pool.as_ref() }.obj_size();
        let after = self
            .iter()
            .take_while(|p| unsafe { p.as_ref() }.obj_size() < size)
            .last();
        let next = match after {
            Some(prev) => unsafe { prev.as_ref() }.chain_next.load(Ordering::Acquire),
            None => self.head.map_or(ptr::null_mut(), NonNull::as_ptr),
        };
        unsafe { pool.as_ref() }.chain_next.store(next, Ordering::Release);
        match after {
            Some(prev) => unsafe { prev.as_ref() }
                .chain_next
                .store(pool.as_ptr(), Ordering::Release),
            None => self.head = Some(pool),
        }
        self.len += 1;
    }

    /// Unlinks `pool`; `false` if it is not on this chain.
    fn remove(&mut self, pool: NonNull<ObjectPool<'k>>) -> bool {
        let mut prev: Option<NonNull<ObjectPool<'k>>> = None;
        let mut cur = self.head;
        while let Some(p) = cur {
            // SAFETY: linked pools are live.
            let link = unsafe { &p.as_ref().chain_next };
            if p == pool {
                let next = link.swap(ptr::null_mut(), Ordering::AcqRel);
                match prev {
                    Some(prev) => unsafe { prev.as_ref() }.chain_next.store(next, Ordering::Release),
                    None => self.head = NonNull::new(next),
                }
                self.len -= 1;
                return true;
            }
            prev = Some(p);
            cur = NonNull::new(link.load(Ordering::Acquire));
        }
        false
    }
}

/// Bump allocator over the seed page.
struct SeedArena {
    frame: PageFrame,
    used: usize,
}

impl SeedArena {
    /// Bytes needed for the three seed pools and their cache arrays.
    const fn bytes(cpus: usize) -> usize {
        let pool = size_of::<ObjectPool<'_>>() + align_of::<ObjectPool<'_>>();
        let caches = cpus * size_of::<PerCpuCache>() + align_of::<PerCpuCache>();
        3 * (pool + caches)
    }

    fn place<T>(&mut self, count: usize) -> Result<NonNull<T>, AllocError> {
        #[allow(clippy::cast_possible_truncation)]
        let offset = align_up(self.used as u64, align_of::<T>() as u64) as usize;
        let ptr = self
            .frame
            .overlay::<T>(offset, count)
            .ok_or(AllocError::InternalInconsistency("seed arena exhausted"))?;
        self.used = offset + size_of::<T>() * count;
        Ok(ptr)
    }
}

/// Owner of every object pool.
pub struct PoolRegistry<'k> {
    pub(crate) env: AllocEnv<'k>,
    seed: PageFrame,
    seed_class: SizeClass,
    meta_pool: NonNull<ObjectPool<'k>>,
    pool_pool: NonNull<ObjectPool<'k>>,
    cache_pool: NonNull<ObjectPool<'k>>,
    shared: SpinLock<PoolChain<'k>>,
    exclusive: SpinLock<PoolChain<'k>>,
    /// Shared pools pinned by the heap facade, one per ladder step.
    pub(crate) heap: [AtomicPtr<ObjectPool<'k>>; LADDER_STEPS],
}

// The seed pools live on the seed page; everything else is behind locks or atomic.
unsafe impl Send for PoolRegistry<'_> {}
unsafe impl Sync for PoolRegistry<'_> {}

/// Handle to a pool owned by a [`PoolRegistry`].
///
/// Handles are consumed by [`PoolRegistry::release_shared`] and
/// [`PoolRegistry::destroy_exclusive`], so a destroyed pool cannot be reached
/// through one.
pub struct ObjectPoolHandle<'r, 'k> {
    pool: NonNull<ObjectPool<'k>>,
    _registry: PhantomData<&'r PoolRegistry<'k>>,
}

unsafe impl Send for ObjectPoolHandle<'_, '_> {}
unsafe impl Sync for ObjectPoolHandle<'_, '_> {}

impl<'k> ObjectPoolHandle<'_, 'k> {
    const fn new(pool: NonNull<ObjectPool<'k>>) -> Self {
        Self {
            pool,
            _registry: PhantomData,
        }
    }

    /// Gives up the handle without releasing its reference.
    pub(crate) const fn into_raw(self) -> NonNull<ObjectPool<'k>> {
        self.pool
    }
}

impl<'k> Deref for ObjectPoolHandle<'_, 'k> {
    type Target = ObjectPool<'k>;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the registry keeps the pool alive while a handle exists.
        unsafe { self.pool.as_ref() }
    }
}

impl fmt::Debug for ObjectPoolHandle<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjectPoolHandle").field(&**self).finish()
    }
}

impl<'k> PoolRegistry<'k> {
    /// Places the seed pools on one page from the page provider.
    ///
    /// # Errors
    /// [`AllocError::InvalidArgument`] without CPUs or if no size class can
    /// hold the seed arena; [`AllocError::OutOfMemory`] if the page provider
    /// is exhausted.
    pub fn bootstrap(env: AllocEnv<'k>) -> Result<Self, AllocError> {
        let cpus = env.cpus.cpu_count();
        if cpus == 0 {
            return Err(AllocError::InvalidArgument("no CPUs"));
        }
        let me = env.current_cpu();
        let classes = env.pages.size_classes();
        let bytes = SeedArena::bytes(cpus);
        let seed_class = classes
            .classify(bytes as u64)
            .ok_or(AllocError::InvalidArgument("seed arena exceeds the largest page"))?;
        let seed = env.allocate_frame(seed_class, me)?;

        match Self::place_seed_pools(env, seed, cpus) {
            Ok((meta_pool, pool_pool, cache_pool)) => {
                info!(
                    "pool registry ready: seed page {} ({seed_class}), {cpus} CPUs",
                    seed.phys()
                );
                Ok(Self {
                    env,
                    seed,
                    seed_class,
                    meta_pool,
                    pool_pool,
                    cache_pool,
                    shared: SpinLock::new(PoolChain::new()),
                    exclusive: SpinLock::new(PoolChain::new()),
                    heap: [const { AtomicPtr::new(ptr::null_mut()) }; LADDER_STEPS],
                })
            }
            Err(e) => {
                env.free_page(seed_class, seed.phys(), me)?;
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn place_seed_pools(
        env: AllocEnv<'k>,
        seed: PageFrame,
        cpus: usize,
    ) -> Result<
        (
            NonNull<ObjectPool<'k>>,
            NonNull<ObjectPool<'k>>,
            NonNull<ObjectPool<'k>>,
        ),
        AllocError,
    > {
        let mut arena = SeedArena {
            frame: seed,
            used: 0,
        };
        let mut seed_pool = |obj_size: usize| -> Result<NonNull<ObjectPool<'k>>, AllocError> {
            let slot = arena.place::<ObjectPool<'k>>(1)?;
            let caches = arena.place::<PerCpuCache>(cpus)?;
            let class = Self::onpage_class(env, obj_size)?;
            // SAFETY: both spans were just carved from the seed page.
            unsafe {
                let pool = ObjectPool::new(env, obj_size, class, SlabLayout::OnPage, caches, None)?;
                slot.write(pool);
            }
            debug!("seed pool for {obj_size}-byte objects on {class}");
            Ok(slot)
        };
        let meta_pool = seed_pool(SLAB_HEADER_BYTES)?;
        let pool_pool = seed_pool(size_of::<ObjectPool<'k>>())?;
        let cache_pool = seed_pool(cpus * size_of::<PerCpuCache>())?;
        Ok((meta_pool, pool_pool, cache_pool))
    }

    /// Smallest class whose page holds one `obj_size` object after an onpage header.
    fn onpage_class(env: AllocEnv<'k>, obj_size: usize) -> Result<SizeClass, AllocError> {
        env.pages
            .size_classes()
            .iter()
            .find(|&class| {
                env.page_bytes(class)
                    .is_ok_and(|page| SlabLayout::OnPage.objects_per_page(page, obj_size) >= 1)
            })
            .ok_or(AllocError::InvalidArgument("object larger than the largest page"))
    }

    /// Smallest class holding `min_slab_objects` objects, else one object.
    fn shared_class(&self, obj_size: usize) -> Result<SizeClass, AllocError> {
        let policy = self.env.config.layout;
        let holds = |min: usize| {
            self.env.pages.size_classes().iter().find(|&class| {
                self.env.page_bytes(class).is_ok_and(|page| {
                    policy.choose(page, obj_size).objects_per_page(page, obj_size) >= min
                })
            })
        };
        holds(self.env.config.min_slab_objects.max(1))
            .or_else(|| holds(1))
            .ok_or(AllocError::InvalidArgument("object larger than the largest page"))
    }

    #[inline]
    #[must_use]
    pub const fn env(&self) -> &AllocEnv<'k> {
        &self.env
    }

    fn seed_pools(&self) -> [&ObjectPool<'k>; 3] {
        // SAFETY: the seed pools live on the seed page until `shutdown`.
        unsafe {
            [
                self.pool_pool.as_ref(),
                self.cache_pool.as_ref(),
                self.meta_pool.as_ref(),
            ]
        }
    }

    /// Builds a pool from the seed pools.
    fn build_pool(
        &self,
        obj_size: usize,
        class: SizeClass,
        layout: SlabLayout,
        me: CpuId,
    ) -> Result<NonNull<ObjectPool<'k>>, AllocError> {
        let [pools, caches, _] = self.seed_pools();
        let slot = pools.acquire_on(me)?.cast::<ObjectPool<'k>>();
        let array = match caches.acquire_on(me) {
            Ok(array) => array.cast::<PerCpuCache>(),
            Err(e) => {
                // SAFETY: just acquired and untouched.
                unsafe { pools.release_on(me, slot.cast())? };
                return Err(e);
            }
        };
        let meta = (layout == SlabLayout::OffPage).then_some(self.meta_pool);
        // SAFETY: `array` holds one cache per CPU, `slot` one pool; both and the
        // metadata pool live until the pool is freed.
        match unsafe { ObjectPool::new(self.env, obj_size, class, layout, array, meta) } {
            Ok(pool) => {
                unsafe { slot.write(pool) };
                info!("created {obj_size}-byte pool on {class} ({layout:?})");
                Ok(slot)
            }
            Err(e) => {
                unsafe {
                    caches.release_on(me, array.cast())?;
                    pools.release_on(me, slot.cast())?;
                }
                Err(e)
            }
        }
    }

    /// Returns the memory of a torn-down, unlinked pool to the seed pools.
    ///
    /// # Safety
    /// `pool` must come from `build_pool`, be on no chain and have no handles.
    unsafe fn free_pool(&self, pool: NonNull<ObjectPool<'k>>, me: CpuId) -> Result<(), AllocError> {
        let [pools, caches, _] = self.seed_pools();
        let (size, array) = {
            let p = unsafe { pool.as_ref() };
            (p.obj_size(), p.caches_ptr())
        };
        unsafe {
            ptr::drop_in_place(pool.as_ptr());
            caches.release_on(me, array.cast())?;
            pools.release_on(me, pool.cast())?;
        }
        info!("destroyed {size}-byte pool");
        Ok(())
    }

    /// A pool owned by the caller alone.
    ///
    /// `layout` of `None` applies the configured [`LayoutPolicy`](crate::LayoutPolicy).
    ///
    /// # Errors
    /// [`AllocError::InvalidArgument`] if the object does not fit the class;
    /// [`AllocError::OutOfMemory`] if the pool cannot be built.
    pub fn create_exclusive(
        &self,
        obj_size: usize,
        class: SizeClass,
        layout: Option<SlabLayout>,
    ) -> Result<ObjectPoolHandle<'_, 'k>, AllocError> {
        let me = self.env.current_cpu();
        let obj_size = slot_size(obj_size);
        let page = self.env.page_bytes(class)?;
        let layout = layout.unwrap_or_else(|| self.env.config.layout.choose(page, obj_size));
        let mut chain = self.exclusive.lock_as(me);
        let pool = self.build_pool(obj_size, class, layout, me)?;
        // SAFETY: fresh pool on no chain.
        unsafe { chain.insert(pool) };
        Ok(ObjectPoolHandle::new(pool))
    }

    /// Tears down an exclusive pool and frees it.
    ///
    /// # Errors
    /// The handle is handed back if the pool still has live allocations, was
    /// not created by [`create_exclusive`](Self::create_exclusive), or could
    /// not be drained.
    pub fn destroy_exclusive<'r>(
        &'r self,
        handle: ObjectPoolHandle<'r, 'k>,
    ) -> Result<(), Refused<ObjectPoolHandle<'r, 'k>>> {
        let me = self.env.current_cpu();
        let mut chain = self.exclusive.lock_as(me);
        if !chain.contains(handle.pool) {
            return Err(Refused {
                value: handle,
                error: AllocError::InvalidArgument("not an exclusive pool of this registry"),
            });
        }
        if let Err(error) = handle.teardown() {
            error!("refusing to destroy exclusive pool: {error}");
            return Err(Refused {
                value: handle,
                error,
            });
        }
        chain.remove(handle.pool);
        // SAFETY: torn down, unlinked, and the only handle is consumed here.
        if let Err(error) = unsafe { self.free_pool(handle.into_raw(), me) } {
            error!("exclusive pool memory not returned: {error}");
        }
        Ok(())
    }

    /// A reference to the shared pool for `obj_size`-byte objects, rounded up
    /// to the next ladder step. The pool is created on first use.
    ///
    /// # Errors
    /// [`AllocError::InvalidArgument`] if the size is beyond the ladder or
    /// the largest page; [`AllocError::OutOfMemory`] if the pool cannot be built.
    pub fn acquire_shared(&self, obj_size: usize) -> Result<ObjectPoolHandle<'_, 'k>, AllocError> {
        let step = ladder_step(obj_size)
            .ok_or(AllocError::InvalidArgument("object size beyond the shared ladder"))?;
        self.acquire_step(step).map(ObjectPoolHandle::new)
    }

    pub(crate) fn acquire_step(&self, step: usize) -> Result<NonNull<ObjectPool<'k>>, AllocError> {
        let size = LADDER[step];
        let me = self.env.current_cpu();
        let mut chain = self.shared.lock_as(me);
        // SAFETY: linked pools are live.
        if let Some(pool) = chain.iter().find(|p| unsafe { p.as_ref() }.obj_size() == size) {
            unsafe { pool.as_ref() }.shared_refs.fetch_add(1, Ordering::AcqRel);
            return Ok(pool);
        }

        let class = self.shared_class(size)?;
        let page = self.env.page_bytes(class)?;
        let layout = self.env.config.layout.choose(page, size);
        let pool = self.build_pool(size, class, layout, me)?;
        // SAFETY: fresh pool on no chain.
        unsafe {
            pool.as_ref().shared_refs.store(1, Ordering::Release);
            chain.insert(pool);
        }
        Ok(pool)
    }

    /// Drops a shared reference. The pool is destroyed once no reference and
    /// no allocation is left; with allocations outstanding it lingers until
    /// [`trim`](Self::trim) or a new [`acquire_shared`](Self::acquire_shared).
    ///
    /// # Errors
    /// [`AllocError::InvalidArgument`] if the handle is not a shared pool of
    /// this registry; errors from tearing the pool down.
    pub fn release_shared(&self, handle: ObjectPoolHandle<'_, 'k>) -> Result<(), AllocError> {
        self.release_step(handle.into_raw())
    }

    pub(crate) fn release_step(&self, pool: NonNull<ObjectPool<'k>>) -> Result<(), AllocError> {
        let me = self.env.current_cpu();
        let mut chain = self.shared.lock_as(me);
        if !chain.contains(pool) {
            return Err(AllocError::InvalidArgument("not a shared pool of this registry"));
        }
        // SAFETY: linked pools are live.
        let p = unsafe { pool.as_ref() };
        let refs = p
            .shared_refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| AllocError::InternalInconsistency("shared pool without references"))?
            - 1;
        if refs > 0 {
            return Ok(());
        }
        if p.allocations() > 0 {
            debug!(
                "{}-byte shared pool lingers with {} live objects",
                p.obj_size(),
                p.allocations()
            );
            return Ok(());
        }
        p.teardown()?;
        chain.remove(pool);
        // SAFETY: torn down, unlinked, unreferenced.
        unsafe { self.free_pool(pool, me) }
    }

    /// Destroys every shared pool without references or allocations; returns
    /// how many were destroyed.
    ///
    /// # Errors
    /// Errors from tearing a pool down; pools reaped before stay reaped.
    pub fn trim(&self) -> Result<usize, AllocError> {
        let me = self.env.current_cpu();
        let mut chain = self.shared.lock_as(me);
        let mut reaped = 0;
        loop {
            // SAFETY: linked pools are live.
            let Some(pool) = chain.iter().find(|p| {
                let p = unsafe { p.as_ref() };
                p.shared_refs.load(Ordering::Acquire) == 0 && p.allocations() == 0
            }) else {
                break;
            };
            unsafe { pool.as_ref() }.teardown()?;
            chain.remove(pool);
            unsafe { self.free_pool(pool, me)? };
            reaped += 1;
        }
        if reaped > 0 {
            info!("trimmed {reaped} shared pools");
        }
        Ok(reaped)
    }

    /// Number of pools on the shared ladder, lingering ones included.
    #[must_use]
    pub fn shared_pools(&self) -> usize {
        self.shared.lock_as(self.env.current_cpu()).len
    }

    #[must_use]
    pub fn exclusive_pools(&self) -> usize {
        self.exclusive.lock_as(self.env.current_cpu()).len
    }

    /// Tears down every pool and returns the seed page.
    ///
    /// # Errors
    /// The registry is handed back unchanged if any pool still has live
    /// allocations, and as far as it got if a teardown fails.
    pub fn shutdown(self) -> Result<(), Refused<Self>> {
        let me = self.env.current_cpu();
        let live = {
            let shared = self.shared.lock_as(me);
            let exclusive = self.exclusive.lock_as(me);
            shared
                .iter()
                .chain(exclusive.iter())
                // SAFETY: linked pools are live.
                .map(|p| unsafe { p.as_ref() }.allocations())
                .sum::<usize>()
        };
        if live > 0 {
            error!("refusing to shut down the pool registry with {live} live objects");
            return Err(Refused {
                value: self,
                error: AllocError::InternalInconsistency("pools have live allocations"),
            });
        }

        for pin in &self.heap {
            let pool = pin.swap(ptr::null_mut(), Ordering::AcqRel);
            if let Some(pool) = NonNull::new(pool) {
                // SAFETY: pinned pools are on the shared chain.
                unsafe { pool.as_ref() }.shared_refs.fetch_sub(1, Ordering::AcqRel);
            }
        }

        if let Err(error) = self.destroy_all(me) {
            error!("pool registry shutdown failed: {error}");
            return Err(Refused { value: self, error });
        }

        let phys = self.seed.phys();
        if let Err(error) = self.env.free_page(self.seed_class, phys, me) {
            error!("seed page {phys} not returned: {error}");
            return Err(Refused { value: self, error });
        }
        info!("pool registry shut down");
        Ok(())
    }

    fn destroy_all(&self, me: CpuId) -> Result<(), AllocError> {
        for chain in [&self.exclusive, &self.shared] {
            let mut chain = chain.lock_as(me);
            while let Some(pool) = chain.head {
                // SAFETY: linked pools are live; handles were checked for
                // allocations above and are unusable once the registry is gone.
                unsafe { pool.as_ref() }.teardown()?;
                chain.remove(pool);
                unsafe { self.free_pool(pool, me)? };
            }
        }
        // Slab headers of offpage pools go back to the metadata pool on
        // teardown, so it is torn down last.
        for pool in self.seed_pools() {
            pool.teardown()?;
        }
        Ok(())
    }
}

impl fmt::Debug for PoolRegistry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("seed", &self.seed.phys())
            .field("seed_class", &self.seed_class)
            .field("env", &self.env)
            .finish_non_exhaustive()
    }
}
