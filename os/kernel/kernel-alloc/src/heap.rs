//! # Byte-count heap
//!
//! [`PoolRegistry::allocate`] serves arbitrary sizes from the shared pool
//! ladder. Each block is preceded by one [`HeapHeader`] word naming the pool
//! it came from, so [`PoolRegistry::deallocate`] needs no size:
//!
//! ```text
//! | magic:16 | pool:48 | block ...                |
//! ^ slot                ^ returned to the caller
//! ```
//!
//! Heap pools are pinned: the first allocation at a ladder step takes a
//! shared reference that is only dropped by
//! [`PoolRegistry::shutdown`](crate::PoolRegistry::shutdown).
//!
//! [`GlobalHeap`] adapts the facade to [`GlobalAlloc`].

use crate::AllocError;
use crate::object_pool::ObjectPool;
use crate::registry::{LADDER_STEPS, PoolRegistry, ladder_step};
use bitfield_struct::bitfield;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering;
use kernel_sync::{PreemptGuard, Preemption, SyncOnceCell};
use log::error;

/// Marks a live heap block.
pub const HEAP_MAGIC: u16 = 0xA110;

/// Bytes in front of every heap block.
pub const HEADER_BYTES: usize = size_of::<HeapHeader>();

/// Alignment of every heap block.
pub const HEAP_ALIGN: usize = HEADER_BYTES;

const _: () = assert!(HEADER_BYTES == 8);

/// Header word of a heap block.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct HeapHeader {
    /// [`HEAP_MAGIC`] while the block is live.
    pub magic: u16,
    /// Owning pool address, bits 0..48.
    #[bits(48)]
    pool_bits: u64,
}

impl HeapHeader {
    const ADDRESS_BITS: u32 = 48;

    /// A live header for `pool`.
    #[must_use]
    pub fn for_pool(pool: *const ObjectPool<'_>) -> Self {
        Self::new()
            .with_magic(HEAP_MAGIC)
            .with_pool_bits(pool as u64 & ((1 << Self::ADDRESS_BITS) - 1))
    }

    /// The pool address, sign-extended from bit 47.
    #[must_use]
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub const fn pool_addr(&self) -> usize {
        let shift = u64::BITS - Self::ADDRESS_BITS;
        (((self.pool_bits() << shift) as i64) >> shift) as u64 as usize
    }
}

impl<'k> PoolRegistry<'k> {
    /// The pinned heap pool for ladder `step`, created on first use.
    fn heap_pool(&self, step: usize) -> Result<&ObjectPool<'k>, AllocError> {
        let pin = &self.heap[step];
        let mut pool = pin.load(Ordering::Acquire);
        if pool.is_null() {
            let fresh = self.acquire_step(step)?;
            match pin.compare_exchange(
                ptr::null_mut(),
                fresh.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => pool = fresh.as_ptr(),
                Err(winner) => {
                    // Both racers got the same pool; drop the extra reference.
                    self.release_step(fresh)?;
                    pool = winner;
                }
            }
        }
        // SAFETY: pinned pools stay on the shared chain until shutdown.
        Ok(unsafe { &*pool })
    }

    /// A block of at least `bytes` bytes, aligned to [`HEAP_ALIGN`].
    ///
    /// # Errors
    /// [`AllocError::InvalidArgument`] if the request exceeds the ladder;
    /// [`AllocError::OutOfMemory`] if the pool cannot grow.
    pub fn allocate(&self, bytes: usize) -> Result<NonNull<u8>, AllocError> {
        let total = bytes
            .checked_add(HEADER_BYTES)
            .ok_or(AllocError::InvalidArgument("request too large"))?;
        let step = ladder_step(total)
            .ok_or(AllocError::InvalidArgument("request beyond the heap ladder"))?;
        let pool = self.heap_pool(step)?;
        let obj = pool.acquire()?;
        let header = HeapHeader::for_pool(pool);
        // SAFETY: the slot is at least `total` bytes and word aligned.
        unsafe {
            obj.cast::<u64>().write(header.into_bits());
            Ok(obj.add(HEADER_BYTES))
        }
    }

    /// Frees a block from [`allocate`](Self::allocate).
    ///
    /// # Errors
    /// [`AllocError::InvalidArgument`] if the header does not carry the magic
    /// or names a pool that is not a heap pool of this registry. Errors of
    /// [`ObjectPool::release`].
    ///
    /// # Safety
    /// `block` must be readable for the header word in front of it; if it is a
    /// heap block it must be live and is not used afterwards.
    pub unsafe fn deallocate(&self, block: NonNull<u8>) -> Result<(), AllocError> {
        // SAFETY: forwarded from the caller.
        let obj = unsafe { block.sub(HEADER_BYTES) };
        let header = HeapHeader::from_bits(unsafe { obj.cast::<u64>().read() });
        if header.magic() != HEAP_MAGIC {
            return Err(AllocError::InvalidArgument("not a heap block"));
        }
        let owner = header.pool_addr();
        let pool = (0..LADDER_STEPS)
            .map(|step| self.heap[step].load(Ordering::Acquire))
            .find(|&p| !p.is_null() && p as usize == owner)
            .ok_or(AllocError::InvalidArgument("heap header names no heap pool"))?;
        // SAFETY: a pinned heap pool; the slot was acquired from it.
        unsafe {
            obj.cast::<u64>().write(0);
            (*pool).release(obj)
        }
    }
}

/// [`GlobalAlloc`] over an installed `'static` registry.
///
/// Every call runs with preemption disabled. Layouts aligned beyond
/// [`HEAP_ALIGN`], and any call before [`install`](Self::install), get null.
pub struct GlobalHeap {
    registry: SyncOnceCell<PoolRegistry<'static>>,
    preemption: &'static (dyn Preemption + Sync),
}

impl GlobalHeap {
    #[must_use]
    pub const fn new(preemption: &'static (dyn Preemption + Sync)) -> Self {
        Self {
            registry: SyncOnceCell::new(),
            preemption,
        }
    }

    /// Hands the registry to the allocator; a second registry is handed back.
    ///
    /// # Errors
    /// The rejected registry if one is already installed.
    pub fn install(&self, registry: PoolRegistry<'static>) -> Result<(), PoolRegistry<'static>> {
        self.registry.set(registry)
    }

    #[must_use]
    pub fn registry(&self) -> Option<&PoolRegistry<'static>> {
        self.registry.get()
    }
}

unsafe impl GlobalAlloc for GlobalHeap {
    /// # Safety
    /// The `GlobalAlloc` contract applies. Caller must handle a null return (OOM).
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > HEAP_ALIGN {
            return ptr::null_mut();
        }
        let Some(registry) = self.registry.get() else {
            return ptr::null_mut();
        };
        let _guard = PreemptGuard::new(self.preemption);
        registry
            .allocate(layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// # Safety
    /// The `GlobalAlloc` contract applies. `ptr` must come from `alloc` of this allocator.
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let (Some(registry), Some(block)) = (self.registry.get(), NonNull::new(ptr)) else {
            return;
        };
        let _guard = PreemptGuard::new(self.preemption);
        if let Err(e) = unsafe { registry.deallocate(block) } {
            error!("heap free of {ptr:p} failed: {e}");
        }
    }
}
