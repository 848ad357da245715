use crate::CpuId;
use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};

/// Holder value meaning "unlocked, or locked by an unnamed holder".
const NO_HOLDER: u32 = 0;

/// A test-and-test-and-set spin lock.
///
/// The lock is **not** reentrant. Callers that know which CPU they run on
/// should use [`lock_as`](Self::lock_as): it records the holding CPU and turns
/// a same-CPU re-entry (an interrupt handler taking a lock its interrupted
/// code already holds) into a panic instead of a silent deadlock.
pub struct SpinLock<T> {
    /// lock state
    /// * `false`: unlocked
    /// * `true`: locked
    locked: AtomicBool,
    /// `cpu + 1` of the holder when taken through [`lock_as`](Self::lock_as).
    holder: AtomicU32,
    inner: UnsafeCell<T>,
}

// Safety: mutual exclusion; only T: Send may cross threads.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            holder: AtomicU32::new(NO_HOLDER),
            inner: UnsafeCell::new(inner),
        }
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Spin until acquired, then return a guard.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while !self.try_acquire() {
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
        SpinLockGuard { lock: self }
    }

    /// Spin until acquired on behalf of `cpu`, then return a guard.
    ///
    /// # Panics
    /// If the lock is already held by `cpu`; spinning would never end.
    #[inline]
    pub fn lock_as(&self, cpu: CpuId) -> SpinLockGuard<'_, T> {
        let me = cpu.as_u32().wrapping_add(1);
        while !self.try_acquire() {
            assert!(
                self.holder.load(Ordering::Relaxed) != me,
                "spin lock re-entered on {cpu}"
            );
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
        self.holder.store(me, Ordering::Relaxed);
        SpinLockGuard { lock: self }
    }

    /// Whether some holder currently owns the lock. Racy by nature; for
    /// assertions and diagnostics only.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// The CPU recorded by [`lock_as`](Self::lock_as), if the lock is held that way.
    #[inline]
    pub fn holder(&self) -> Option<CpuId> {
        match self.holder.load(Ordering::Relaxed) {
            NO_HOLDER => None,
            h => Some(CpuId::new(h - 1)),
        }
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.holder.store(NO_HOLDER, Ordering::Relaxed);
        // Release publishes the critical section.
        self.lock.locked.store(false, Ordering::Release);
    }
}
