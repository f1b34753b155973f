use crate::IrqGuard;
use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// Test-and-test-and-set spin lock.
///
/// [`SpinLock::lock_irq`] additionally masks interrupts for the lifetime of
/// the guard, which is required for any lock that an interrupt handler also
/// takes (queue pairs, completion ports).
pub struct SpinLock<T> {
    /// lock state
    /// * `false`: unlocked
    /// * `true`: locked
    locked: AtomicBool,
    inner: UnsafeCell<T>,
}

// Safety: mutual exclusion; only T: Send may cross threads.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> SpinLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Try once; returns immediately.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.try_acquire() {
            Some(SpinLockGuard {
                lock: self,
                irq: None,
            })
        } else {
            None
        }
    }

    /// Spin until acquired, then return a guard.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: self,
            irq: None,
        }
    }

    /// Disable interrupts, then spin until acquired.
    ///
    /// Dropping the guard releases the lock first and restores the interrupt
    /// state afterwards.
    #[inline]
    pub fn lock_irq(&self) -> SpinLockGuard<'_, T> {
        let irq = IrqGuard::new();
        self.acquire();
        SpinLockGuard {
            lock: self,
            irq: Some(irq),
        }
    }

    /// Closure convenience, built on the guard.
    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock();
        f(&mut g)
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Whether some guard currently holds the lock. Only useful for assertions.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn acquire(&self) {
        // Fast path: take the lock if it looks free.
        while !self.try_acquire() {
            // Contended path: spin on a read, then retry CAS.
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    #[inline]
    fn release(&self) {
        // Release publishes the critical section.
        self.locked.store(false, Ordering::Release);
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    /// Present when the guard was taken through [`SpinLock::lock_irq`].
    irq: Option<IrqGuard>,
}

impl<T> SpinLockGuard<'_, T> {
    /// Releases the lock while `f` runs and re-acquires it afterwards in the
    /// same mode (interrupts masked again if they were masked before).
    ///
    /// `f` must not panic: the guard would otherwise release a lock it no
    /// longer holds.
    pub fn unlocked<R>(guard: &mut Self, f: impl FnOnce() -> R) -> R {
        let masked = guard.irq.is_some();
        guard.lock.release();
        drop(guard.irq.take());

        let result = f();

        if masked {
            guard.irq = Some(IrqGuard::new());
        }
        guard.lock.acquire();
        result
    }
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
        self.lock.release();
        // `irq` drops after this body and re-enables interrupts if needed.
    }
}
