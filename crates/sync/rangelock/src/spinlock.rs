//! Spin lock guarding a manager's request sequence.
//!
//! Uses test-and-test-and-set (TTAS) to reduce cache-line contention. Every
//! critical section under this lock is a bounded walk of the sequence, so
//! spinning is cheaper than parking.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::loom_compat::{AtomicBool, Ordering, spin_loop};

/// A spin-based mutual exclusion lock.
pub(crate) struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: The SpinLock ensures exclusive access to `T` via atomic operations.
// `T: Send` is required because the data may be accessed from different threads.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new unlocked `SpinLock` wrapping `value`.
    pub(crate) fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning until it becomes available.
    pub(crate) fn lock(&self) -> SpinLockGuard<'_, T> {
        #[cfg(rangelock_stress)]
        crate::stress::stress_delay();

        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinLockGuard { lock: self };
            }

            // TTAS: spin on a read (shared cache line) until it looks free.
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    /// Returns a mutable reference to the data. No locking is needed since
    /// `&mut self` proves there are no other users.
    pub(crate) fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// RAII guard that releases the [`SpinLock`] when dropped.
pub(crate) struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);

        #[cfg(rangelock_stress)]
        crate::stress::stress_delay();
    }
}


#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;

    #[test]
    fn two_threads_mutually_exclude() {
        loom::model(|| {
            let lock = Arc::new(SpinLock::new(0usize));
            let other = lock.clone();
            let t = loom::thread::spawn(move || {
                let mut guard = other.lock();
                let seen = *guard;
                loom::thread::yield_now();
                *guard = seen + 1;
            });
            {
                let mut guard = lock.lock();
                let seen = *guard;
                *guard = seen + 1;
            }
            t.join().unwrap();
            assert_eq!(*lock.lock(), 2);
        });
    }

    #[test]
    fn critical_sections_never_interleave() {
        loom::model(|| {
            let lock = Arc::new(SpinLock::new((0u32, 0u32)));
            let other = lock.clone();
            let t = loom::thread::spawn(move || {
                let mut guard = other.lock();
                guard.0 += 1;
                loom::thread::yield_now();
                guard.1 += 1;
            });
            {
                let guard = lock.lock();
                assert_eq!(guard.0, guard.1);
            }
            t.join().unwrap();
        });
    }
}
