//! Minimal spinlock, used by [`crate::live_tasks::LiveTaskRegistry`] when
//! `LockStrategy::Spin` is configured (distilled §5, §9: "mutex or
//! spinlock, chosen at build time" redesigned into a runtime option).
//!
//! No crate in the workspace's dependency tree provides one (`spin` is not
//! a dependency), and the registry's critical sections are a single
//! `HashMap` insert/remove/get held for a handful of instructions, which is
//! exactly the case a busy-wait lock is for. This is the textbook
//! test-and-test-and-set spinlock, not a novel design.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// A busy-wait mutual-exclusion lock.
pub struct Spinlock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Spinlock<T> {}
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    /// Builds an unlocked spinlock around `value`.
    pub fn new(value: T) -> Self {
        Spinlock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Spins until the lock is acquired, then returns a guard.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
        SpinlockGuard { lock: self }
    }
}

impl<T: fmt::Debug> fmt::Debug for Spinlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.locked.load(Ordering::Relaxed) {
            true => f.debug_struct("Spinlock").field("data", &"<locked>").finish(),
            false => f
                .debug_struct("Spinlock")
                .field("data", unsafe { &*self.data.get() })
                .finish(),
        }
    }
}

/// RAII guard releasing a [`Spinlock`] on drop.
pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

impl<'a, T> Deref for SpinlockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinlockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinlockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
