//! # Synchronization Primitives
//!
//! Two tools guard shared kernel state on the single hart:
//!
//! - [`critical_section`] masks interrupts for the duration of a closure.
//!   Foreground (task) code wraps every kernel call in it, so trap handlers
//!   never observe a half-finished update.
//! - [`Spinlock`] is a test-and-set flag protecting the software timer list.
//!   It does not mask interrupts by itself; trap context only ever uses
//!   [`Spinlock::try_lock`], so a lock held by masked foreground code can
//!   never make the trap handler spin.

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use critical_section::CriticalSection;

/// Execute a closure with interrupts disabled.
///
/// Interrupts are disabled on entry and restored on exit. On the target the
/// implementation comes from the `riscv` crate (`mstatus.MIE`); host tests use
/// the `std` implementation of `critical-section`.
///
/// # Usage
/// ```ignore
/// sync::critical_section(|_cs| {
///     // Access shared kernel state safely
/// });
/// ```
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}

/// Mutual exclusion over a single `locked` flag.
///
/// Acquired with an atomic test-and-set, released by a plain store when the
/// guard drops.
pub struct Spinlock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is serialized by `locked`.
unsafe impl<T: Send> Sync for Spinlock<T> {}
unsafe impl<T: Send> Send for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Spin until the flag is acquired.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
        SpinlockGuard { lock: self }
    }

    /// Acquire the flag only if it is free right now.
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        if self.locked.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(SpinlockGuard { lock: self })
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Exclusive access without touching the flag; `&mut self` already
    /// proves nobody else holds it.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard exists only while `locked` is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard exists only while `locked` is held.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_and_release() {
        let lock = Spinlock::new(5u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let lock = Spinlock::new(());
        let guard = lock.try_lock();
        assert!(guard.is_some());
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_get_mut_and_into_inner() {
        let mut lock = Spinlock::new([0u8; 4]);
        lock.get_mut()[2] = 9;
        assert_eq!(lock.into_inner(), [0, 0, 9, 0]);
    }

    #[test]
    fn test_critical_section_returns_value() {
        let lock = Spinlock::new(1u8);
        let value = critical_section(|_cs| *lock.lock() + 1);
        assert_eq!(value, 2);
    }
}
