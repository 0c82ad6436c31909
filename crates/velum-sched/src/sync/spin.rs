//! Spin-based mutual exclusion for short, deterministic critical sections

use crate::sync::backoff::yielding_backoff;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// Spin lock guarding a value.
///
/// Suitable only for short critical sections (queue link/unlink, counter
/// updates). Acquisition is paced by the yielding backoff ladder so a
/// contended lock does not monopolize a core.
pub struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: the flag serializes access to the value
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, spinning until it is available.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let mut poll = 0u64;
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            yielding_backoff(poll);
            poll += 1;
        }
        SpinLockGuard { lock: self }
    }

    /// Acquire the lock only if it is currently free.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
            .then(|| SpinLockGuard { lock: self })
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct RwState {
    readers: usize,
    writers: usize,
}

/// Read-write lock layered over [`SpinLock`].
///
/// A writer is admitted only when no readers or writers hold the lock;
/// readers stack freely while no writer is active.
pub struct RwSpinLock<T> {
    state: SpinLock<RwState>,
    value: UnsafeCell<T>,
}

// SAFETY: the reader/writer counts serialize access to the value
unsafe impl<T: Send> Send for RwSpinLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwSpinLock<T> {}

impl<T> RwSpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            state: SpinLock::new(RwState {
                readers: 0,
                writers: 0,
            }),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire shared read access.
    pub fn read(&self) -> RwReadGuard<'_, T> {
        let mut poll = 0u64;
        loop {
            {
                let mut state = self.state.lock();
                if state.writers == 0 {
                    state.readers += 1;
                    return RwReadGuard { lock: self };
                }
            }
            yielding_backoff(poll);
            poll += 1;
        }
    }

    /// Acquire exclusive write access.
    pub fn write(&self) -> RwWriteGuard<'_, T> {
        let mut poll = 0u64;
        loop {
            {
                let mut state = self.state.lock();
                if state.writers == 0 && state.readers == 0 {
                    state.writers += 1;
                    return RwWriteGuard { lock: self };
                }
            }
            yielding_backoff(poll);
            poll += 1;
        }
    }
}

pub struct RwReadGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<T> Deref for RwReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: readers are admitted only while no writer is active
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> Drop for RwReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.lock().readers -= 1;
    }
}

pub struct RwWriteGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<T> Deref for RwWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the writer holds exclusive access
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for RwWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the writer holds exclusive access
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for RwWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.lock().writers -= 1;
    }
}
