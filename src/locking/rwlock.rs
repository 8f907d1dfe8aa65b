// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024-2025 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};

/// A guard that provides read access to the data protected by [`RWLock`].
#[derive(Debug)]
#[must_use = "if unused the RWLock will immediately unlock"]
pub struct ReadLockGuard<'a, T> {
    /// Reference to the associated `AtomicU64` in the [`RWLock`]
    rwlock: &'a AtomicU64,
    data: &'a T,
}

/// Implements the behavior of the [`ReadLockGuard`] when it is dropped
impl<T> Drop for ReadLockGuard<'_, T> {
    /// Release the read lock
    fn drop(&mut self) {
        self.rwlock.fetch_sub(compose_val(1, 0), Ordering::Release);
    }
}

impl<T> Deref for ReadLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.data
    }
}

/// A guard that provides exclusive write access to the data protected by
/// [`RWLock`].
#[derive(Debug)]
#[must_use = "if unused the RWLock will immediately unlock"]
pub struct WriteLockGuard<'a, T> {
    /// Reference to the associated `AtomicU64` in the [`RWLock`]
    rwlock: &'a AtomicU64,
    data: &'a mut T,
}

/// Implements the behavior of the [`WriteLockGuard`] when it is dropped
impl<T> Drop for WriteLockGuard<'_, T> {
    fn drop(&mut self) {
        self.rwlock.fetch_sub(compose_val(0, 1), Ordering::Release);
    }
}

impl<T> Deref for WriteLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.data
    }
}

impl<T> DerefMut for WriteLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}

const RW_BITS: u64 = 32;
const RW_MASK: u64 = (1 << RW_BITS) - 1;

/// Splits a 64-bit value into two parts: readers (low 32 bits) and
/// writers (high 32 bits).
#[inline]
fn split_val(val: u64) -> (u64, u64) {
    (val & RW_MASK, val >> RW_BITS)
}

/// Composes a 64-bit value by combining the number of readers (low 32
/// bits) and writers (high 32 bits).
#[inline]
fn compose_val(readers: u64, writers: u64) -> u64 {
    (readers & RW_MASK) | (writers << RW_BITS)
}

/// A simple Read-Write Lock (RWLock) that allows multiple readers or
/// one exclusive writer. Writers wait for every reader that entered before
/// them to drain, which is what gives notifier unregistration its
/// grace-period semantics.
#[derive(Debug)]
pub struct RWLock<T> {
    /// An atomic 64-bit integer used for synchronization
    rwlock: AtomicU64,
    /// An UnsafeCell for interior mutability
    data: UnsafeCell<T>,
}

// SAFETY: All well-formed locks are `Send`.
unsafe impl<T: Send> Send for RWLock<T> {}
// SAFETY: All well-formed locks are `Sync`.
unsafe impl<T: Send> Sync for RWLock<T> {}

impl<T> RWLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            rwlock: AtomicU64::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Waits until all writers have finished and returns the last observed
    /// state of the lock.
    #[inline]
    fn wait_for_writers(&self) -> u64 {
        loop {
            let val: u64 = self.rwlock.load(Ordering::Relaxed);
            let (_, writers) = split_val(val);

            if writers == 0 {
                return val;
            }
            core::hint::spin_loop();
        }
    }

    /// Waits until all readers have finished and returns the last observed
    /// state of the lock.
    #[inline]
    fn wait_for_readers(&self) -> u64 {
        loop {
            let val: u64 = self.rwlock.load(Ordering::Relaxed);
            let (readers, _) = split_val(val);

            if readers == 0 {
                return val;
            }
            core::hint::spin_loop();
        }
    }

    /// This function allows multiple readers to access the data
    /// concurrently.
    pub fn lock_read(&self) -> ReadLockGuard<'_, T> {
        loop {
            let val = self.wait_for_writers();
            let (readers, _) = split_val(val);
            let new_val = compose_val(readers + 1, 0);

            if self
                .rwlock
                .compare_exchange(val, new_val, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            core::hint::spin_loop();
        }

        ReadLockGuard {
            rwlock: &self.rwlock,
            // SAFETY: the reader count guarantees no concurrent writer.
            data: unsafe { &*self.data.get() },
        }
    }

    /// This function ensures exclusive access for a single writer and waits
    /// for all readers to finish before granting access.
    pub fn lock_write(&self) -> WriteLockGuard<'_, T> {
        // Waiting for current writer to finish
        loop {
            let val = self.wait_for_writers();
            let (readers, _) = split_val(val);
            let new_val = compose_val(readers, 1);

            if self
                .rwlock
                .compare_exchange(val, new_val, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            core::hint::spin_loop();
        }

        // Now locked for write - wait until all readers finished
        let val: u64 = self.wait_for_readers();
        assert!(val == compose_val(0, 1));

        WriteLockGuard {
            rwlock: &self.rwlock,
            // SAFETY: writer flag plus drained readers guarantee exclusive
            // access.
            data: unsafe { &mut *self.data.get() },
        }
    }
}
