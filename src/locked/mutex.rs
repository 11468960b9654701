//! A mutex container parameterized over any [`Lock`], so that the heap can be
//! shared without assuming an operating system.

use core::{
    cell::{Cell, UnsafeCell},
    ops::{Deref, DerefMut},
};

/// A trait for providing mutual exclusion around a heap.
///
/// The heap's algorithms mutate free-list nodes in place and are not
/// re-entrant, so every public operation on a shared heap runs under one of
/// these.
///
/// # Safety
///
/// * If the implementation type is `Sync`, then a [`LockedHeap`](crate::LockedHeap)
///   using it will be `Sync`, and therefore `lock` must provide actual mutual
///   exclusion and prevent unsynchronized accesses.
///
/// * Even in single-threaded contexts this type must prevent recursive locking
///   and re-entering the lock when it is already held, for example from a
///   logger that allocates. The prevention may be a panic, abort, infinite
///   loop, or etc...
pub unsafe trait Lock {
    /// Acquire the lock.
    ///
    /// If it is already held, this must result in a panic, abort, infinite
    /// loop, or etc... and locking must not succeed.
    fn lock(&self);

    /// Release the lock.
    fn unlock(&self);
}

/// A single-threaded implementation of [`Lock`].
///
/// This is effectively a `RefCell`: it panics on re-entrance and is not
/// `Sync`.
#[derive(Debug, Default)]
pub struct SingleThreadedLock {
    locked: Cell<bool>,
}

unsafe impl Lock for SingleThreadedLock {
    #[inline]
    fn lock(&self) {
        assert!(!self.locked.get(), "heap lock is already held");
        self.locked.set(true);
    }

    #[inline]
    fn unlock(&self) {
        assert!(self.locked.get());
        self.locked.set(false);
    }
}

impl SingleThreadedLock {
    /// Construct a new `SingleThreadedLock`.
    #[inline]
    pub const fn new() -> Self {
        SingleThreadedLock {
            locked: Cell::new(false),
        }
    }
}

/// A spin lock implementation of [`Lock`], built on [`spin::mutex::SpinMutex`].
///
/// Suitable for a `#[global_allocator]`. Re-entering it from the thread that
/// holds it spins forever.
#[cfg(feature = "spin")]
#[derive(Debug, Default)]
pub struct SpinLock {
    raw: spin::mutex::SpinMutex<()>,
}

#[cfg(feature = "spin")]
unsafe impl Lock for SpinLock {
    #[inline]
    fn lock(&self) {
        // The guard is reconstituted by `force_unlock` in `unlock`.
        core::mem::forget(self.raw.lock());
    }

    #[inline]
    fn unlock(&self) {
        debug_assert!(self.raw.is_locked());
        // Safety: `Mutex` only unlocks from the guard created by a matching
        // `lock`, whose `SpinMutexGuard` was forgotten above.
        unsafe { self.raw.force_unlock() };
    }
}

#[cfg(feature = "spin")]
impl SpinLock {
    /// Construct a new, unlocked `SpinLock`.
    #[inline]
    pub const fn new() -> Self {
        SpinLock {
            raw: spin::mutex::SpinMutex::new(()),
        }
    }
}

pub(super) struct Mutex<T, L> {
    lock: L,
    value: UnsafeCell<T>,
}

// Safety: if `T` and `L` can be sent between threads, then the mutex can as
// well. The API, implementation, and borrow checker do not allow for
// unsynchronized accesses in the face of sending these across threads.
unsafe impl<T, L> Send for Mutex<T, L>
where
    T: Send,
    L: Send,
{
}

// Safety: upheld by the `Lock` trait's implementation contract.
//
// Additionally, `T` must be `Send` because locking a mutex from another thread
// and getting a mutex guard allows getting `&mut T`, which can be used to
// `mem::replace()` the `T`, effectively sending it between threads.
unsafe impl<T, L> Sync for Mutex<T, L>
where
    T: Send,
    L: Sync + Lock,
{
}

impl<T, L> Mutex<T, L>
where
    L: Lock,
{
    pub(super) const fn new(value: T, lock: L) -> Self {
        let value = UnsafeCell::new(value);
        Mutex { lock, value }
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, T, L> {
        self.lock.lock();
        MutexGuard { mutex: self }
    }

    /// No locking needed: `&mut self` proves exclusive access.
    pub(super) fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub(super) fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

pub(super) struct MutexGuard<'a, T, L>
where
    L: Lock,
{
    mutex: &'a Mutex<T, L>,
}

impl<T, L> Drop for MutexGuard<'_, T, L>
where
    L: Lock,
{
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

impl<T, L> Deref for MutexGuard<'_, T, L>
where
    L: Lock,
{
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // Safety: the lock is held for as long as the guard lives.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T, L> DerefMut for MutexGuard<'_, T, L>
where
    L: Lock,
{
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: the lock is held for as long as the guard lives.
        unsafe { &mut *self.mutex.value.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_releases_on_drop() {
        let mutex = Mutex::new(5, SingleThreadedLock::new());
        {
            let mut guard = mutex.lock();
            *guard += 1;
        }
        assert_eq!(*mutex.lock(), 6);
    }

    #[test]
    #[should_panic(expected = "heap lock is already held")]
    fn single_threaded_lock_rejects_reentrance() {
        let mutex = Mutex::new((), SingleThreadedLock::new());
        let _a = mutex.lock();
        let _b = mutex.lock();
    }

    #[test]
    #[cfg(feature = "spin")]
    fn spin_lock_excludes_threads() {
        use std::{sync::Arc, thread, vec::Vec};

        let mutex = Arc::new(Mutex::new(0usize, SpinLock::new()));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let mutex = mutex.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *mutex.lock() += 1;
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*mutex.lock(), 4000);
    }

    #[test]
    #[cfg(feature = "spin")]
    fn spin_lock_is_released_by_the_guard() {
        let mutex = Mutex::new((), SpinLock::new());
        drop(mutex.lock());
        assert!(!mutex.lock.raw.is_locked());
        let _guard = mutex.lock();
        assert!(mutex.lock.raw.is_locked());
    }
}
