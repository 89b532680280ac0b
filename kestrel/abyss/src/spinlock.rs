//! SMP-supported spinlock.

use crate::interrupt::InterruptGuard;
use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};
use crossbeam_utils::Backoff;

/// The lock could not be acquired at this time because the operation would
/// otherwise block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WouldBlock;

/// A mutual exclusion primitive useful for protecting shared data
///
/// This spinlock will busy-wait until the lock becomes available. While the
/// lock is held, interrupts are disabled on the holding core, and the state
/// observed before locking is restored on release.
/// The spinlock can be created via a [`new`] constructor. Each spinlock has a
/// type parameter which represents the data that it is protecting. The data can
/// only be accessed through the guards returned from [`lock`] and
/// [`try_lock`], which guarantees that the data is only ever accessed when the
/// spinlock is locked.
///
/// [`new`]: Self::new
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
///
/// # Examples
///
/// ```ignore
/// use alloc::sync::Arc;
/// use kestrel::sync::SpinLock;
/// use kestrel::thread;
///
/// const N: usize = 10;
///
/// // Spawn a few threads to increment a shared variable (non-atomically).
/// let data = Arc::new(SpinLock::new(0));
///
/// for _ in 0..N {
///     let data = Arc::clone(&data);
///     thread::ThreadBuilder::new("work").spawn(move || {
///         let mut guard = data.lock();
///         *guard += 1;
///         // released here, or explicitly with `guard.unlock()`.
///     });
/// }
/// ```
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    _pad: [u8; 15],
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// use kestrel::sync::SpinLock;
    ///
    /// let spinlock = SpinLock::new(0);
    /// ```
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            data: UnsafeCell::new(t),
            _pad: [0u8; 15],
            locked: AtomicBool::new(false),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires a spinlock, busy-waiting until it is able to do so.
    ///
    /// Upon returning, the caller is the only one with the lock held and
    /// interrupts are disabled on the executing core. Between attempts the
    /// caller's previous interrupt state is restored, so pending interrupts
    /// can be served while waiting.
    ///
    /// The exact behavior on locking a spinlock in the thread which already
    /// holds the lock is left unspecified. However, this function will not
    /// return on the second call.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// use kestrel::sync::SpinLock;
    ///
    /// let spinlock = SpinLock::new(0);
    /// let mut guard = spinlock.lock();
    /// *guard = 10;
    /// guard.unlock();
    /// ```
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let backoff = Backoff::new();
        let guard = loop {
            let guard = InterruptGuard::new();
            if !self.locked.swap(true, Ordering::Acquire) {
                break guard;
            }
            drop(guard);

            while self.locked.load(Ordering::Relaxed) {
                if backoff.is_completed() {
                    crate::platform::platform().relax();
                } else {
                    backoff.spin();
                }
            }
        };

        SpinLockGuard {
            caller: core::panic::Location::caller(),
            lock: self,
            guard: Some(guard),
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire this lock.
    ///
    /// If the lock could not be acquired at this time, then [`Err`] is
    /// returned. Otherwise, an guard is returned. The lock will be
    /// unlocked when the guard is dropped.
    ///
    /// This function does not block.
    ///
    /// # Errors
    ///
    /// If the spinlock could not be acquired because it is already locked, then
    /// this call will return the [`WouldBlock`] error.
    #[track_caller]
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        let guard = InterruptGuard::new();
        if !self.locked.swap(true, Ordering::Acquire) {
            Ok(SpinLockGuard {
                guard: Some(guard),
                caller: core::panic::Location::caller(),
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            Err(WouldBlock)
        }
    }

    /// Whether the lock is currently held by anyone.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Consumes this spinlock, returning the underlying data.
    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.data.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    /// Creates a `SpinLock<T>`, with the `Default` value for T.
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

/// An implementation of a "scoped lock" of a spinlock. The lock is released
/// and the interrupt state restored when this structure is dropped, on every
/// exit path including unwinding.
///
/// The data protected by the spinlock can be accessed through this guard.
///
/// This structure is created by the [`lock`] and [`try_lock`] methods on
/// [`SpinLock`].
///
/// [`lock`]: SpinLock::lock
/// [`try_lock`]: SpinLock::try_lock
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    caller: &'static core::panic::Location<'static>,
    lock: &'a SpinLock<T>,
    guard: Option<InterruptGuard>,
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<'a, T: ?Sized> SpinLockGuard<'a, T> {
    /// Releases the underlying [`SpinLock`].
    ///
    /// Same as dropping the guard, spelled out.
    pub fn unlock(self) {
        drop(self);
    }

    /// Where the lock was taken.
    pub fn caller(&self) -> &'static core::panic::Location<'static> {
        self.caller
    }

    /// Gives up the guard while keeping the lock held.
    ///
    /// Returns a token that releases the lock word later, possibly from
    /// another flow of control, and the interrupt guard of this flow. The
    /// holder of the token must release it exactly once.
    pub fn into_held(mut self) -> (HeldLock, InterruptGuard) {
        let guard = self.guard.take();
        let held = HeldLock {
            locked: &self.lock.locked as *const AtomicBool,
        };
        core::mem::forget(self);
        match guard {
            Some(guard) => (held, guard),
            None => unreachable!(),
        }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        self.guard.take();
    }
}

/// A spin lock whose guard was given away without releasing it.
///
/// See [`SpinLockGuard::into_held`].
#[must_use = "a held lock stays locked until released"]
pub struct HeldLock {
    locked: *const AtomicBool,
}

unsafe impl Send for HeldLock {}

impl HeldLock {
    /// Releases the lock.
    ///
    /// # Safety
    /// The lock must still be alive.
    pub unsafe fn release(self) {
        unsafe { (*self.locked).store(false, Ordering::Release) };
    }
}

impl core::fmt::Debug for HeldLock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HeldLock").field("locked", &self.locked).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_releases_on_drop() {
        let lock = SpinLock::new(1);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(lock.is_locked());
            assert!(lock.try_lock().is_err());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 2);
    }

    #[test]
    fn held_lock_stays_locked_until_released() {
        let lock = SpinLock::new(());
        let (held, irq) = lock.lock().into_held();
        drop(irq);
        assert_eq!(lock.try_lock().err(), Some(WouldBlock));
        unsafe { held.release() };
        assert!(lock.try_lock().is_ok());
    }
}
