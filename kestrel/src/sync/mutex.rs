//! # Mutex.
//!
//! Mutex is a synchronization primitive that allows **only one thread at a
//! time** to access a critical section of code. Unlike the spin lock, it
//! **blocks** threads trying to acquire it if another thread already holds
//! the lock.
//!
//! The lock word is the thread id of the owner. Acquiring it is a single
//! compare-and-swap from "nobody"; on contention the thread sleeps in the
//! embedded [`WaitQueue`]. Unlocking clears the owner and wakes one sleeper,
//! which then competes for the lock word again: ownership is never handed
//! over directly.
//!
//! |                | SpinLock                 | Mutex                      |
//! |----------------|--------------------------|----------------------------|
//! | Waiting thread | Spins (busy-waits)       | Sleeps                     |
//! | CPU usage      | High (wastes CPU cycles) | Low (no busy waiting)      |
//! | Overhead       | Low (fast if uncontended)| Higher (due to sleep/wake) |
//!
//! A mutex is not reentrant: locking it again from the owner never returns.
use super::{Release, SleepResult, WaitQueue, WouldBlock};
use crate::{Kernel, KernelError, sched, thread::Current};
use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU64, Ordering},
};

const UNLOCKED: u64 = u64::MAX;

/// A mutex without data: an owner and the threads waiting for it.
pub struct RawMutex {
    owner: AtomicU64,
    waiters: WaitQueue,
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl RawMutex {
    /// Creates an unlocked mutex.
    pub const fn new() -> Self {
        Self {
            owner: AtomicU64::new(UNLOCKED),
            waiters: WaitQueue::new(),
        }
    }

    /// Thread id of the owner, if locked.
    pub fn owner(&self) -> Option<u64> {
        match self.owner.load(Ordering::Acquire) {
            UNLOCKED => None,
            tid => Some(tid),
        }
    }

    fn try_acquire(&self, tid: u64) -> bool {
        self.owner
            .compare_exchange(UNLOCKED, tid, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquires the mutex without blocking.
    pub fn try_lock(&self) -> Result<(), WouldBlock> {
        if self.try_acquire(Current::get_tid()) {
            Ok(())
        } else {
            Err(WouldBlock)
        }
    }

    /// Acquires the mutex, sleeping as long as it is held.
    pub fn lock(&self) {
        let _ = self.lock_until(None);
    }

    /// Acquires the mutex, giving up after `ticks` clock ticks.
    ///
    /// # Errors
    /// [`KernelError::TimedOut`] if the mutex stayed locked.
    pub fn lock_timeout(&self, ticks: u64) -> Result<(), KernelError> {
        let kernel = Kernel::try_current().ok_or(KernelError::OperationNotPermitted)?;
        self.lock_until(Some((kernel, kernel.jiffies() + ticks)))
    }

    fn lock_until(&self, deadline: Option<(&Kernel, u64)>) -> Result<(), KernelError> {
        let tid = Current::get_tid();
        loop {
            if self.try_acquire(tid) {
                return Ok(());
            }
            let waiters = self.waiters.lock();
            // Unlockers clear the owner before they look for sleepers.
            if self.owner.load(Ordering::Acquire) == UNLOCKED {
                waiters.unlock();
                continue;
            }
            assert_ne!(
                self.owner.load(Ordering::Acquire),
                tid,
                "Thread {tid} locked a mutex it already holds."
            );
            let left = match deadline {
                None => None,
                Some((kernel, deadline)) => {
                    match deadline.checked_sub(kernel.jiffies()) {
                        Some(left) if left > 0 => Some(left),
                        _ => {
                            waiters.unlock();
                            return Err(KernelError::TimedOut);
                        }
                    }
                }
            };
            match waiters.sleep(left, false) {
                SleepResult::Woken | SleepResult::TimedOut => (),
                SleepResult::Interrupted => unreachable!(),
            }
        }
    }

    /// Releases the mutex.
    ///
    /// # Panics
    /// Panics if the current thread does not own the mutex.
    #[track_caller]
    pub fn unlock(&self) {
        let tid = Current::get_tid();
        match self
            .owner
            .compare_exchange(tid, UNLOCKED, Ordering::Release, Ordering::Relaxed)
        {
            Ok(_) => (),
            Err(UNLOCKED) => panic!("Thread {tid} unlocked a mutex nobody holds."),
            Err(owner) => panic!("Thread {tid} unlocked a mutex owned by thread {owner}."),
        }
        let mut waiters = self.waiters.lock();
        if !waiters.is_empty() {
            waiters.wakeup_one();
        }
        waiters.unlock();
    }
}

/// A mutual exclusion primitive useful for protecting shared data
///
/// This mutex will block threads waiting for the lock to become available.
/// The mutex can be created via a [`new`] constructor. Each mutex has a
/// type parameter which represents the data that it is protecting. The data can
/// only be accessed through the guards returned from [`lock`] and
/// [`try_lock`], which guarantees that the data is only ever accessed when the
/// mutex is locked.
///
/// [`new`]: Self::new
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
///
/// # Examples
///
/// ```ignore
/// use alloc::sync::Arc;
/// use kestrel::sync::Mutex;
/// use kestrel::thread;
///
/// const N: usize = 10;
///
/// // Spawn a few threads to increment a shared variable (non-atomically).
/// let data = Arc::new(Mutex::new(0));
///
/// for _ in 0..N {
///     let data = Arc::clone(&data);
///     thread::ThreadBuilder::new("work").spawn(move || {
///         let mut data = data.lock();
///         *data += 1;
///         data.unlock();
///     });
/// }
/// ```
pub struct Mutex<T: ?Sized> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> Mutex<T> {
        Mutex {
            raw: RawMutex::new(),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires a mutex, blocking the current thread until it is able to do
    /// so.
    ///
    /// Upon returning, the thread is the only thread with the lock held. The
    /// lock is released when the returned guard goes out of scope.
    ///
    /// # Panics
    /// Panics if called from interrupt context or by the owner.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        sched::assert_thread_context();
        self.raw.lock();
        MutexGuard::new(self)
    }

    /// Attempts to acquire this lock.
    ///
    /// This function does not block.
    ///
    /// # Errors
    ///
    /// If the mutex could not be acquired because it is already locked, then
    /// this call will return the [`WouldBlock`] error.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, WouldBlock> {
        self.raw.try_lock().map(|_| MutexGuard::new(self))
    }

    /// Acquires the mutex, giving up after `ticks` clock ticks.
    ///
    /// # Errors
    /// [`KernelError::TimedOut`] if the mutex stayed locked.
    pub fn lock_timeout(&self, ticks: u64) -> Result<MutexGuard<'_, T>, KernelError> {
        sched::assert_thread_context();
        self.raw.lock_timeout(ticks)?;
        Ok(MutexGuard::new(self))
    }

    /// Whether the mutex is currently held.
    pub fn is_locked(&self) -> bool {
        self.raw.owner().is_some()
    }
}

impl<T: Default> Default for Mutex<T> {
    /// Creates a `Mutex<T>`, with the `Default` value for T.
    fn default() -> Mutex<T> {
        Mutex::new(Default::default())
    }
}

/// An implementation of a "scoped lock" of a mutex. When this structure is
/// dropped (falls out of scope), the lock will be unlocked.
///
/// The data protected by the mutex can be accessed through this guard.
///
/// This structure is created by the [`lock`] and [`try_lock`] methods on
/// [`Mutex`].
///
/// [`lock`]: Mutex::lock
/// [`try_lock`]: Mutex::try_lock
pub struct MutexGuard<'a, T: ?Sized + 'a> {
    lock: &'a Mutex<T>,
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for MutexGuard<'_, T> {}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    fn new(lock: &'a Mutex<T>) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }

    /// The mutex this guard locks.
    pub fn mutex(&self) -> &'a Mutex<T> {
        self.lock
    }

    /// Releases the underlying [`Mutex`].
    ///
    /// Same as dropping the guard, spelled out.
    pub fn unlock(self) {
        drop(self);
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}

impl<T: ?Sized> Release for MutexGuard<'_, T> {
    fn release(self) {
        self.unlock();
    }
}
