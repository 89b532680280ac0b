//! # Semaphore.
//!
//! A **semaphore** regulates concurrent access to a finite set of resources.
//! It maintains a count of available "permits"; each permit grants a thread
//! the right to access the shared resource.
//!
//! The permit count is the missed wakeup counter of a [`WaitQueue`]: taking a
//! permit is a sleep that consumes a missed wakeup when one is available, and
//! returning a permit is a wakeup that either hands it to the oldest sleeper
//! or is remembered for the next thread that asks.
//!
//! A semaphore initialized with zero permits serves as an event signal:
//!
//! ```ignore
//! let done = Semaphore::new(0, ());
//! // waiter
//! core::mem::forget(done.down());
//! // notifier
//! done.up();
//! ```
//!
//! Permits are returned by dropping the [`SemaphorePermits`] guard.
use super::{SleepResult, WaitQueue, WouldBlock};
use crate::{KernelError, sched};
use core::ops::Deref;

/// Counting semaphore.
///
/// A semaphore maintains a set of permits and resource. Permits are used to
/// synchronize access to a shared resource. A semaphore differs from a mutex in
/// that it can allow more than one concurrent caller to access the shared
/// resource at a time.
pub struct Semaphore<T> {
    waiters: WaitQueue,
    resource: T,
}

impl<T> Semaphore<T> {
    /// Creates a new semaphore initialized with `permits` permits guarding
    /// `resource`.
    pub const fn new(permits: usize, resource: T) -> Self {
        Self {
            waiters: WaitQueue::with_wakeups(permits),
            resource,
        }
    }

    /// Waits until a permit becomes available and then acquires it.
    ///
    /// The permit is released when the returned guard is dropped.
    pub fn down(&self) -> SemaphorePermits<'_, T> {
        sched::assert_thread_context();
        match self.waiters.sleep(None, false) {
            SleepResult::Woken => SemaphorePermits { sema: self },
            r => unreachable!("uninterruptible sleep without timeout ended with {r:?}"),
        }
    }

    /// Acquires a permit if one is available right now.
    ///
    /// # Errors
    /// [`WouldBlock`] if no permit is available.
    pub fn try_down(&self) -> Result<SemaphorePermits<'_, T>, WouldBlock> {
        self.waiters
            .try_sleep()
            .map(|_| SemaphorePermits { sema: self })
    }

    /// Like [`down`](Self::down), giving up after `ticks` clock ticks.
    ///
    /// # Errors
    /// [`KernelError::TimedOut`] if no permit became available in time.
    pub fn down_timeout(&self, ticks: u64) -> Result<SemaphorePermits<'_, T>, KernelError> {
        sched::assert_thread_context();
        match self.waiters.sleep(Some(ticks), false) {
            SleepResult::Woken => Ok(SemaphorePermits { sema: self }),
            SleepResult::TimedOut => Err(KernelError::TimedOut),
            SleepResult::Interrupted => Err(KernelError::Interrupted),
        }
    }

    /// Releases a permit back to the semaphore.
    ///
    /// Normally invoked by dropping a [`SemaphorePermits`]; call it directly
    /// only to signal an event.
    pub fn up(&self) {
        self.waiters.wakeup_one();
    }

    /// Permits available right now.
    pub fn available(&self) -> usize {
        self.waiters.missed_wakeups()
    }
}

/// An RAII implementation of a "scoped semaphore". When this structure
/// is dropped (falls out of scope), the semaphore will be signaled.
///
/// The data protected by the semaphore can be accessed through this guard via
/// its [`Deref`] implementations.
///
/// This structure is created by the [`down`] method on [`Semaphore`].
///
/// [`down`]: Semaphore::down
pub struct SemaphorePermits<'a, T> {
    sema: &'a Semaphore<T>,
}

impl<T> Deref for SemaphorePermits<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.sema.resource
    }
}

impl<T> Drop for SemaphorePermits<'_, T> {
    fn drop(&mut self) {
        self.sema.up()
    }
}
