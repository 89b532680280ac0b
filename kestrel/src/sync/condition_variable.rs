//! # Condition Variable.
//!
//! A **Condition Variable** allows a thread to efficiently block until a
//! certain condition is met, without consuming CPU cycles. It is always used
//! in conjunction with a [`Mutex`] that guards access to shared data.
//!
//! Waiting gives up the mutex and goes to sleep as a single step with respect
//! to [`signal`] and [`broadcast`]: the queue of the condition variable is
//! locked before the mutex is released, so a notification sent by the next
//! owner of the mutex always finds the waiter queued.
//!
//! A woken waiter has to take the mutex again before it returns, and another
//! thread may have changed the data in between. Always re-check the predicate
//! in a loop, or let [`ConditionVariable::wait_while`] do it:
//!
//! ```ignore
//! let guard = condvar.wait_while(&mutex, |state| state.is_empty());
//! ```
//!
//! [`signal`]: ConditionVariable::signal
//! [`broadcast`]: ConditionVariable::broadcast
use super::{
    SleepResult, WaitQueue,
    mutex::{Mutex, MutexGuard},
};
use crate::sched;

/// A Condition Variable
///
/// Condition variables represent the ability to block a thread such that it
/// consumes no CPU time while waiting for an event to occur. Condition
/// variables are typically associated with a boolean predicate (a condition)
/// and a mutex. The predicate is always verified inside of the mutex before
/// determining that a thread must block.
#[derive(Default)]
pub struct ConditionVariable {
    waiters: WaitQueue,
}

impl ConditionVariable {
    /// Creates a new condition variable which is ready to be waited on and
    /// signaled.
    pub const fn new() -> Self {
        Self {
            waiters: WaitQueue::new(),
        }
    }

    /// Releases `guard`, sleeps until notified and locks the mutex again.
    ///
    /// Spurious wakeups are possible.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.wait_timeout(guard, None).0
    }

    /// Like [`wait`](Self::wait), for at most `ticks` clock ticks if given.
    pub fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        ticks: Option<u64>,
    ) -> (MutexGuard<'a, T>, SleepResult) {
        sched::assert_thread_context();
        let mutex = guard.mutex();
        let mut waiters = self.waiters.lock();
        // Notifications are not buffered.
        waiters.clear_missed();
        let result = waiters.sleep_releasing(guard, ticks, false);
        (mutex.lock(), result)
    }

    /// Blocks the current thread while `predicate` returns `true`.
    ///
    /// This function takes reference of a [`Mutex`] and checks the
    /// predicate. If it returns `true`, the thread is blocked and the mutex is
    /// temporarily released. When the thread is signaled and wakes up, it
    /// reacquires the mutex and re-evaluates the predicate. This loop continues
    /// until the predicate returns `false`.
    pub fn wait_while<'a, T>(
        &self,
        mutex: &'a Mutex<T>,
        mut predicate: impl FnMut(&mut T) -> bool,
    ) -> MutexGuard<'a, T> {
        let mut guard = mutex.lock();
        while predicate(&mut guard) {
            guard = self.wait(guard);
        }
        guard
    }

    /// Wakes up one blocked thread on this condvar, then releases `guard`.
    ///
    /// Calls to `signal` are not buffered in any way.
    pub fn signal<T>(&self, guard: MutexGuard<'_, T>) {
        self.waiters.wakeup_one();
        guard.unlock();
    }

    /// Wakes up all blocked threads on this condvar, then releases `guard`.
    pub fn broadcast<T>(&self, guard: MutexGuard<'_, T>) {
        self.waiters.wakeup_all();
        guard.unlock();
    }

    /// Number of threads waiting.
    pub fn waiters(&self) -> usize {
        self.waiters.len()
    }
}
