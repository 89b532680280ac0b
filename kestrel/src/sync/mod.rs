//! # Synchronization Primitives.
//!
//! The kernel coordinates access to shared state among threads running in
//! parallel on every processor with two families of primitives.
//!
//! - [`SpinLock`] busy-waits and disables interrupts on the holding
//!   processor. It is the only lock usable from interrupt context, and the
//!   only one the scheduler itself takes.
//! - Every other primitive **sleeps**, and is built on a single one, the
//!   [`WaitQueue`]:
//!   - [`Mutex`]: exclusive access to shared data.
//!   - [`ConditionVariable`]: waiting for a predicate on data guarded by a
//!     [`Mutex`].
//!   - [`Semaphore`]: a counted resource.
//!
//! | Primitive             | Blocks Thread? | Fair?    | Typical Use Case                                   |
//! |-----------------------|----------------|----------|----------------------------------------------------|
//! | [`SpinLock`]          | No (busy wait) | No       | Short critical sections, shared with interrupts    |
//! | [`WaitQueue`]         | Yes            | FIFO     | Sleeping until an event, with timeout              |
//! | [`Mutex`]             | Yes            | No       | Exclusive access to shared data                    |
//! | [`ConditionVariable`] | Yes            | FIFO     | Waiting for a condition to become true             |
//! | [`Semaphore`]         | Yes            | FIFO     | Limiting access to a bounded resource              |
//!
//! Sleeping primitives must only be used from thread context; interrupt
//! handlers may wake threads through an [`IrqContext`] but never sleep.
//!
//! [`IrqContext`]: crate::interrupt::IrqContext

pub mod condition_variable;
pub mod mutex;
pub mod semaphore;
pub mod waitq;

pub use abyss::spinlock::{SpinLock, SpinLockGuard, WouldBlock};
pub use condition_variable::*;
pub use mutex::*;
pub use semaphore::*;
pub use waitq::{SleepResult, WaitQueue, WaitQueueGuard};

/// A lock a sleeping thread gives up once its wait queue is locked.
///
/// See [`WaitQueue::sleep_releasing`].
pub trait Release {
    /// Releases the lock.
    fn release(self);
}

impl Release for () {
    fn release(self) {}
}

impl<T: ?Sized> Release for SpinLockGuard<'_, T> {
    fn release(self) {
        self.unlock();
    }
}
