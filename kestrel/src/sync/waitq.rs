//! # Wait queue.
//!
//! A [`WaitQueue`] is a FIFO of sleeping threads plus a counter of *missed
//! wakeups*: a wakeup that finds nobody to wake is remembered, and the next
//! sleep consumes it instead of blocking. Every blocking primitive of the
//! kernel is built on it.
//!
//! A sleep ends in exactly one of three ways, reported as a
//! [`SleepResult`]:
//! - [`SleepResult::Woken`] by [`WaitQueue::wakeup_one`] or
//!   [`WaitQueue::wakeup_all`],
//! - [`SleepResult::TimedOut`] when the optional timeout expires first,
//! - [`SleepResult::Interrupted`] when the thread is interrupted during an
//!   interruptible sleep.
//!
//! Whoever ends a sleep first unlinks the thread from the queue while
//! holding the queue lock, which is what makes the three outcomes mutually
//! exclusive.
//!
//! ## Sleeping on a condition
//!
//! To avoid losing a wakeup between checking a condition and going to sleep,
//! check the condition while holding the queue lock and sleep through the
//! guard. The lock is only released once the thread is off its processor:
//!
//! ```ignore
//! loop {
//!     let guard = queue.lock();
//!     if ready.load(Ordering::Acquire) {
//!         guard.unlock();
//!         break;
//!     }
//!     guard.sleep(None, false);
//! }
//! ```
//!
//! The same goes for a lock that protects the condition: pass it to
//! [`WaitQueue::sleep_releasing`], which releases it after the queue lock was
//! taken.
use super::Release;
use crate::{
    Kernel,
    cpu::Cpu,
    sched::{self, Leave, Wake},
    thread::{Membership, SleepState, Thread, ThreadHandle, ThreadState},
    timer::Expiry,
};
use abyss::{
    WouldBlock,
    platform::platform,
    spinlock::{SpinLock, SpinLockGuard},
};
use alloc::collections::VecDeque;
use core::sync::atomic::Ordering;

/// How a sleep ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SleepResult {
    /// Woken by a wakeup, or a missed wakeup was consumed.
    Woken,
    /// The timeout expired first.
    TimedOut,
    /// The thread was interrupted.
    Interrupted,
}

pub(crate) struct Waiters {
    sleepers: VecDeque<ThreadHandle>,
    missed: usize,
}

/// A FIFO of sleeping threads.
pub struct WaitQueue {
    inner: SpinLock<Waiters>,
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    /// Creates an empty wait queue.
    pub const fn new() -> Self {
        Self::with_wakeups(0)
    }

    /// Creates a wait queue that remembers `missed` wakeups.
    pub const fn with_wakeups(missed: usize) -> Self {
        Self {
            inner: SpinLock::new(Waiters {
                sleepers: VecDeque::new(),
                missed,
            }),
        }
    }

    /// Locks the queue.
    #[track_caller]
    pub fn lock(&self) -> WaitQueueGuard<'_> {
        WaitQueueGuard {
            queue: self,
            waiters: self.inner.lock(),
        }
    }

    /// Sleeps until woken, for at most `timeout` ticks if given.
    ///
    /// If `interruptible`, [`JoinHandle::interrupt`] ends the sleep early.
    ///
    /// # Panics
    /// Panics if called from interrupt context, from an idle thread, or
    /// with preemption disabled.
    ///
    /// [`JoinHandle::interrupt`]: crate::thread::JoinHandle::interrupt
    pub fn sleep(&self, timeout: Option<u64>, interruptible: bool) -> SleepResult {
        self.lock().sleep(timeout, interruptible)
    }

    /// Like [`sleep`](Self::sleep), releasing `lock` once the queue is
    /// locked.
    pub fn sleep_releasing<R: Release>(
        &self,
        lock: R,
        timeout: Option<u64>,
        interruptible: bool,
    ) -> SleepResult {
        self.lock().sleep_releasing(lock, timeout, interruptible)
    }

    /// Consumes a missed wakeup without blocking.
    ///
    /// # Errors
    /// [`WouldBlock`] if no wakeup was missed.
    pub fn try_sleep(&self) -> Result<(), WouldBlock> {
        let mut guard = self.lock();
        if guard.waiters.missed > 0 {
            guard.waiters.missed -= 1;
            Ok(())
        } else {
            Err(WouldBlock)
        }
    }

    /// Wakes the oldest sleeper, or remembers the wakeup if there is none.
    ///
    /// Returns whether a thread was woken.
    pub fn wakeup_one(&self) -> bool {
        self.lock().wakeup_one()
    }

    /// Wakes every sleeper in FIFO order. Returns the number of threads
    /// woken.
    pub fn wakeup_all(&self) -> usize {
        self.lock().wakeup_all()
    }

    /// Number of sleeping threads.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no thread sleeps in this queue.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of remembered wakeups.
    pub fn missed_wakeups(&self) -> usize {
        self.lock().missed_wakeups()
    }
}

/// A locked [`WaitQueue`].
///
/// Dropping the guard unlocks the queue.
pub struct WaitQueueGuard<'a> {
    queue: &'a WaitQueue,
    waiters: SpinLockGuard<'a, Waiters>,
}

impl WaitQueueGuard<'_> {
    /// Releases the queue.
    pub fn unlock(self) {
        self.waiters.unlock();
    }

    /// Number of sleeping threads.
    pub fn len(&self) -> usize {
        self.waiters.sleepers.len()
    }

    /// Whether no thread sleeps in this queue.
    pub fn is_empty(&self) -> bool {
        self.waiters.sleepers.is_empty()
    }

    /// Number of remembered wakeups.
    pub fn missed_wakeups(&self) -> usize {
        self.waiters.missed
    }

    /// Forgets every remembered wakeup, so that the next sleep blocks.
    pub fn clear_missed(&mut self) {
        self.waiters.missed = 0;
    }

    /// Sleeps on the locked queue, which is unlocked once the current thread
    /// is off its processor.
    ///
    /// See [`WaitQueue::sleep`].
    pub fn sleep(self, timeout: Option<u64>, interruptible: bool) -> SleepResult {
        self.sleep_releasing((), timeout, interruptible)
    }

    /// Releases `lock`, then sleeps on the locked queue.
    ///
    /// See [`WaitQueue::sleep`].
    pub fn sleep_releasing<R: Release>(
        mut self,
        lock: R,
        timeout: Option<u64>,
        interruptible: bool,
    ) -> SleepResult {
        lock.release();

        sched::assert_can_block();
        let cpu = Cpu::current();
        let kernel = cpu.kernel();
        let handle = cpu.current_thread();
        let thread = kernel.threads.get(handle);

        let mut sleep = thread.sleep.lock();
        if interruptible && sleep.interrupted {
            return SleepResult::Interrupted;
        }
        if self.waiters.missed > 0 {
            self.waiters.missed -= 1;
            return SleepResult::Woken;
        }
        if timeout == Some(0) {
            return SleepResult::TimedOut;
        }

        self.waiters.sleepers.push_back(handle);
        thread.link(Membership::WaitQueue);
        sleep.queue = self.queue as *const WaitQueue;
        sleep.interruptible = interruptible;
        sleep.epoch = sleep.epoch.wrapping_add(1);
        sleep.outcome = None;
        if let Some(ticks) = timeout {
            thread.pending_timeouts.fetch_add(1, Ordering::AcqRel);
            let deadline = cpu.ticks.load(Ordering::Acquire) + ticks;
            let id = cpu.timeouts.lock().register(
                deadline,
                Expiry::Sleep {
                    thread: handle,
                    epoch: sleep.epoch,
                },
            );
            sleep.timeout = Some((cpu.id, id));
        }
        thread.transition(ThreadState::Running, ThreadState::Sleeping);
        sleep.unlock();

        let (held, irq) = self.waiters.into_held();
        sched::switch_away(Leave::Sleep(held));

        let mut sleep = thread.sleep.lock();
        let outcome = sleep.outcome.take();
        sleep.unlock();
        drop(irq);
        match outcome {
            Some(outcome) => outcome,
            None => panic!("Thread {} woke up without an outcome.", thread.tid),
        }
    }

    /// Wakes the oldest sleeper, or remembers the wakeup if there is none.
    pub fn wakeup_one(&mut self) -> bool {
        match self.waiters.sleepers.pop_front() {
            Some(handle) => {
                wake(Cpu::current().kernel(), handle);
                true
            }
            None => {
                self.waiters.missed += 1;
                false
            }
        }
    }

    /// Wakes every sleeper in FIFO order.
    pub fn wakeup_all(&mut self) -> usize {
        let mut count = 0;
        while let Some(handle) = self.waiters.sleepers.pop_front() {
            wake(Cpu::current().kernel(), handle);
            count += 1;
        }
        if count == 0 {
            self.waiters.missed += 1;
        }
        count
    }
}

/// Ends the sleep of a thread that was just taken off its queue.
fn finish_sleep(kernel: &Kernel, thread: &Thread, sleep: &mut SleepState, outcome: SleepResult) {
    thread.unlink(Membership::WaitQueue);
    sleep.queue = core::ptr::null();
    sleep.outcome = Some(outcome);
    if let Some((cpu, id)) = sleep.timeout.take() {
        if kernel.cpus[cpu].timeouts.lock().cancel(id).is_some() {
            thread.pending_timeouts.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

fn wake(kernel: &'static Kernel, handle: ThreadHandle) {
    let thread = kernel.threads.get(handle);
    let mut sleep = thread.sleep.lock();
    finish_sleep(kernel, thread, &mut sleep, SleepResult::Woken);
    sleep.unlock();
    kernel.make_ready(handle, Wake::Woken);
}

/// Ends the sleep of `handle` from outside of its queue, provided it is
/// still in the sleep `matches` accepts.
///
/// The sleep state is locked before the queue here, so the queue is only
/// tried and the whole attempt starts over when it is busy.
fn cancel_sleep(
    kernel: &'static Kernel,
    handle: ThreadHandle,
    outcome: SleepResult,
    mut matches: impl FnMut(&mut SleepState) -> bool,
) -> bool {
    let thread = kernel.threads.get(handle);
    loop {
        let mut sleep = thread.sleep.lock();
        if !matches(&mut sleep) || sleep.outcome.is_some() || sleep.queue.is_null() {
            return false;
        }
        // Safety: the thread is linked in the queue, which outlives its
        // sleepers.
        let queue = unsafe { &*sleep.queue };
        let Ok(mut waiters) = queue.inner.try_lock() else {
            sleep.unlock();
            platform().relax();
            continue;
        };
        let Some(pos) = waiters.sleepers.iter().position(|&th| th == handle) else {
            panic!("Thread {} sleeps on a queue it is not linked in.", thread.tid);
        };
        waiters.sleepers.remove(pos);
        finish_sleep(kernel, thread, &mut sleep, outcome);
        waiters.unlock();
        sleep.unlock();
        kernel.make_ready(handle, Wake::Woken);
        return true;
    }
}

/// Timeout of the sleep `epoch` of `handle` expired.
pub(crate) fn expire(kernel: &'static Kernel, handle: ThreadHandle, epoch: u64) {
    cancel_sleep(kernel, handle, SleepResult::TimedOut, |sleep| {
        if sleep.epoch != epoch {
            return false;
        }
        // This is the timeout being fired; nothing to disarm.
        sleep.timeout = None;
        true
    });
    let thread = kernel.threads.get(handle);
    thread.pending_timeouts.fetch_sub(1, Ordering::AcqRel);
}

/// Interrupts `handle`, ending its current interruptible sleep.
pub(crate) fn interrupt(kernel: &'static Kernel, handle: ThreadHandle) -> bool {
    cancel_sleep(kernel, handle, SleepResult::Interrupted, |sleep| {
        sleep.interrupted = true;
        sleep.interruptible
    })
}
