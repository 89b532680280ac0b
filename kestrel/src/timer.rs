//! Clock ticks and timeouts.
//!
//! Every processor keeps its own queue of timeouts ordered by deadline. The
//! periodic clock interrupt advances the processor's tick counter, fires
//! the timeouts that expired, charges the tick to the running thread and
//! requests a reschedule when its quantum runs out.
//!
//! Timeout callbacks run in interrupt context and receive an
//! [`IrqContext`]:
//!
//! ```ignore
//! let queue = Arc::new(WaitQueue::new());
//! let q = queue.clone();
//! let timeout = timer::register(10, move |irq| {
//!     irq.wakeup_one(&q);
//! });
//! ```
use crate::{
    cpu::Cpu,
    interrupt::IrqContext,
    sched,
    sync::waitq,
    thread::{ThreadFlags, ThreadHandle},
};
use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};
use core::sync::atomic::Ordering;

/// Identifies a timeout inside the queue of its processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimeoutId {
    deadline: u64,
    seq: u64,
}

/// What happens when a timeout expires.
pub(crate) enum Expiry {
    /// Ends a timed sleep, unless the sleep of that epoch already ended.
    Sleep { thread: ThreadHandle, epoch: u64 },
    /// Calls a registered callback.
    Callback(Box<dyn FnOnce(&IrqContext) + Send>),
}

/// Pending timeouts of one processor.
#[derive(Default)]
pub(crate) struct TimeoutQueue {
    entries: BTreeMap<TimeoutId, Expiry>,
    seq: u64,
}

impl TimeoutQueue {
    pub(crate) const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            seq: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Arms `expiry` to fire once the tick counter reaches `deadline`.
    ///
    /// Timeouts with the same deadline fire in registration order.
    pub(crate) fn register(&mut self, deadline: u64, expiry: Expiry) -> TimeoutId {
        let id = TimeoutId {
            deadline,
            seq: self.seq,
        };
        self.seq += 1;
        self.entries.insert(id, expiry);
        id
    }

    /// Disarms a timeout. Returns None if it already fired.
    pub(crate) fn cancel(&mut self, id: TimeoutId) -> Option<Expiry> {
        self.entries.remove(&id)
    }

    /// Removes every timeout due at `now`, earliest first.
    pub(crate) fn expire(&mut self, now: u64) -> Vec<Expiry> {
        let mut fired = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().deadline > now {
                break;
            }
            fired.push(entry.remove());
        }
        fired
    }
}

/// A registered timeout.
///
/// Dropping it does not disarm it; see [`unregister`].
#[derive(Debug)]
#[must_use = "dropping a timeout does not disarm it"]
pub struct Timeout {
    cpu: usize,
    id: TimeoutId,
}

impl Timeout {
    /// Processor whose clock drives this timeout.
    pub fn cpu(&self) -> usize {
        self.cpu
    }
}

pub(crate) fn register_on(
    cpu: &Cpu,
    ticks: u64,
    f: Box<dyn FnOnce(&IrqContext) + Send>,
) -> Timeout {
    let deadline = cpu.ticks.load(Ordering::Acquire) + ticks;
    let id = cpu.timeouts.lock().register(deadline, Expiry::Callback(f));
    Timeout { cpu: cpu.id, id }
}

/// Calls `f` from the clock interrupt of the executing processor once
/// `ticks` ticks passed.
///
/// # Panics
/// Panics if the caller does not run on a kernel processor.
pub fn register<F>(ticks: u64, f: F) -> Timeout
where
    F: FnOnce(&IrqContext) + Send + 'static,
{
    let _guard = abyss::interrupt::InterruptGuard::new();
    register_on(Cpu::current(), ticks, Box::new(f))
}

/// Disarms `timeout`.
///
/// Returns false if the callback already ran or is running.
pub fn unregister(timeout: Timeout) -> bool {
    let kernel = Cpu::current().kernel();
    let cpu = &kernel.cpus[timeout.cpu];
    cpu.timeouts.lock().cancel(timeout.id).is_some()
}

/// Timer interrupt handler.
pub(crate) fn handle_tick() {
    {
        let cpu = Cpu::current();
        let kernel = cpu.kernel();
        let irq = IrqContext::enter(cpu);

        let now = cpu.ticks.fetch_add(1, Ordering::AcqRel) + 1;
        if cpu.id == 0 {
            kernel.jiffies.fetch_add(1, Ordering::AcqRel);
        }

        // Fired outside of the queue lock: expiries take other locks.
        let expired = cpu.timeouts.lock().expire(now);
        for expiry in expired {
            match expiry {
                Expiry::Sleep { thread, epoch } => waitq::expire(kernel, thread, epoch),
                Expiry::Callback(f) => f(&irq),
            }
        }

        let thread = kernel.threads.get(cpu.current_thread());
        if thread.flags().contains(ThreadFlags::IDLE) {
            cpu.counters.idle_ticks.fetch_add(1, Ordering::Relaxed);
        } else {
            cpu.counters.busy_ticks.fetch_add(1, Ordering::Relaxed);
            thread.ticks_used.fetch_add(1, Ordering::Relaxed);
            if !thread.flags().contains(ThreadFlags::UNCOUNTED) {
                thread.task.ticks.fetch_add(1, Ordering::Relaxed);
            }
            if thread.consume_tick() == 0 {
                cpu.need_resched.store(true, Ordering::Release);
            }
        }
        cpu.relink_ticks.fetch_add(1, Ordering::AcqRel);
    }
    sched::preempt_check(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper(epoch: u64) -> Expiry {
        Expiry::Sleep {
            thread: ThreadHandle::from_raw(0),
            epoch,
        }
    }

    fn epoch_of(expiry: &Expiry) -> u64 {
        match expiry {
            Expiry::Sleep { epoch, .. } => *epoch,
            Expiry::Callback(_) => u64::MAX,
        }
    }

    #[test]
    fn expires_in_deadline_order() {
        let mut queue = TimeoutQueue::new();
        queue.register(30, sleeper(3));
        queue.register(10, sleeper(1));
        queue.register(20, sleeper(2));
        queue.register(10, sleeper(4));

        assert!(queue.expire(9).is_empty());
        let fired = queue.expire(20);
        assert_eq!(fired.iter().map(epoch_of).collect::<Vec<_>>(), [1, 4, 2]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.expire(100).len(), 1);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn cancelled_timeout_never_fires() {
        let mut queue = TimeoutQueue::new();
        let a = queue.register(5, sleeper(1));
        let b = queue.register(5, Expiry::Callback(Box::new(|_| ())));
        assert!(queue.cancel(a).is_some());
        assert!(queue.cancel(a).is_none());
        let fired = queue.expire(5);
        assert_eq!(fired.len(), 1);
        assert!(matches!(fired[0], Expiry::Callback(_)));
        assert!(queue.cancel(b).is_none());
    }
}
