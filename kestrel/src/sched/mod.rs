//! Thread scheduler.
//!
//! Every processor schedules its own threads from its own `RunQueue`, a
//! multi-level feedback queue: level 0 is the most urgent and every level is
//! served in FIFO order. The scheduler is entered whenever the running
//! thread yields, sleeps, exits or is preempted, and does the following:
//!
//! 1. A preempted or yielding thread is put back behind the threads of its
//!    level. One that used up its quantum is demoted one level first.
//! 2. The oldest thread of the most urgent level is dispatched, or the idle
//!    thread if the queue is empty. A preempted thread keeps the processor if
//!    nothing at least as urgent waits and its quantum is not used up.
//! 3. Every `aging_period` ticks the levels below the dispatched one are
//!    promoted by `aging_step`, so that a stream of urgent threads never
//!    starves the rest.
//! 4. Switching to a thread of another task switches the address space
//!    through [`Hooks::as_switch`].
//!
//! The outgoing thread is only put back into a run queue, or its wait queue
//! released, once its context was saved: the incoming thread does it in
//! [`finish_switch`], right after it resumed.
//!
//! [`Hooks::as_switch`]: crate::task::Hooks::as_switch
pub(crate) mod balance;
pub(crate) mod runq;

use crate::{
    cpu::{Cpu, IDLE_PRIORITY, current_handle},
    thread::{Membership, ThreadFlags, ThreadHandle, ThreadState},
};
use abyss::{
    interrupt::InterruptGuard,
    platform::{platform, switch_context},
    spinlock::HeldLock,
};
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

/// Why the running thread leaves its processor.
pub(crate) enum Leave {
    /// Its quantum ran out, or a more urgent thread became ready.
    Preempt,
    /// It asked to.
    Yield,
    /// It sleeps in the wait queue whose lock is handed over.
    Sleep(HeldLock),
    /// It exited.
    Exit,
}

/// Why a thread is put in a run queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Wake {
    /// First start.
    Spawned,
    /// End of a sleep.
    Woken,
    /// Came off its processor while still runnable.
    Preempted,
}

enum Action {
    Requeue,
    Release(HeldLock),
    Reap,
    Idle,
}

/// What the incoming thread owes the outgoing one.
pub(crate) struct Handoff {
    prev: ThreadHandle,
    action: Action,
}

/// Takes the running thread off the processor and runs the next one.
///
/// Returns when the thread is dispatched again, possibly on another
/// processor. A thread that exits never returns.
pub(crate) fn switch_away(leave: Leave) {
    let _irq = InterruptGuard::new();
    let cpu = Cpu::current();
    let kernel = cpu.kernel();
    let config = kernel.config();
    let prev_handle = cpu.current_thread();
    let prev = kernel.threads.get(prev_handle);
    cpu.need_resched.store(false, Ordering::Release);

    let runnable = matches!(leave, Leave::Preempt | Leave::Yield) && !prev.is_idle();
    let mut rq = cpu.runq.lock();
    if runnable {
        let mut level = prev.priority();
        if prev.ticks_left() == 0 && level + 1 < config.ready_queues {
            level += 1;
            prev.set_priority(level);
        }
        let keep = match rq.highest() {
            None => true,
            Some(best) => {
                best > level
                    || (best == level
                        && matches!(leave, Leave::Preempt)
                        && prev.ticks_left() > 0)
            }
        };
        if keep {
            if prev.ticks_left() == 0 {
                prev.refill(config.quantum(level));
            }
            cpu.current_priority.store(level, Ordering::Release);
            rq.unlock();
            return;
        }
    }

    let (next_handle, next_level) = match rq.pop() {
        Some((level, handle)) => {
            cpu.nrdy.fetch_sub(1, Ordering::AcqRel);
            kernel
                .threads
                .get(handle)
                .unlink(Membership::Ready(cpu.id));
            (handle, level)
        }
        None if cpu.idle_thread() == prev_handle => {
            rq.unlock();
            return;
        }
        None => (cpu.idle_thread(), IDLE_PRIORITY),
    };

    if next_level != IDLE_PRIORITY {
        while cpu.relink_ticks.load(Ordering::Acquire) >= config.aging_period {
            cpu.relink_ticks
                .fetch_sub(config.aging_period, Ordering::AcqRel);
            rq.age(next_level, config.aging_step);
            cpu.counters.relinks.fetch_add(1, Ordering::Relaxed);
        }
    }

    let next = kernel.threads.get(next_handle);
    next.transition(ThreadState::Ready, ThreadState::Running);
    if !next.is_idle() {
        next.set_priority(next_level);
        next.refill(config.quantum(next_level));
    }
    next.clear_flags(ThreadFlags::STOLEN);
    next.set_last_cpu(cpu.id);
    cpu.set_current(next_handle, next_level);
    #[cfg(feature = "scheduler_verbose")]
    let ready = rq.len();
    rq.unlock();

    let preempted = matches!(leave, Leave::Preempt);
    let action = match leave {
        Leave::Preempt | Leave::Yield => {
            prev.transition(ThreadState::Running, ThreadState::Ready);
            if prev.is_idle() {
                Action::Idle
            } else {
                Action::Requeue
            }
        }
        Leave::Sleep(held) => Action::Release(held),
        Leave::Exit => Action::Reap,
    };

    let hooks = kernel.hooks();
    if !Arc::ptr_eq(&prev.task, &next.task) {
        hooks.as_switch(prev.task.address_space(), next.task.address_space());
        hooks.before_task_runs(&next.task);
    }
    hooks.before_thread_runs(next.tid, cpu.id);

    cpu.counters.context_switches.fetch_add(1, Ordering::Relaxed);
    if preempted {
        cpu.counters.preemptions.fetch_add(1, Ordering::Relaxed);
    }

    #[cfg(feature = "scheduler_verbose")]
    debug!(
        "cpu{}: {} ({}) -> {} ({}) at level {}, {} ready",
        cpu.id, prev.tid, prev.name, next.tid, next.name, next_level, ready
    );

    let mut handoff = cpu.handoff.lock();
    assert!(
        handoff.is_none(),
        "cpu{} switches away before the last switch was finished",
        cpu.id
    );
    *handoff = Some(Handoff {
        prev: prev_handle,
        action,
    });
    handoff.unlock();

    // Safety: `prev` is the running flow and `next` is dispatched nowhere
    // else: it was just taken out of this processor's run queue.
    unsafe { switch_context(&mut *prev.context(), &*next.context()) };
    finish_switch();
}

/// Completes the switch that resumed the calling thread on behalf of the
/// thread that left the processor.
///
/// Must run with interrupts disabled, first thing after a switch.
pub(crate) fn finish_switch() {
    let cpu = Cpu::current();
    let kernel = cpu.kernel();
    let taken = {
        let mut handoff = cpu.handoff.lock();
        let taken = handoff.take();
        handoff.unlock();
        taken
    };
    let Some(Handoff { prev, action }) = taken else {
        return;
    };
    kernel
        .hooks()
        .after_thread_ran(kernel.threads.get(prev).tid, cpu.id);
    match action {
        Action::Requeue => kernel.make_ready(prev, Wake::Preempted),
        // Safety: the queue outlives its sleepers, and `prev` sleeps in it.
        Action::Release(held) => unsafe { held.release() },
        Action::Reap => kernel.reap(prev),
        Action::Idle => (),
    }
}

/// Preempts the running thread if a reschedule is pending and allowed.
///
/// `allowed_depth` is the number of interrupt guards the caller itself
/// holds; a thread that holds more is inside a critical section.
pub(crate) fn preempt_check(allowed_depth: isize) {
    if InterruptGuard::depth() != allowed_depth {
        return;
    }
    let _irq = InterruptGuard::new();
    let Some(cpu) = Cpu::try_current() else {
        return;
    };
    if !cpu.need_resched.load(Ordering::Acquire) || cpu.in_interrupt() {
        return;
    }
    let Some(current) = cpu.try_current_thread() else {
        return;
    };
    let thread = cpu.kernel().threads.get(current);
    if thread.preempt_count.load(Ordering::Acquire) > 0 {
        return;
    }
    switch_away(Leave::Preempt);
}

/// Panics unless the caller is a thread outside of any interrupt handler.
#[track_caller]
pub(crate) fn assert_thread_context() {
    let _irq = InterruptGuard::new();
    let cpu = Cpu::current();
    assert!(
        !cpu.in_interrupt(),
        "cpu{}: blocking operation in interrupt context",
        cpu.id
    );
    assert!(
        cpu.try_current_thread().is_some(),
        "cpu{}: blocking operation before the processor was started",
        cpu.id
    );
}

/// Panics unless the calling thread may give up its processor to sleep.
#[track_caller]
pub(crate) fn assert_can_block() {
    assert_thread_context();
    let (kernel, handle) = current_handle();
    let thread = kernel.threads.get(handle);
    assert!(!thread.is_idle(), "Idle thread {} tried to sleep.", thread.tid);
    assert_eq!(
        thread.preempt_count.load(Ordering::Acquire),
        0,
        "Thread {} tried to sleep with preemption disabled.",
        thread.tid
    );
}

/// Gives the processor to the next ready thread of the same or a more
/// urgent level, if any.
#[track_caller]
pub(crate) fn yield_now() {
    assert_thread_context();
    assert_eq!(
        InterruptGuard::depth(),
        0,
        "Try to yield while holding a lock."
    );
    switch_away(Leave::Yield);
}

/// Leaves the processor for the last time.
pub(crate) fn exit(code: i32) -> ! {
    assert_thread_context();
    let (kernel, handle) = current_handle();
    let thread = kernel.threads.get(handle);
    assert!(!thread.is_idle(), "The idle thread {} exited.", thread.tid);

    // An expiring timeout may still look at the thread.
    while thread.pending_timeouts.load(Ordering::Acquire) > 0 {
        platform().relax();
    }
    thread.exit_code.store(code, Ordering::Release);

    let _irq = InterruptGuard::new();
    thread.transition(ThreadState::Running, ThreadState::Exiting);
    switch_away(Leave::Exit);
    unreachable!("Exited thread {} was dispatched again.", thread.tid)
}

/// The loop of every idle thread.
pub(crate) fn idle_loop() -> ! {
    let cpu = {
        let _irq = InterruptGuard::new();
        Cpu::current()
    };
    let kernel = cpu.kernel();
    loop {
        if cpu.nrdy.load(Ordering::Acquire) == 0 {
            balance::balance_once(kernel, cpu);
        }
        if cpu.nrdy.load(Ordering::Acquire) > 0 {
            switch_away(Leave::Yield);
        } else {
            platform().halt();
        }
    }
}
