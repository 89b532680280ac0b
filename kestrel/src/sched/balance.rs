//! Load balancing.
//!
//! Threads only ever move between processors by being *stolen*: the
//! processor that wants work takes a ready thread out of the run queue of a
//! busier one. Both run queues are locked for the move, lower processor id
//! first.
//!
//! Stealing happens in two places:
//! - an idle processor steals a single thread before it halts
//!   ([`balance_once`]),
//! - every processor runs a `kcpulb` thread that periodically evens out its
//!   load against the average ([`rebalance`]).
//!
//! Wired threads are never stolen, and neither is a thread that was stolen
//! and did not run since.
use super::runq::RunQueue;
use crate::{
    Kernel,
    cpu::Cpu,
    thread::{Current, Membership, ThreadFlags, ThreadHandle},
};
use abyss::spinlock::SpinLockGuard;
use core::sync::atomic::Ordering;

fn stealable(kernel: &Kernel, handle: ThreadHandle) -> bool {
    let thread = kernel.threads.get(handle);
    !thread
        .flags()
        .intersects(ThreadFlags::WIRED | ThreadFlags::STOLEN | ThreadFlags::IDLE)
        && thread.wired().is_none()
}

/// Locks the run queues of `a` and `b` in processor id order.
fn lock_pair<'a>(
    a: &'a Cpu,
    b: &'a Cpu,
) -> (SpinLockGuard<'a, RunQueue>, SpinLockGuard<'a, RunQueue>) {
    assert_ne!(a.id, b.id, "cpu{} steals from itself", a.id);
    if a.id < b.id {
        let ga = a.runq.lock();
        let gb = b.runq.lock();
        (ga, gb)
    } else {
        let gb = b.runq.lock();
        let ga = a.runq.lock();
        (ga, gb)
    }
}

/// Moves one thread from `victim` to `thief`, from `level` only if given.
fn steal(kernel: &Kernel, thief: &Cpu, victim: &Cpu, level: Option<usize>) -> bool {
    let (mut ours, mut theirs) = lock_pair(thief, victim);
    let found = match level {
        Some(level) => theirs
            .steal_at(level, |th| stealable(kernel, th))
            .map(|th| (level, th)),
        None => theirs.steal(|th| stealable(kernel, th)),
    };
    let Some((level, handle)) = found else {
        return false;
    };
    let thread = kernel.threads.get(handle);
    thread.relink(Membership::Ready(victim.id), Membership::Ready(thief.id));
    thread.set_flags(ThreadFlags::STOLEN);
    thread.set_last_cpu(thief.id);
    ours.push(level, handle);
    victim.nrdy.fetch_sub(1, Ordering::AcqRel);
    thief.nrdy.fetch_add(1, Ordering::AcqRel);
    drop(theirs);
    drop(ours);

    thief.counters.steals.fetch_add(1, Ordering::Relaxed);
    thief.counters.migrations_in.fetch_add(1, Ordering::Relaxed);
    victim.counters.migrations_out.fetch_add(1, Ordering::Relaxed);
    #[cfg(feature = "kcpulb_verbose")]
    debug!(
        "kcpulb{}: stole thread {} ({}) from cpu{} at level {}",
        thief.id, thread.tid, thread.name, victim.id, level
    );
    true
}

/// Steals a single thread for `thief` from the first online processor that
/// has one to spare.
pub(crate) fn balance_once(kernel: &Kernel, thief: &Cpu) -> bool {
    let n = kernel.cpus.len();
    (1..n)
        .map(|off| &*kernel.cpus[(thief.id + off) % n])
        .filter(|victim| victim.is_online() && victim.nrdy.load(Ordering::Acquire) > 0)
        .any(|victim| steal(kernel, thief, victim, None))
}

/// Steals threads for `me` until it holds its share of the ready threads of
/// all online processors.
///
/// Levels are scanned from the least urgent one, and victims starting from
/// `rotor`. Only processors above the average are robbed. Returns the
/// number of threads moved.
pub(crate) fn rebalance(kernel: &Kernel, me: &Cpu, rotor: usize) -> usize {
    let online = kernel.cpus.iter().filter(|cpu| cpu.is_online());
    let (count, total) = online.fold((0, 0), |(count, total), cpu| {
        (count + 1, total + cpu.nrdy.load(Ordering::Acquire))
    });
    if count == 0 {
        return 0;
    }
    let average = total / count + 1;
    let own = me.nrdy.load(Ordering::Acquire);
    if own >= average {
        return 0;
    }

    let mut wanted = average - own;
    let mut moved = 0;
    let n = kernel.cpus.len();
    for level in (0..kernel.config().ready_queues).rev() {
        for off in 0..n {
            let victim = &kernel.cpus[(rotor + off) % n];
            if victim.id == me.id || !victim.is_online() {
                continue;
            }
            while wanted > 0
                && victim.nrdy.load(Ordering::Acquire) > average
                && steal(kernel, me, victim, Some(level))
            {
                wanted -= 1;
                moved += 1;
            }
            if wanted == 0 {
                return moved;
            }
        }
    }
    moved
}

/// Body of the `kcpulb` thread of processor `cpu`.
pub(crate) fn kcpulb(kernel: &'static Kernel, cpu: usize) {
    let me = &kernel.cpus[cpu];
    let mut rotor = cpu;
    loop {
        Current::sleep(kernel.config().balance_interval);
        rotor = (rotor + 1) % kernel.cpus.len();
        let moved = rebalance(kernel, me, rotor);
        #[cfg(feature = "kcpulb_verbose")]
        if moved > 0 {
            debug!("kcpulb{}: moved {} threads", cpu, moved);
        }
        #[cfg(not(feature = "kcpulb_verbose"))]
        let _ = moved;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Config,
        thread::{Blueprint, ThreadState},
    };
    use alloc::{boxed::Box, string::String, vec::Vec};

    fn kernel(cpus: usize) -> &'static Kernel {
        let kernel = Kernel::new(Config::new().cpus(cpus).load_balancer(false, 100), ())
            .expect("valid config");
        for cpu in kernel.cpus.iter() {
            cpu.online.store(true, Ordering::Release);
        }
        kernel
    }

    fn enqueue(kernel: &Kernel, cpu: usize, level: usize, flags: ThreadFlags) -> ThreadHandle {
        let wired = flags.contains(ThreadFlags::WIRED).then_some(cpu);
        let (handle, _) = kernel
            .create_thread(
                Blueprint {
                    name: String::from("test"),
                    task: kernel.kernel_task().clone(),
                    priority: level,
                    flags,
                    wired,
                    entry: Some(Box::new(|| ())),
                },
                false,
            )
            .expect("room in the table");
        let thread = kernel.threads.get(handle);
        thread.transition(ThreadState::Entering, ThreadState::Ready);
        let target = &kernel.cpus[cpu];
        target.runq.lock().push(level, handle);
        thread.link(Membership::Ready(cpu));
        target.nrdy.fetch_add(1, Ordering::AcqRel);
        handle
    }

    fn ready_on(kernel: &Kernel, cpu: usize) -> usize {
        kernel.cpus[cpu].nrdy.load(Ordering::Acquire)
    }

    #[test]
    fn idle_steal_moves_exactly_one() {
        let kernel = kernel(2);
        for _ in 0..5 {
            enqueue(kernel, 0, 3, ThreadFlags::empty());
        }
        assert!(balance_once(kernel, &kernel.cpus[1]));
        assert_eq!(ready_on(kernel, 0), 4);
        assert_eq!(ready_on(kernel, 1), 1);
        assert_eq!(kernel.cpus[1].runq.lock().len(), 1);
        assert_eq!(kernel.cpus[1].counters.steals.load(Ordering::Relaxed), 1);
        assert_eq!(
            kernel.cpus[0].counters.migrations_out.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn stolen_thread_is_marked_and_relinked() {
        let kernel = kernel(2);
        let first = enqueue(kernel, 0, 1, ThreadFlags::empty());
        let last = enqueue(kernel, 0, 4, ThreadFlags::empty());
        assert!(balance_once(kernel, &kernel.cpus[1]));

        // The least urgent thread goes first.
        let thread = kernel.threads.get(last);
        assert!(thread.flags().contains(ThreadFlags::STOLEN));
        assert_eq!(thread.membership(), Membership::Ready(1));
        assert_eq!(thread.last_cpu(), Some(1));
        assert_eq!(kernel.threads.get(first).membership(), Membership::Ready(0));

        // A stolen thread that did not run yet stays put.
        assert!(!balance_once(kernel, &kernel.cpus[0]));
    }

    #[test]
    fn wired_threads_are_never_stolen() {
        let kernel = kernel(2);
        for _ in 0..3 {
            enqueue(kernel, 0, 2, ThreadFlags::WIRED);
        }
        assert!(!balance_once(kernel, &kernel.cpus[1]));
        assert_eq!(rebalance(kernel, &kernel.cpus[1], 0), 0);
        assert_eq!(ready_on(kernel, 0), 3);
    }

    #[test]
    fn rebalance_evens_out_against_the_average() {
        let kernel = kernel(2);
        for level in [0, 1, 2, 3, 4] {
            enqueue(kernel, 0, level, ThreadFlags::empty());
        }
        assert_eq!(rebalance(kernel, &kernel.cpus[1], 0), 2);
        assert_eq!(ready_on(kernel, 0), 3);
        assert_eq!(ready_on(kernel, 1), 2);

        // Least urgent levels were robbed first.
        let rq = kernel.cpus[1].runq.lock();
        let levels = (0..rq.levels())
            .filter(|&l| rq.level_len(l) > 0)
            .collect::<Vec<_>>();
        assert_eq!(levels, [3, 4]);
    }

    #[test]
    fn offline_processors_are_left_alone() {
        let kernel = kernel(3);
        for _ in 0..6 {
            enqueue(kernel, 2, 5, ThreadFlags::empty());
        }
        kernel.cpus[2].online.store(false, Ordering::Release);
        assert!(!balance_once(kernel, &kernel.cpus[0]));
        assert_eq!(rebalance(kernel, &kernel.cpus[0], 0), 0);
    }
}
