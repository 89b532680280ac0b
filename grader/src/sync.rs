//! Wait queues and the blocking primitives built on them.
use crate::{spin_for, wait_until};
use abyss::platform::platform;
use kestrel::{
    Kernel, KernelError,
    sync::{
        ConditionVariable, Mutex, RawMutex, Semaphore, SleepResult, WaitQueue, WouldBlock,
    },
    thread::{Current, JoinHandle, ThreadBuilder},
    timer,
};
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

fn join_all(handles: Vec<JoinHandle>) {
    for handle in handles {
        assert_eq!(handle.join(), Ok(0));
    }
}

/// Threads increment a counter under a mutex with a preemption point
/// between the read and the write.
pub fn mutex_exclusion(_kernel: &'static Kernel) {
    let counter = Arc::new(Mutex::new(0u64));
    let workers = (0..8)
        .map(|i| {
            let counter = counter.clone();
            ThreadBuilder::new(format!("inc{i}"))
                .spawn(move || {
                    for _ in 0..200 {
                        let mut guard = counter.lock();
                        let seen = *guard;
                        platform().relax();
                        *guard = seen + 1;
                        guard.unlock();
                    }
                })
                .expect("spawn")
        })
        .collect::<Vec<_>>();
    join_all(workers);

    let guard = counter.lock();
    assert_eq!(*guard, 1600);
    guard.unlock();
}

/// A held mutex fails `try_lock` and `lock_timeout`.
pub fn mutex_contention(_kernel: &'static Kernel) {
    let mutex = Arc::new(Mutex::new(()));
    let locked = Arc::new(Semaphore::new(0, ()));
    let holder = {
        let (mutex, locked) = (mutex.clone(), locked.clone());
        ThreadBuilder::new("holder")
            .spawn(move || {
                let guard = mutex.lock();
                locked.up();
                Current::sleep(30);
                guard.unlock();
            })
            .expect("spawn")
    };
    core::mem::forget(locked.down());

    assert!(mutex.is_locked());
    assert!(mutex.try_lock().is_err());
    assert!(matches!(mutex.lock_timeout(3), Err(KernelError::TimedOut)));

    let guard = mutex.lock();
    guard.unlock();
    assert_eq!(holder.join(), Ok(0));
    assert!(!mutex.is_locked());
}

/// Releasing a mutex held by another thread is fatal.
pub fn foreign_unlock(_kernel: &'static Kernel) {
    let mutex = Arc::new(RawMutex::new());
    let holder = {
        let mutex = mutex.clone();
        ThreadBuilder::new("holder")
            .spawn(move || mutex.lock())
            .expect("spawn")
    };
    assert_eq!(holder.join(), Ok(0));
    assert!(mutex.owner().is_some());
    mutex.unlock();
}

/// Sleepers are woken in the order they went to sleep.
pub fn waitq_fifo(kernel: &'static Kernel) {
    let queue = Arc::new(WaitQueue::new());
    let woken = Arc::new(Mutex::new(Vec::new()));
    let sleepers = (0..4)
        .map(|i| {
            let (q, w) = (queue.clone(), woken.clone());
            let handle = ThreadBuilder::new(format!("sleeper{i}"))
                .spawn(move || {
                    assert_eq!(q.sleep(None, false), SleepResult::Woken);
                    let mut woken = w.lock();
                    woken.push(i);
                    woken.unlock();
                })
                .expect("spawn");
            wait_until(kernel, 1000, "a sleeper to enqueue", || queue.len() == i + 1);
            handle
        })
        .collect::<Vec<_>>();

    for i in 0..4 {
        assert!(queue.wakeup_one());
        wait_until(kernel, 1000, "a sleeper to run", || {
            let woken = woken.lock();
            let n = woken.len();
            woken.unlock();
            n == i + 1
        });
        let woken = woken.lock();
        assert_eq!(woken[i], i);
        woken.unlock();
    }
    join_all(sleepers);
    assert_eq!(queue.missed_wakeups(), 0);
}

/// A wakeup that finds nobody is remembered for the next sleep.
pub fn missed_wakeup(_kernel: &'static Kernel) {
    let queue = WaitQueue::new();
    assert_eq!(queue.try_sleep(), Err(WouldBlock));
    assert!(!queue.wakeup_one());
    assert!(!queue.wakeup_one());
    assert_eq!(queue.missed_wakeups(), 2);
    assert_eq!(queue.sleep(None, false), SleepResult::Woken);
    assert_eq!(queue.try_sleep(), Ok(()));
    assert_eq!(queue.try_sleep(), Err(WouldBlock));

    assert_eq!(queue.wakeup_all(), 0);
    assert_eq!(queue.sleep(Some(1), true), SleepResult::Woken);
}

/// A sleep with a timeout nobody ends reports it.
pub fn sleep_timeout(kernel: &'static Kernel) {
    let queue = WaitQueue::new();
    let start = kernel.jiffies();
    assert_eq!(queue.sleep(Some(20), false), SleepResult::TimedOut);
    assert!(kernel.jiffies() > start);
    assert!(queue.is_empty());
    assert_eq!(queue.sleep(Some(0), false), SleepResult::TimedOut);

    // A wakeup before the timeout wins, and disarms it.
    let queue = Arc::new(WaitQueue::new());
    {
        let queue = queue.clone();
        ThreadBuilder::new("waker")
            .spawn(move || {
                while !queue.wakeup_one() {
                    Current::sleep(1);
                }
            })
            .expect("spawn")
            .detach();
    }
    assert_eq!(queue.sleep(Some(10_000), false), SleepResult::Woken);
    assert_eq!(queue.missed_wakeups(), 0);
}

/// Interruption ends interruptible sleeps only, and sticks.
pub fn interruption(kernel: &'static Kernel) {
    let queue = Arc::new(WaitQueue::new());
    let sleeper = {
        let queue = queue.clone();
        ThreadBuilder::new("sleeper")
            .spawn(move || {
                assert_eq!(queue.sleep(None, true), SleepResult::Interrupted);
                assert!(Current::is_interrupted());
                assert_eq!(queue.sleep(Some(1000), true), SleepResult::Interrupted);
                // Uninterruptible sleeps are not affected.
                assert_eq!(queue.sleep(Some(5), false), SleepResult::TimedOut);
            })
            .expect("spawn")
    };
    wait_until(kernel, 1000, "the sleeper to enqueue", || queue.len() == 1);
    assert!(sleeper.interrupt());
    assert_eq!(sleeper.join(), Ok(0));
    assert!(queue.is_empty());

    // An uninterruptible sleeper is left alone.
    let sleeper = {
        let queue = queue.clone();
        ThreadBuilder::new("stubborn")
            .spawn(move || assert_eq!(queue.sleep(None, false), SleepResult::Woken))
            .expect("spawn")
    };
    wait_until(kernel, 1000, "the sleeper to enqueue", || queue.len() == 1);
    assert!(!sleeper.interrupt());
    assert_eq!(queue.len(), 1);
    assert!(queue.wakeup_one());
    assert_eq!(sleeper.join(), Ok(0));
}

/// Wakeups, timeouts and interruptions race for the same sleepers. Every
/// sleep ends one way, and every wakeup either woke a sleep or is still
/// remembered by the queue.
pub fn sleep_outcome_race(kernel: &'static Kernel) {
    const SLEEPERS: usize = 6;
    const ROUNDS: usize = 200;
    let queue = Arc::new(WaitQueue::new());
    // Woken, timed out, interrupted.
    let tally = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)]);
    let calls = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    let sleepers = (0..SLEEPERS)
        .map(|i| {
            let (q, tally) = (queue.clone(), tally.clone());
            ThreadBuilder::new(format!("sleeper{i}"))
                .spawn(move || {
                    for k in 0..ROUNDS {
                        let interruptible = k % 2 == 0;
                        let ticks = 1 + ((i + k) % 3) as u64;
                        let slot = match q.sleep(Some(ticks), interruptible) {
                            SleepResult::Woken => 0,
                            SleepResult::TimedOut => 1,
                            SleepResult::Interrupted => {
                                assert!(interruptible, "sleeper{i} interrupted in round {k}");
                                2
                            }
                        };
                        tally[slot].fetch_add(1, Ordering::AcqRel);
                    }
                })
                .expect("spawn")
        })
        .collect::<Vec<_>>();
    let wakers = (0..2)
        .map(|i| {
            let (q, calls, stop) = (queue.clone(), calls.clone(), stop.clone());
            ThreadBuilder::new(format!("waker{i}"))
                .spawn(move || {
                    let mut n = 0usize;
                    while !stop.load(Ordering::Acquire) {
                        q.wakeup_one();
                        calls.fetch_add(1, Ordering::AcqRel);
                        n += 1;
                        if n % 64 == 0 {
                            Current::sleep(1);
                        } else {
                            platform().relax();
                        }
                    }
                })
                .expect("spawn")
        })
        .collect::<Vec<_>>();

    spin_for(kernel, 20);
    for sleeper in &sleepers {
        let _ = sleeper.interrupt();
    }
    join_all(sleepers);
    stop.store(true, Ordering::Release);
    join_all(wakers);

    let [woken, timed_out, interrupted] = [0, 1, 2].map(|slot| tally[slot].load(Ordering::Acquire));
    assert_eq!(woken + timed_out + interrupted, SLEEPERS * ROUNDS);
    assert_eq!(
        woken + queue.missed_wakeups(),
        calls.load(Ordering::Acquire),
        "{woken} woken, {timed_out} timed out, {interrupted} interrupted"
    );
    assert!(queue.is_empty());
}

/// A timeout callback wakes a sleeper from interrupt context.
pub fn wakeup_from_interrupt(_kernel: &'static Kernel) {
    let queue = Arc::new(WaitQueue::new());
    let fired_on = Arc::new(AtomicUsize::new(usize::MAX));
    let timeout = {
        let (queue, fired_on) = (queue.clone(), fired_on.clone());
        timer::register(3, move |irq| {
            fired_on.store(irq.cpu_id(), Ordering::Release);
            irq.wakeup_one(&queue);
            irq.request_reschedule();
        })
    };
    let cpu = timeout.cpu();
    assert_eq!(queue.sleep(None, false), SleepResult::Woken);
    assert_eq!(fired_on.load(Ordering::Acquire), cpu);
    assert!(!timer::unregister(timeout));

    // A disarmed timeout never fires.
    let fired = Arc::new(AtomicUsize::new(0));
    let timeout = {
        let fired = fired.clone();
        timer::register(5, move |_| {
            fired.fetch_add(1, Ordering::AcqRel);
        })
    };
    assert!(timer::unregister(timeout));
    Current::sleep(10);
    assert_eq!(fired.load(Ordering::Acquire), 0);
}

/// Consumers wait on a condition variable for a producer.
pub fn condvar_handoff(kernel: &'static Kernel) {
    let queue = Arc::new((Mutex::new(VecDeque::new()), ConditionVariable::new()));
    let consumers = (0..3)
        .map(|i| {
            let queue = queue.clone();
            ThreadBuilder::new(format!("consumer{i}"))
                .spawn(move || {
                    let (items, cv) = &*queue;
                    let mut sum = 0;
                    loop {
                        let mut guard = cv.wait_while(items, |items| items.is_empty());
                        let item = guard.pop_front();
                        guard.unlock();
                        match item {
                            Some(0) | None => break,
                            Some(item) => sum += item,
                        }
                    }
                    Current::exit(sum)
                })
                .expect("spawn")
        })
        .collect::<Vec<_>>();

    let (items, cv) = &*queue;
    for item in 1..=30 {
        let mut guard = items.lock();
        guard.push_back(item);
        cv.signal(guard);
        if item % 7 == 0 {
            spin_for(kernel, 1);
        }
    }
    let mut guard = items.lock();
    guard.extend([0, 0, 0]);
    cv.broadcast(guard);

    let total = consumers
        .into_iter()
        .map(|consumer| consumer.join().expect("joinable"))
        .sum::<i32>();
    assert_eq!(total, (1..=30).sum::<i32>());

    // Nobody signals: the wait times out with the mutex held again.
    let guard = items.lock();
    let (guard, result) = cv.wait_timeout(guard, Some(5));
    assert_eq!(result, SleepResult::TimedOut);
    assert!(items.is_locked());
    guard.unlock();
    assert_eq!(cv.waiters(), 0);
}

/// No more threads than permits hold the semaphore at once.
pub fn semaphore_limits(kernel: &'static Kernel) {
    let sema = Arc::new(Semaphore::new(2, AtomicUsize::new(0)));
    let peak = Arc::new(AtomicUsize::new(0));
    let workers = (0..6)
        .map(|i| {
            let (sema, peak) = (sema.clone(), peak.clone());
            ThreadBuilder::new(format!("worker{i}"))
                .spawn(move || {
                    for _ in 0..3 {
                        let active = sema.down();
                        let now = active.fetch_add(1, Ordering::AcqRel) + 1;
                        peak.fetch_max(now, Ordering::AcqRel);
                        spin_for(kernel, 1);
                        active.fetch_sub(1, Ordering::AcqRel);
                    }
                })
                .expect("spawn")
        })
        .collect::<Vec<_>>();
    join_all(workers);

    assert!(peak.load(Ordering::Acquire) <= 2);
    assert_eq!(sema.available(), 2);

    let first = sema.try_down().expect("a permit is free");
    let second = sema.down_timeout(5).expect("a permit is free");
    assert!(sema.try_down().is_err());
    assert!(matches!(sema.down_timeout(3), Err(KernelError::TimedOut)));
    drop(first);
    drop(second);
    assert_eq!(sema.available(), 2);
}
