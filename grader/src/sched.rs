//! Dispatch order, time slicing and the load balancer.
use crate::{spin_for, wait_until};
use abyss::{hosted::Failure, platform::platform};
use kestrel::{
    Config, Kernel,
    sync::Mutex,
    task::Hooks,
    thread::{Current, ThreadBuilder},
};
use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Arc, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

/// More urgent levels run first. Needs a single processor.
pub fn priority_order(_kernel: &'static Kernel) {
    let order = Arc::new(Mutex::new(Vec::new()));
    let pin = Current::pin();
    let threads = [5, 1, 3, 1]
        .into_iter()
        .enumerate()
        .map(|(i, level)| {
            let order = order.clone();
            ThreadBuilder::new(format!("level{level}.{i}"))
                .priority(level)
                .spawn(move || {
                    let mut order = order.lock();
                    order.push(i);
                    order.unlock();
                })
                .expect("spawn")
        })
        .collect::<Vec<_>>();
    drop(pin);
    for thread in threads {
        assert_eq!(thread.join(), Ok(0));
    }

    let order = order.lock();
    assert_eq!(order.as_slice(), [1, 3, 2, 0]);
    order.unlock();
}

/// Threads of the same level share the processor. Needs a single
/// processor.
pub fn time_slicing(kernel: &'static Kernel) {
    let seen = Arc::new([AtomicBool::new(false), AtomicBool::new(false)]);
    let spinners = (0..2)
        .map(|me| {
            let seen = seen.clone();
            ThreadBuilder::new(format!("spinner{me}"))
                .spawn(move || {
                    seen[me].store(true, Ordering::Release);
                    let deadline = kernel.jiffies() + 2000;
                    while !seen[1 - me].load(Ordering::Acquire) && kernel.jiffies() < deadline {
                        platform().relax();
                    }
                    assert!(seen[1 - me].load(Ordering::Acquire), "spinner{me} starved");
                })
                .expect("spawn")
        })
        .collect::<Vec<_>>();
    for spinner in spinners {
        assert_eq!(spinner.join(), Ok(0));
    }
    assert!(kernel.cpu_stats(0).expect("cpu0").preemptions > 0);
}

/// A thread at the least urgent level still runs while a hog spins at the
/// most urgent one. Needs a single processor.
pub fn aging(kernel: &'static Kernel) {
    let levels = kernel.config().ready_queues;
    let ran = Arc::new(AtomicBool::new(false));
    let starved = {
        let ran = ran.clone();
        ThreadBuilder::new("starved")
            .priority(levels - 1)
            .spawn(move || ran.store(true, Ordering::Release))
            .expect("spawn")
    };
    let hog = {
        let ran = ran.clone();
        ThreadBuilder::new("hog")
            .priority(0)
            .spawn(move || {
                let deadline = kernel.jiffies() + 5000;
                while !ran.load(Ordering::Acquire) && kernel.jiffies() < deadline {
                    platform().relax();
                }
                // Demoted at least once on the way.
                assert!(Current::priority() > 0);
            })
            .expect("spawn")
    };
    assert_eq!(hog.join(), Ok(0));
    assert_eq!(starved.join(), Ok(0));
    assert!(ran.load(Ordering::Acquire));
    assert!(kernel.cpu_stats(0).expect("cpu0").relinks > 0);
}

/// A pinned thread keeps its processor.
pub fn pinning(kernel: &'static Kernel) {
    let pin = Current::pin();
    let cpu = Current::cpu();
    let busy = (0..kernel.config().cpus * 2)
        .map(|i| {
            ThreadBuilder::new(format!("busy{i}"))
                .priority(0)
                .spawn(move || spin_for(kernel, 5))
                .expect("spawn")
        })
        .collect::<Vec<_>>();
    let until = kernel.jiffies() + 10;
    while kernel.jiffies() < until {
        platform().relax();
        assert_eq!(Current::cpu(), cpu);
    }
    drop(pin);
    for thread in busy {
        assert_eq!(thread.join(), Ok(0));
    }
}

/// Busy threads spread over every processor.
pub fn load_distribution(kernel: &'static Kernel) {
    let cpus = kernel.config().cpus;
    let visited = Arc::new(Mutex::new(BTreeSet::new()));
    let running = Arc::new(AtomicUsize::new(0));
    let workers = (0..cpus * 3)
        .map(|i| {
            let (visited, running) = (visited.clone(), running.clone());
            ThreadBuilder::new(format!("worker{i}"))
                .spawn(move || {
                    running.fetch_add(1, Ordering::AcqRel);
                    let until = kernel.jiffies() + 60;
                    while kernel.jiffies() < until {
                        let cpu = Current::cpu();
                        let mut visited = visited.lock();
                        visited.insert(cpu);
                        visited.unlock();
                        spin_for(kernel, 1);
                    }
                })
                .expect("spawn")
        })
        .collect::<Vec<_>>();
    wait_until(kernel, 1000, "every worker to start", || {
        running.load(Ordering::Acquire) == cpus * 3
    });
    for worker in workers {
        assert_eq!(worker.join(), Ok(0));
    }

    let visited = visited.lock();
    assert_eq!(visited.len(), cpus, "workers ran on {:?}", *visited);
    visited.unlock();
}

/// Statistics account for what the processors did.
pub fn statistics(kernel: &'static Kernel) {
    let cpus = kernel.config().cpus;
    let workers = (0..cpus * 2)
        .map(|i| {
            ThreadBuilder::new(format!("worker{i}"))
                .spawn(move || {
                    for _ in 0..5 {
                        spin_for(kernel, 2);
                        Current::yield_now();
                    }
                })
                .expect("spawn")
        })
        .collect::<Vec<_>>();
    for worker in workers {
        assert_eq!(worker.join(), Ok(0));
    }

    let stats = kernel.stats();
    assert_eq!(stats.len(), cpus);
    for cpu in &stats {
        assert!(cpu.online);
        assert_eq!(cpu.levels.len(), kernel.config().ready_queues);
        kestrel::info!("{}", cpu);
    }
    assert!(stats.iter().map(|cpu| cpu.context_switches).sum::<u64>() > 0);
    assert!(stats.iter().map(|cpu| cpu.busy_ticks).sum::<u64>() > 0);

    let pin = Current::pin();
    let me = kernel.cpu_stats(Current::cpu()).expect("online");
    assert_eq!(me.current, Some(Current::get_tid()));
    drop(pin);
    kernel.print_runqueues();
}

/// Where every thread runs, as told by the dispatch hooks.
#[derive(Default)]
pub struct Dispatches {
    running: std::sync::Mutex<HashMap<u64, usize>>,
    count: AtomicUsize,
}

/// Hooks that fail as soon as a thread is dispatched while it still runs
/// somewhere.
#[derive(Default)]
pub struct RunningOn(pub Arc<Dispatches>);

impl Hooks for RunningOn {
    fn before_thread_runs(&self, tid: u64, cpu: usize) {
        self.0.count.fetch_add(1, Ordering::AcqRel);
        let mut running = self.0.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(other) = running.insert(tid, cpu) {
            drop(running);
            panic!("thread {tid} dispatched on cpu{cpu} while running on cpu{other}");
        }
    }

    fn after_thread_ran(&self, tid: u64, cpu: usize) {
        let mut running = self.0.running.lock().unwrap_or_else(PoisonError::into_inner);
        // Boot flows were never dispatched.
        if let Some(on) = running.remove(&tid) {
            drop(running);
            assert_eq!(on, cpu, "thread {tid} left cpu{cpu} but ran on cpu{on}");
        }
    }
}

/// Sleeps, wakeups, preemption and migration, with no thread ever running
/// twice at once.
pub fn exclusive_dispatch(kernel: &'static Kernel, dispatches: Arc<Dispatches>) {
    crate::sync::sleep_outcome_race(kernel);
    load_distribution(kernel);
    assert!(dispatches.count.load(Ordering::Acquire) > 0);

    let pin = Current::pin();
    let running = dispatches.running.lock().unwrap_or_else(PoisonError::into_inner);
    assert_eq!(running.get(&Current::get_tid()), Some(&Current::cpu()));
    drop(running);
    drop(pin);
}

/// Runs [`exclusive_dispatch`] with a kernel reporting its dispatches.
pub fn run_exclusive_dispatch(cpus: usize) -> Result<(), Failure> {
    let hooks = RunningOn::default();
    let dispatches = hooks.0.clone();
    crate::run_with(Config::new().cpus(cpus), hooks, move |kernel| {
        exclusive_dispatch(kernel, dispatches)
    })
}
