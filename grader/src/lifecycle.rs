//! Thread and task lifecycle.
use crate::{spin_for, wait_until};
use abyss::hosted::{Failure, live_contexts};
use kestrel::{
    Config, Kernel, KernelError,
    sync::{Mutex, Semaphore},
    task::{AddressSpaceId, Hooks, Task},
    thread::{Current, JoinHandle, ThreadBuilder, ThreadState},
};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

/// Exit codes reach the joiner; timeouts hand the handle back.
pub fn join_semantics(kernel: &'static Kernel) {
    let seven = ThreadBuilder::new("seven")
        .spawn(|| Current::exit(7))
        .expect("spawn");
    assert_eq!(seven.join(), Ok(7));

    let lazy = ThreadBuilder::new("lazy").create(|| ()).expect("create");
    assert_eq!(lazy.state(), ThreadState::Entering);
    lazy.start();
    assert_eq!(lazy.join(), Ok(0));

    let gate = Arc::new(Semaphore::new(0, ()));
    let waiter = {
        let gate = gate.clone();
        ThreadBuilder::new("waiter")
            .spawn(move || core::mem::forget(gate.down()))
            .expect("spawn")
    };
    wait_until(kernel, 1000, "the waiter to block", || {
        waiter.state() == ThreadState::Sleeping
    });
    let waiter = match waiter.join_timeout(5) {
        Err((waiter, KernelError::TimedOut)) => waiter,
        other => panic!("join_timeout on a sleeping thread: {other:?}"),
    };
    gate.up();
    assert_eq!(waiter.join_timeout(1000).map_err(|(_, e)| e), Ok(0));
}

/// A thread that joins itself is refused, which detaches it.
pub fn self_join(kernel: &'static Kernel) {
    let before = kernel.thread_count();
    let slot: Arc<Mutex<Option<JoinHandle>>> = Arc::new(Mutex::new(None));
    let handle = {
        let slot = slot.clone();
        ThreadBuilder::new("narcissus")
            .spawn(move || {
                let me = loop {
                    let mut slot = slot.lock();
                    let me = slot.take();
                    slot.unlock();
                    match me {
                        Some(me) => break me,
                        None => Current::sleep(1),
                    }
                };
                assert_eq!(me.handle(), Current::handle());
                assert_eq!(me.join(), Err(KernelError::InvalidArgument));
            })
            .expect("spawn")
    };
    let mut guard = slot.lock();
    *guard = Some(handle);
    guard.unlock();
    wait_until(kernel, 1000, "the thread to be released", || {
        kernel.thread_count() == before
    });
}

/// Every thread is released exactly once, joined or detached.
pub fn no_leak(kernel: &'static Kernel) {
    let baseline = kernel.thread_count();
    for round in 0..5 {
        let handles = (0..20)
            .map(|i| {
                ThreadBuilder::new(format!("ephemeral{round}.{i}"))
                    .spawn(move || {
                        if i % 3 == 0 {
                            Current::yield_now();
                        }
                        if i % 5 == 0 {
                            Current::sleep(1);
                        }
                    })
                    .expect("spawn")
            })
            .collect::<Vec<_>>();
        for (i, handle) in handles.into_iter().enumerate() {
            match i % 3 {
                0 => assert_eq!(handle.join(), Ok(0)),
                1 => handle.detach(),
                _ => drop(handle),
            }
        }
    }
    wait_until(kernel, 2000, "every thread to be released", || {
        kernel.thread_count() == baseline
    });
}

/// Once every processor shows up online, its idle and balancer threads
/// exist.
pub fn boot_census(kernel: &'static Kernel) {
    let config = kernel.config();
    let per_cpu = if config.load_balancer { 2 } else { 1 };
    // And `main`.
    assert_eq!(kernel.thread_count(), config.cpus * per_cpu + 1);
}

/// The host thread behind an exited thread goes away.
pub fn contexts_reclaimed(kernel: &'static Kernel) {
    let before = live_contexts();
    assert!(before > 0);
    let threads = (0..30i32)
        .map(|i| {
            ThreadBuilder::new(format!("brief{i}"))
                .spawn(move || {
                    if i % 2 == 0 {
                        Current::yield_now();
                        Current::exit(i);
                    }
                })
                .expect("spawn")
        })
        .collect::<Vec<_>>();
    for (i, thread) in (0..).zip(threads) {
        let code = if i % 2 == 0 { i } else { 0 };
        assert_eq!(thread.join(), Ok(code));
    }
    wait_until(kernel, 1000, "exited contexts to be reclaimed", || {
        live_contexts() == before
    });
}

/// A full thread table fails creation cleanly. Needs a single processor
/// and room for four threads.
pub fn table_exhaustion(_kernel: &'static Kernel) {
    let gate = Arc::new(Semaphore::new(0, ()));
    let blocked = (0..2)
        .map(|i| {
            let gate = gate.clone();
            ThreadBuilder::new(format!("blocked{i}"))
                .spawn(move || core::mem::forget(gate.down()))
                .expect("room for two threads")
        })
        .collect::<Vec<_>>();
    assert_eq!(
        ThreadBuilder::new("one too many").spawn(|| ()).err(),
        Some(KernelError::NoMemory)
    );
    assert_eq!(
        ThreadBuilder::new("out of range").priority(99).spawn(|| ()).err(),
        Some(KernelError::InvalidArgument)
    );

    gate.up();
    gate.up();
    for thread in blocked {
        assert_eq!(thread.join(), Ok(0));
    }
    let again = ThreadBuilder::new("again").spawn(|| ()).expect("room again");
    assert_eq!(again.join(), Ok(0));
}

/// The table of [`table_exhaustion`]: the idle thread, `main` and two
/// more.
pub const fn tiny_table() -> Config {
    crate::uniprocessor().max_threads(4)
}

/// What the hooks saw.
#[derive(Default)]
pub struct Record {
    switches: AtomicUsize,
    into_user: AtomicUsize,
    exited: AtomicUsize,
    destroyed: AtomicUsize,
}

/// Hooks that fill a [`Record`].
#[derive(Default)]
pub struct Recording(pub Arc<Record>);

const USER_AS: AddressSpaceId = AddressSpaceId(7);

impl Hooks for Recording {
    fn as_switch(&self, old: Option<AddressSpaceId>, new: Option<AddressSpaceId>) {
        assert_ne!(old, new, "switching to the address space in use");
        self.0.switches.fetch_add(1, Ordering::AcqRel);
        if new == Some(USER_AS) {
            self.0.into_user.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn task_exited(&self, task: &Task) {
        if task.address_space() == Some(USER_AS) {
            self.0.exited.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn task_destroy(&self, task: &Task) {
        if task.address_space() == Some(USER_AS) {
            self.0.destroyed.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// A task lives as long as its threads, and running them switches address
/// spaces.
pub fn task_lifecycle(kernel: &'static Kernel, record: Arc<Record>) {
    let tasks = kernel.task_count();
    let task = kernel.task_create("user", USER_AS);
    let id = task.id();
    assert_eq!(kernel.task_count(), tasks + 1);
    assert!(kernel.task(id).is_some());

    let threads = (0..3)
        .map(|i| {
            ThreadBuilder::new(format!("user{i}"))
                .attach_task(task.clone())
                .spawn(move || {
                    assert_eq!(Current::task().address_space(), Some(USER_AS));
                    spin_for(kernel, 3);
                })
                .expect("spawn")
        })
        .collect::<Vec<_>>();
    assert_eq!(task.thread_count(), 3);
    for thread in threads {
        assert_eq!(thread.join(), Ok(0));
    }

    assert_eq!(task.lifecount(), 0);
    assert_eq!(task.thread_count(), 0);
    assert!(task.ticks() > 0);
    assert!(kernel.task(id).is_none());
    assert_eq!(kernel.task_count(), tasks);
    assert_eq!(record.exited.load(Ordering::Acquire), 1);
    assert_eq!(record.destroyed.load(Ordering::Acquire), 1);
    assert!(record.into_user.load(Ordering::Acquire) > 0);
    assert!(record.switches.load(Ordering::Acquire) >= record.into_user.load(Ordering::Acquire));
}

/// Runs [`task_lifecycle`] with a kernel recording its hooks.
pub fn run_task_lifecycle(cpus: usize) -> Result<(), Failure> {
    let hooks = Recording::default();
    let record = hooks.0.clone();
    crate::run_with(Config::new().cpus(cpus), hooks, move |kernel| {
        task_lifecycle(kernel, record)
    })
}
