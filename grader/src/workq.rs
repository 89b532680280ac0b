//! Work queues and their worker pools.
use crate::{spin_for, wait_until};
use kestrel::{
    Kernel, KernelError,
    sync::Mutex,
    thread::Current,
    workq::{Limits, WorkQueue},
};
use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

/// Every queued item runs before `stop` returns, and a stopped work queue
/// refuses new items.
pub fn runs_and_drains(_kernel: &'static Kernel) {
    let workq = WorkQueue::new("kworkq").expect("work queue");
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let done = done.clone();
        workq
            .enqueue(move || {
                done.fetch_add(1, Ordering::Relaxed);
            })
            .expect("enqueue");
    }
    workq.stop();
    assert_eq!(done.load(Ordering::Relaxed), 100);

    let info = workq.info();
    assert!(info.stopping, "{info}");
    assert_eq!((info.workers, info.idle, info.queued), (0, 0, 0), "{info}");
    assert_eq!(workq.enqueue(|| ()), Err(KernelError::OperationNotPermitted));
    // Stopping twice returns at once.
    workq.stop();
}

/// A backlog spawns extra workers, and the pool shrinks back to the idle
/// workers it keeps once the backlog is gone.
pub fn pool_adapts(kernel: &'static Kernel) {
    let workq = WorkQueue::new("kworkq").expect("work queue");
    let limits = workq.limits();
    let runners = Arc::new(Mutex::new(BTreeSet::new()));
    for _ in 0..64 {
        let runners = runners.clone();
        workq
            .enqueue(move || {
                spin_for(kernel, 1);
                let mut runners = runners.lock();
                runners.insert(Current::get_tid());
                runners.unlock();
            })
            .expect("enqueue");
    }
    wait_until(kernel, 2000, "the backlog to drain", || {
        let info = workq.info();
        info.queued == 0 && info.workers == info.idle
    });

    let info = workq.info();
    assert_eq!(info.workers, limits.min_idle, "{info}");
    let runners = runners.lock();
    assert!(runners.len() > 1, "a single worker ran the backlog");
    assert!(runners.len() <= limits.max_workers);
    runners.unlock();
    drop(workq);
}

/// A single worker runs the items in the order they were queued, including
/// those still queued when the work queue stops.
pub fn serial_order(kernel: &'static Kernel) {
    let limits = Limits {
        min_idle: 1,
        max_workers: 1,
        max_concurrent: 1,
        items_per_worker: 1,
    };
    let workq = WorkQueue::with_limits(kernel, "serial", limits).expect("work queue");
    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..20 {
        let order = order.clone();
        workq
            .enqueue(move || {
                let mut order = order.lock();
                order.push(i);
                order.unlock();
                Current::yield_now();
            })
            .expect("enqueue");
    }
    workq.stop();

    let order = order.lock();
    assert_eq!(*order, (0..20).collect::<Vec<_>>());
    order.unlock();
    assert_eq!(workq.info().workers, 0);
}

/// Limits that allow no running worker are rejected.
pub fn invalid_limits(kernel: &'static Kernel) {
    let limits = Limits {
        max_concurrent: 0,
        ..Limits::for_cpus(kernel.config().cpus)
    };
    assert!(matches!(
        WorkQueue::with_limits(kernel, "none", limits),
        Err(KernelError::InvalidArgument)
    ));
}
