//! # Work queues.
//!
//! A [`WorkQueue`] runs deferred work items, in the order they were queued,
//! on a pool of kernel threads of its own. The pool adapts to the load:
//!
//! - When the items queued outnumber what the active workers are expected
//!   to get through ([`Limits::items_per_worker`] each), an idle worker is
//!   activated, or a new worker is spawned if none is idle.
//! - A worker that finds the queue empty while enough workers already idle
//!   exits instead of waiting.
//!
//! Stopping a work queue refuses new items, runs the items still queued and
//! waits until every worker has exited.
//!
//! ```ignore
//! let workq = WorkQueue::new("kworkq")?;
//! workq.enqueue(move || flush(buffer))?;
//! workq.stop();
//! ```
//!
//! A worker that sleeps inside a work item still counts as active.
use crate::{
    Kernel, KernelError,
    sync::{ConditionVariable, Mutex},
    thread::ThreadBuilder,
};
use alloc::{
    boxed::Box,
    collections::VecDeque,
    string::{String, ToString},
    sync::Arc,
};
use core::sync::atomic::{AtomicUsize, Ordering};

/// A deferred function.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Bounds on the worker pool of a work queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    /// Idle workers kept waiting for work.
    pub min_idle: usize,
    /// Workers in total, whether active or idle.
    pub max_workers: usize,
    /// Workers running work items at the same time.
    pub max_concurrent: usize,
    /// Queued items per active worker before another one is activated.
    pub items_per_worker: usize,
}

impl Limits {
    /// Limits sized for a machine of `cpus` processors.
    pub const fn for_cpus(cpus: usize) -> Self {
        Self {
            min_idle: max(2, cpus / 4),
            max_workers: max(32, 8 * cpus),
            max_concurrent: max(2, cpus),
            items_per_worker: 8,
        }
    }
}

const fn max(a: usize, b: usize) -> usize {
    if a > b { a } else { b }
}

#[derive(Default)]
struct State {
    items: VecDeque<Work>,
    /// Workers spawned and not yet exited, including those being spawned.
    workers: usize,
    idle: usize,
    /// Idle workers signaled that have not woken up yet.
    activate_pending: usize,
    stopping: bool,
}

impl State {
    /// Workers running a work item right now.
    fn active_now(&self) -> usize {
        debug_assert!(self.idle <= self.workers);
        self.workers - self.idle
    }

    /// Workers running a work item or about to.
    fn active(&self) -> usize {
        self.active_now() + self.activate_pending
    }

    fn unnecessary(&self, limits: &Limits) -> bool {
        if self.items.is_empty() {
            limits.min_idle <= self.idle
        } else {
            limits.max_concurrent < self.active_now()
        }
    }
}

enum Signal {
    Activate,
    Spawn,
}

struct Inner {
    name: String,
    kernel: &'static Kernel,
    limits: Limits,
    state: Mutex<State>,
    activate: ConditionVariable,
    exited: ConditionVariable,
    spawned: AtomicUsize,
}

impl Inner {
    /// Decides how to get a newly queued item running.
    fn signal_logic(&self, state: &mut State) -> Option<Signal> {
        let active = state.active();
        if active * self.limits.items_per_worker >= state.items.len() {
            return None;
        }
        if state.idle > state.activate_pending {
            // Spurious wakeups stay recognizable as `idle` is left alone.
            state.activate_pending += 1;
            Some(Signal::Activate)
        } else if active < self.limits.max_concurrent && state.workers < self.limits.max_workers {
            // Counted before it exists so that a burst spawns one worker.
            state.workers += 1;
            Some(Signal::Spawn)
        } else {
            None
        }
    }

    /// Spawns a worker already counted in `workers`.
    fn add_worker(self: &Arc<Self>) -> Result<(), KernelError> {
        let seq = self.spawned.fetch_add(1, Ordering::Relaxed);
        let this = self.clone();
        match ThreadBuilder::new(alloc::format!("{}/{}", self.name, seq))
            .spawn_in(self.kernel, move || this.work())
        {
            Ok(worker) => {
                worker.detach();
                Ok(())
            }
            Err(e) => {
                warning!("{}: cannot spawn a worker: {:?}", self.name, e);
                let mut state = self.state.lock();
                state.workers -= 1;
                self.exited.broadcast(state);
                Err(e)
            }
        }
    }

    fn work(&self) {
        while let Some(item) = self.dequeue() {
            item();
        }
    }

    /// Waits for an item. `None` tells the worker to exit.
    fn dequeue(&self) -> Option<Work> {
        let mut state = self.state.lock();
        if !state.stopping && state.unnecessary(&self.limits) {
            state.workers -= 1;
            state.unlock();
            return None;
        }
        while state.items.is_empty() && !state.stopping {
            state.idle += 1;
            state = self.activate.wait(state);
            state.idle -= 1;
            state.activate_pending = state.activate_pending.saturating_sub(1);
        }
        // Items queued before the stop still run.
        match state.items.pop_front() {
            Some(item) => {
                state.unlock();
                Some(item)
            }
            None => {
                state.workers -= 1;
                self.exited.broadcast(state);
                None
            }
        }
    }
}

/// Snapshot of a work queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkQueueInfo {
    /// Name of the work queue.
    pub name: String,
    /// Workers alive.
    pub workers: usize,
    /// Workers waiting for an item.
    pub idle: usize,
    /// Idle workers signaled that have not woken up yet.
    pub activate_pending: usize,
    /// Items waiting for a worker.
    pub queued: usize,
    /// Whether the work queue refuses new items.
    pub stopping: bool,
}

impl core::fmt::Display for WorkQueueInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}: {} workers ({} idle, {} activating), {} queued{}",
            self.name,
            self.workers,
            self.idle,
            self.activate_pending,
            self.queued,
            if self.stopping { ", stopping" } else { "" }
        )
    }
}

/// A queue of deferred functions run by a pool of kernel threads.
///
/// Dropping the work queue stops it.
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    /// Creates a work queue in the kernel of the executing processor, with
    /// limits sized for its processors.
    ///
    /// # Errors
    /// [`KernelError::OperationNotPermitted`] outside of a kernel processor,
    /// or the error of spawning the first worker.
    pub fn new(name: &str) -> Result<Self, KernelError> {
        let kernel = Kernel::try_current().ok_or(KernelError::OperationNotPermitted)?;
        Self::with_limits(kernel, name, Limits::for_cpus(kernel.config().cpus))
    }

    /// Creates a work queue in `kernel` with `limits`, and its first worker.
    ///
    /// # Errors
    /// [`KernelError::InvalidArgument`] if the limits allow no worker at all
    /// or none to run, or the error of spawning the first worker.
    pub fn with_limits(
        kernel: &'static Kernel,
        name: &str,
        limits: Limits,
    ) -> Result<Self, KernelError> {
        if limits.max_workers == 0 || limits.max_concurrent == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let inner = Arc::new(Inner {
            name: name.to_string(),
            kernel,
            limits,
            state: Mutex::new(State {
                workers: 1,
                ..State::default()
            }),
            activate: ConditionVariable::new(),
            exited: ConditionVariable::new(),
            spawned: AtomicUsize::new(0),
        });
        inner.add_worker()?;
        Ok(Self { inner })
    }

    /// Queues `work` to run on a worker.
    ///
    /// # Errors
    /// [`KernelError::OperationNotPermitted`] once the work queue is
    /// stopping. The item is dropped.
    ///
    /// # Panics
    /// Panics if called from interrupt context.
    pub fn enqueue<F: FnOnce() + Send + 'static>(&self, work: F) -> Result<(), KernelError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.stopping {
            state.unlock();
            return Err(KernelError::OperationNotPermitted);
        }
        state.items.push_back(Box::new(work));
        match inner.signal_logic(&mut state) {
            Some(Signal::Activate) => inner.activate.signal(state),
            Some(Signal::Spawn) => {
                state.unlock();
                // A queued item outlives a failed spawn and waits for the
                // workers left.
                let _ = inner.add_worker();
            }
            None => state.unlock(),
        }
        Ok(())
    }

    /// Refuses new items, waits until the items queued have run and every
    /// worker has exited.
    ///
    /// Must not be called from one of its own work items.
    pub fn stop(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if !state.stopping {
            state.stopping = true;
            debug!("{}: stopping, {} queued", inner.name, state.items.len());
            inner.activate.broadcast(state);
            state = inner.state.lock();
        }
        while state.workers > 0 {
            state = inner.exited.wait(state);
        }
        state.unlock();
    }

    /// Snapshot of the pool and the queue.
    pub fn info(&self) -> WorkQueueInfo {
        let state = self.inner.state.lock();
        let info = WorkQueueInfo {
            name: self.inner.name.clone(),
            workers: state.workers,
            idle: state.idle,
            activate_pending: state.activate_pending,
            queued: state.items.len(),
            stopping: state.stopping,
        };
        state.unlock();
        info
    }

    /// The limits of the worker pool.
    pub fn limits(&self) -> Limits {
        self.inner.limits
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(workers: usize, idle: usize, items: usize) -> State {
        let mut state = State {
            workers,
            idle,
            ..State::default()
        };
        for _ in 0..items {
            state.items.push_back(Box::new(|| ()));
        }
        state
    }

    #[test]
    fn limits_scale_with_processors() {
        assert_eq!(
            Limits::for_cpus(1),
            Limits {
                min_idle: 2,
                max_workers: 32,
                max_concurrent: 2,
                items_per_worker: 8,
            }
        );
        let big = Limits::for_cpus(16);
        assert_eq!((big.min_idle, big.max_workers, big.max_concurrent), (4, 128, 16));
    }

    #[test]
    fn idle_surplus_is_unnecessary() {
        let limits = Limits::for_cpus(4);
        assert!(!state(3, 1, 0).unnecessary(&limits));
        assert!(state(3, 2, 0).unnecessary(&limits));
        // With items queued, only an excess of running workers counts.
        assert!(!state(4, 2, 1).unnecessary(&limits));
        assert!(!state(4, 0, 1).unnecessary(&limits));
        assert!(state(5, 0, 1).unnecessary(&limits));
    }

    #[test]
    fn activation_counts_pending_workers() {
        let mut state = state(2, 1, 0);
        state.activate_pending = 1;
        assert_eq!(state.active_now(), 1);
        assert_eq!(state.active(), 2);
    }

    #[test]
    fn info_display() {
        let info = WorkQueueInfo {
            name: "kworkq".into(),
            workers: 3,
            idle: 1,
            activate_pending: 0,
            queued: 5,
            stopping: true,
        };
        assert_eq!(
            info.to_string(),
            "kworkq: 3 workers (1 idle, 0 activating), 5 queued, stopping"
        );
    }
}
