//! Tasks and the hooks of the subsystems built around the scheduler.
//!
//! A [`Task`] groups threads that share an address space. It is created
//! empty, gains a member for every thread spawned into it, and is destroyed
//! once its last member was released. The scheduler never looks inside an
//! address space: it only compares [`AddressSpaceId`]s and tells the memory
//! subsystem, through [`Hooks::as_switch`], when the executing processor has
//! to change its translation.
use crate::thread::ThreadHandle;
use alloc::{string::String, vec::Vec};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use abyss::spinlock::SpinLock;

/// Identity of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

/// Opaque name of an address space, owned by the memory subsystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AddressSpaceId(pub u64);

/// A set of threads sharing an address space.
pub struct Task {
    id: TaskId,
    name: String,
    address_space: Option<AddressSpaceId>,
    /// Threads not released yet.
    members: SpinLock<Vec<ThreadHandle>>,
    /// Threads that did not exit yet.
    lifecount: AtomicUsize,
    /// Clock ticks consumed by the counted threads of this task.
    pub(crate) ticks: AtomicU64,
}

impl Task {
    pub(crate) fn new(id: TaskId, name: &str, address_space: Option<AddressSpaceId>) -> Self {
        Self {
            id,
            name: String::from(name),
            address_space,
            members: SpinLock::new(Vec::new()),
            lifecount: AtomicUsize::new(0),
            ticks: AtomicU64::new(0),
        }
    }

    /// Identity of this task.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Name of this task.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address space shared by the threads of this task. None for the
    /// kernel task.
    pub fn address_space(&self) -> Option<AddressSpaceId> {
        self.address_space
    }

    /// Number of threads that did not exit yet.
    pub fn lifecount(&self) -> usize {
        self.lifecount.load(Ordering::Acquire)
    }

    /// Number of threads not released yet.
    pub fn thread_count(&self) -> usize {
        self.members.lock().len()
    }

    /// Clock ticks consumed by the threads of this task.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    pub(crate) fn attach(&self, thread: ThreadHandle) {
        let mut members = self.members.lock();
        members.push(thread);
        self.lifecount.fetch_add(1, Ordering::AcqRel);
        members.unlock();
    }

    /// Returns true when the last thread went away.
    pub(crate) fn exited(&self) -> bool {
        let prev = self.lifecount.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "Task {:?} has no living thread.", self.id);
        prev == 1
    }

    /// Returns true when the last member was released.
    pub(crate) fn detach(&self, thread: ThreadHandle) -> bool {
        let mut members = self.members.lock();
        let Some(pos) = members.iter().position(|&th| th == thread) else {
            panic!("{thread:?} is not a member of task {:?}.", self.id);
        };
        members.swap_remove(pos);
        members.is_empty()
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("address_space", &self.address_space)
            .field("lifecount", &self.lifecount())
            .finish()
    }
}

/// Callbacks into the subsystems the scheduler does not own.
///
/// Every hook has an empty default, and `()` implements the trait with all
/// of them. Hooks run with interrupts disabled on the processor that
/// triggered them and must not block.
pub trait Hooks: Send + Sync {
    /// The executing processor is about to run a thread of another address
    /// space. Returns once the switch is complete.
    fn as_switch(&self, _old: Option<AddressSpaceId>, _new: Option<AddressSpaceId>) {}

    /// A thread of `task` is about to run after a thread of another task.
    fn before_task_runs(&self, _task: &Task) {}

    /// Thread `tid` is about to run on `cpu`.
    fn before_thread_runs(&self, _tid: u64, _cpu: usize) {}

    /// Thread `tid` stopped running on `cpu`.
    fn after_thread_ran(&self, _tid: u64, _cpu: usize) {}

    /// The last thread of `task` exited.
    fn task_exited(&self, _task: &Task) {}

    /// The last thread of `task` was released; the task is about to go away.
    fn task_destroy(&self, _task: &Task) {}

    /// `cpu` received a shootdown request.
    fn tlb_shootdown(&self, _cpu: usize) {}
}

impl Hooks for () {}
