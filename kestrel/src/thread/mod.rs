//! Thread abstration, the schedulable unit of the kernel.
//!
//! ## The threading model
//!
//! An executing kernel consists of a collection of threads, each with their
//! own stack and local state. Every thread belongs to a [`Task`] and lives in
//! the kernel's thread table until it is released; everything else, run
//! queues, wait queues and timeouts, refers to it by [`ThreadHandle`].
//!
//! A thread goes through the following states:
//!
//! ```text
//! Entering -> Ready -> Running -> Ready              (preempted / yielded)
//!                      Running -> Sleeping -> Ready  (woken)
//!                      Running -> Exiting -> Lingering -> released
//! ```
//!
//! A lingering thread is released by whoever holds its [`JoinHandle`]: by
//! joining it, or at once if the handle was detached. [`ThreadState::Invalid`]
//! marks a released thread; finding a thread in that state anywhere is a
//! kernel bug.
//!
//! ```ignore
//! let handle = ThreadBuilder::new("worker")
//!     .priority(2)
//!     .spawn(|| {
//!         println!("Hello from {}", Current::get_tid());
//!     })?;
//! assert_eq!(handle.join()?, 0);
//! ```
pub(crate) mod table;

pub use table::ThreadHandle;

use crate::{
    Kernel, KernelError,
    cpu::{Cpu, current_handle},
    sched,
    sync::{SleepResult, WaitQueue},
    task::Task,
    timer::TimeoutId,
};
use abyss::{
    interrupt::{InterruptGuard, InterruptState},
    platform::{Context, platform},
    spinlock::SpinLock,
};
use alloc::{boxed::Box, string::String, sync::Arc, vec::Vec};
use bitflags::bitflags;
use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    mem::ManuallyDrop,
    sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering},
};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// A possible state of the thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ThreadState {
    /// Released. Never observed on a live thread.
    Invalid = 0,
    /// Created, never made ready.
    Entering,
    /// Waiting in a run queue, or about to.
    Ready,
    /// Running on a processor.
    Running,
    /// Blocked in a wait queue.
    Sleeping,
    /// Leaving the processor for the last time.
    Exiting,
    /// Exited, waiting to be joined or released.
    Lingering,
}

bitflags! {
    /// Scheduling attributes of a thread.
    pub struct ThreadFlags: u32 {
        /// Runs on a single processor only and is never migrated.
        const WIRED = 1 << 0;
        /// Migrated by the load balancer and did not run since.
        const STOLEN = 1 << 1;
        /// The idle thread of a processor.
        const IDLE = 1 << 2;
        /// Run time is not charged to the task.
        const UNCOUNTED = 1 << 3;
    }
}

/// The structure a thread is queued in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Membership {
    None,
    WaitQueue,
    Ready(usize),
}

impl Membership {
    fn encode(self) -> u32 {
        match self {
            Membership::None => 0,
            Membership::WaitQueue => 1,
            Membership::Ready(cpu) => 2 + cpu as u32,
        }
    }

    fn decode(raw: u32) -> Self {
        match raw {
            0 => Membership::None,
            1 => Membership::WaitQueue,
            n => Membership::Ready((n - 2) as usize),
        }
    }
}

/// Bookkeeping of the sleep a thread is in, if any.
pub(crate) struct SleepState {
    /// Queue the thread is linked in; null unless sleeping.
    pub(crate) queue: *const WaitQueue,
    pub(crate) interruptible: bool,
    /// Sticky: stays set once the thread was interrupted.
    pub(crate) interrupted: bool,
    /// Bumped by every sleep, so that a late timeout of an earlier sleep is
    /// recognized.
    pub(crate) epoch: u64,
    pub(crate) timeout: Option<(usize, TimeoutId)>,
    pub(crate) outcome: Option<SleepResult>,
}

// Safety: `queue` is only dereferenced under the lock of the sleep state,
// while the thread is linked in that queue.
unsafe impl Send for SleepState {}

/// Everything needed to create a thread.
pub(crate) struct Blueprint {
    pub(crate) name: String,
    pub(crate) task: Arc<Task>,
    pub(crate) priority: usize,
    pub(crate) flags: ThreadFlags,
    pub(crate) wired: Option<usize>,
    pub(crate) entry: Option<Box<dyn FnOnce() + Send>>,
}

const NO_CPU: usize = usize::MAX;

/// An thread abstraction.
pub struct Thread {
    /// Thread id
    pub tid: u64,
    /// Thread name
    pub name: String,
    pub(crate) handle: ThreadHandle,
    pub(crate) task: Arc<Task>,
    context: UnsafeCell<Context>,
    stack: Option<Box<[u8]>>,
    entry: SpinLock<Option<Box<dyn FnOnce() + Send>>>,
    state: AtomicU8,
    flags: AtomicU32,
    priority: AtomicUsize,
    base_priority: usize,
    ticks_left: AtomicU64,
    pub(crate) ticks_used: AtomicU64,
    last_cpu: AtomicUsize,
    wired: Option<usize>,
    membership: AtomicU32,
    pub(crate) preempt_count: AtomicUsize,
    pub(crate) sleep: SpinLock<SleepState>,
    /// Timeouts armed for this thread that may still be firing.
    pub(crate) pending_timeouts: AtomicUsize,
    pub(crate) joiners: WaitQueue,
    pub(crate) detached: AtomicBool,
    pub(crate) exit_code: AtomicI32,
}

// Safety: the context is only touched by the processor that switches the
// thread in or out.
unsafe impl Sync for Thread {}
unsafe impl Send for Thread {}

impl Thread {
    pub(crate) fn new(
        tid: u64,
        handle: ThreadHandle,
        blueprint: Blueprint,
        stack: Option<Box<[u8]>>,
    ) -> Self {
        let Blueprint {
            name,
            task,
            priority,
            flags,
            wired,
            entry,
        } = blueprint;
        Self {
            tid,
            name,
            handle,
            task,
            context: UnsafeCell::new(Context::default()),
            stack,
            entry: SpinLock::new(entry),
            state: AtomicU8::new(ThreadState::Entering.into()),
            flags: AtomicU32::new(flags.bits()),
            priority: AtomicUsize::new(priority),
            base_priority: priority,
            ticks_left: AtomicU64::new(0),
            ticks_used: AtomicU64::new(0),
            last_cpu: AtomicUsize::new(wired.unwrap_or(NO_CPU)),
            wired,
            membership: AtomicU32::new(Membership::None.encode()),
            preempt_count: AtomicUsize::new(0),
            sleep: SpinLock::new(SleepState {
                queue: core::ptr::null(),
                interruptible: false,
                interrupted: false,
                epoch: 0,
                timeout: None,
                outcome: None,
            }),
            pending_timeouts: AtomicUsize::new(0),
            joiners: WaitQueue::new(),
            detached: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
        }
    }

    /// Primes the context so that its first dispatch enters `thread_entry`.
    pub(crate) fn init_context(&mut self) -> Result<(), KernelError> {
        let Some(stack) = self.stack.as_mut() else {
            return Err(KernelError::InvalidArgument);
        };
        unsafe {
            platform().context_init(self.context.get_mut(), thread_entry, self.tid as usize, stack)
        }
        .map_err(|_| KernelError::NoMemory)
    }

    pub(crate) fn context(&self) -> *mut Context {
        self.context.get()
    }

    pub(crate) fn take_entry(&self) -> Option<Box<dyn FnOnce() + Send>> {
        let mut entry = self.entry.lock();
        let f = entry.take();
        entry.unlock();
        f
    }

    /// The task this thread belongs to.
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// Current state.
    pub fn state(&self) -> ThreadState {
        match ThreadState::try_from(self.state.load(Ordering::Acquire)) {
            Ok(state) => state,
            Err(_) => unreachable!(),
        }
    }

    /// Moves the thread from `from` to `to`.
    ///
    /// # Panics
    /// Panics if the thread is not in `from`.
    #[track_caller]
    pub(crate) fn transition(&self, from: ThreadState, to: ThreadState) {
        if let Err(now) = self.state.compare_exchange(
            from.into(),
            to.into(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            panic!(
                "Illegal transition of thread {} ({}): {:?} -> {:?}, found {:?}",
                self.tid,
                self.name,
                from,
                to,
                ThreadState::try_from(now)
            );
        }
    }

    /// Scheduling attributes.
    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flags(&self, flags: ThreadFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_flags(&self, flags: ThreadFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.flags().contains(ThreadFlags::IDLE)
    }

    /// Current priority level; 0 is the most urgent.
    pub fn priority(&self) -> usize {
        self.priority.load(Ordering::Acquire)
    }

    pub(crate) fn set_priority(&self, level: usize) {
        self.priority.store(level, Ordering::Release);
    }

    /// Level the thread was created with and returns to when woken.
    pub fn base_priority(&self) -> usize {
        self.base_priority
    }

    pub(crate) fn ticks_left(&self) -> u64 {
        self.ticks_left.load(Ordering::Acquire)
    }

    pub(crate) fn refill(&self, quantum: u64) {
        self.ticks_left.store(quantum, Ordering::Release);
    }

    /// Charges one tick to the quantum and returns what remains.
    pub(crate) fn consume_tick(&self) -> u64 {
        match self
            .ticks_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| t.checked_sub(1))
        {
            Ok(prev) => prev - 1,
            Err(_) => 0,
        }
    }

    /// Clock ticks this thread ran for.
    pub fn ticks_used(&self) -> u64 {
        self.ticks_used.load(Ordering::Acquire)
    }

    /// Processor the thread last ran on.
    pub fn last_cpu(&self) -> Option<usize> {
        match self.last_cpu.load(Ordering::Acquire) {
            NO_CPU => None,
            cpu => Some(cpu),
        }
    }

    pub(crate) fn set_last_cpu(&self, cpu: usize) {
        self.last_cpu.store(cpu, Ordering::Release);
    }

    /// Processor the thread is wired to.
    pub fn wired(&self) -> Option<usize> {
        self.wired
    }

    pub(crate) fn membership(&self) -> Membership {
        Membership::decode(self.membership.load(Ordering::Acquire))
    }

    /// Records that the thread moved from `from` to `to`.
    ///
    /// # Panics
    /// Panics if the thread is not in `from`: a thread is never in two
    /// queues at once.
    #[track_caller]
    pub(crate) fn relink(&self, from: Membership, to: Membership) {
        if let Err(now) = self.membership.compare_exchange(
            from.encode(),
            to.encode(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            panic!(
                "Thread {} is queued in {:?}, expected {:?} before moving to {:?}",
                self.tid,
                Membership::decode(now),
                from,
                to
            );
        }
    }

    #[track_caller]
    pub(crate) fn link(&self, to: Membership) {
        self.relink(Membership::None, to)
    }

    #[track_caller]
    pub(crate) fn unlink(&self, from: Membership) {
        self.relink(from, Membership::None)
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("state", &self.state())
            .field("queued", &self.membership())
            .field("priority", &self.priority())
            .field("flags", &self.flags())
            .field("last_cpu", &self.last_cpu())
            .finish()
    }
}

/// The very beginning of every thread.
fn thread_entry(_tid: usize) -> ! {
    unsafe { abyss::platform::begin_context() };
    sched::finish_switch();
    unsafe { InterruptState::enable() };

    let (kernel, handle) = current_handle();
    if let Some(f) = kernel.threads.get(handle).take_entry() {
        f();
    }
    Current::exit(0)
}

/// A RAII implementation of preemption disabling.
///
/// While any guard of a thread is alive, the thread keeps its processor:
/// clock ticks still account its quantum, but the switch they request is
/// deferred until the last guard is dropped.
pub struct PreemptGuard {
    _not_send: PhantomData<*const ()>,
}

impl PreemptGuard {
    fn new() -> Self {
        with_current(|th| th.preempt_count.fetch_add(1, Ordering::AcqRel));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        let prev = with_current(|th| th.preempt_count.fetch_sub(1, Ordering::AcqRel));
        assert!(prev > 0, "Unbalanced PreemptGuard.");
        if prev == 1 {
            sched::preempt_check(0);
        }
    }
}

/// A handle to join thread.
///
/// Dropping the handle detaches the thread.
pub struct JoinHandle
where
    Self: 'static,
{
    /// Thread id of this handle.
    pub tid: u64,
    kernel: &'static Kernel,
    handle: ThreadHandle,
}

impl JoinHandle {
    /// Table handle of the thread.
    pub fn handle(&self) -> ThreadHandle {
        self.handle
    }

    /// State of the thread.
    pub fn state(&self) -> ThreadState {
        self.kernel.threads.get(self.handle).state()
    }

    /// Makes a thread created by [`ThreadBuilder::create`] ready.
    ///
    /// # Panics
    /// Panics if the thread was already started.
    pub fn start(&self) {
        self.kernel.make_ready(self.handle, sched::Wake::Spawned);
    }

    /// Interrupts the thread.
    ///
    /// The current interruptible sleep of the thread ends with
    /// [`SleepResult::Interrupted`], and so does every later one. Returns
    /// whether a sleep was cut short.
    pub fn interrupt(&self) -> bool {
        crate::sync::waitq::interrupt(self.kernel, self.handle)
    }

    /// Join this handle and returns exit code.
    ///
    /// # Errors
    /// [`KernelError::InvalidArgument`] if a thread joins itself.
    pub fn join(self) -> Result<i32, KernelError> {
        match self.wait(None) {
            Ok(code) => Ok(code),
            Err((_, e)) => Err(e),
        }
    }

    /// Like [`join`](Self::join), giving up after `ticks` clock ticks.
    ///
    /// # Errors
    /// The handle is handed back with [`KernelError::TimedOut`] if the thread
    /// did not exit in time.
    pub fn join_timeout(self, ticks: u64) -> Result<i32, (Self, KernelError)> {
        self.wait(Some(ticks))
    }

    /// Lets the thread be released as soon as it exits.
    pub fn detach(self) {
        let this = ManuallyDrop::new(self);
        this.kernel.detach(this.handle);
    }

    fn wait(self, ticks: Option<u64>) -> Result<i32, (Self, KernelError)> {
        if Current::try_handle() == Some(self.handle) {
            return Err((self, KernelError::InvalidArgument));
        }
        sched::assert_can_block();
        let kernel = self.kernel;
        let thread = kernel.threads.get(self.handle);
        let deadline = ticks.map(|t| kernel.jiffies() + t);
        loop {
            let joiners = thread.joiners.lock();
            if thread.state() == ThreadState::Lingering {
                joiners.unlock();
                break;
            }
            let left = match deadline {
                None => None,
                Some(deadline) => match deadline.checked_sub(kernel.jiffies()) {
                    Some(left) if left > 0 => Some(left),
                    _ => {
                        joiners.unlock();
                        return Err((self, KernelError::TimedOut));
                    }
                },
            };
            let _ = joiners.sleep(left, false);
        }
        let code = thread.exit_code.load(Ordering::Acquire);
        let this = ManuallyDrop::new(self);
        kernel.release(this.handle);
        Ok(code)
    }
}

impl Drop for JoinHandle {
    fn drop(&mut self) {
        self.kernel.detach(self.handle);
    }
}

impl core::fmt::Debug for JoinHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JoinHandle")
            .field("tid", &self.tid)
            .field("handle", &self.handle)
            .finish()
    }
}

/// The opaque structure indicating the running thread on the current cpu.
pub struct Current {
    _p: (),
}

impl Current {
    fn try_handle() -> Option<ThreadHandle> {
        let _guard = InterruptGuard::new();
        Cpu::try_current()?.try_current_thread()
    }

    /// Exit the current thread with `exit_code`.
    ///
    /// The caller must not hold any lock or guard: what its frames still own
    /// is dropped, if ever, off any processor.
    pub fn exit(exit_code: i32) -> ! {
        sched::exit(exit_code)
    }

    /// Get the current thread's id.
    pub fn get_tid() -> u64 {
        with_current(|th| th.tid)
    }

    /// Get the current thread's table handle.
    pub fn handle() -> ThreadHandle {
        current_handle().1
    }

    /// Gives the processor to the next ready thread of the same or a more
    /// urgent level, if any.
    pub fn yield_now() {
        sched::yield_now()
    }

    /// Sleeps for `ticks` clock ticks.
    pub fn sleep(ticks: u64) {
        let queue = WaitQueue::new();
        let _ = queue.sleep(Some(ticks), false);
    }

    /// Disables preemption of the current thread until the guard is dropped.
    ///
    /// A pinned thread does not migrate, which makes [`Current::cpu`]
    /// stable.
    pub fn pin() -> PreemptGuard {
        PreemptGuard::new()
    }

    /// Processor the current thread runs on.
    pub fn cpu() -> usize {
        let _guard = InterruptGuard::new();
        Cpu::current().id
    }

    /// Whether the current thread was interrupted.
    pub fn is_interrupted() -> bool {
        with_current(|th| {
            let sleep = th.sleep.lock();
            let interrupted = sleep.interrupted;
            sleep.unlock();
            interrupted
        })
    }

    /// Current priority level of the current thread.
    pub fn priority() -> usize {
        with_current(|th| th.priority())
    }

    /// Task of the current thread.
    pub fn task() -> Arc<Task> {
        with_current(|th| th.task.clone())
    }
}

/// Run a function `f` with current thread as an argument.
///
/// # Panics
/// Panics if the caller does not run on a kernel processor.
#[inline]
pub fn with_current<R>(f: impl FnOnce(&Thread) -> R) -> R {
    let (kernel, handle) = current_handle();
    f(kernel.threads.get(handle))
}

/// A struct to build a new thread.
pub struct ThreadBuilder {
    name: String,
    priority: Option<usize>,
    task: Option<Arc<Task>>,
    wired: Option<usize>,
    flags: ThreadFlags,
}

impl ThreadBuilder {
    /// Create a new thread builder for thread `name`.
    pub fn new<I>(name: I) -> Self
    where
        alloc::string::String: core::convert::From<I>,
    {
        Self {
            name: String::from(name),
            priority: None,
            task: None,
            wired: None,
            flags: ThreadFlags::empty(),
        }
    }

    /// Sets the base priority level. Defaults to the middle level.
    pub fn priority(mut self, level: usize) -> Self {
        self.priority = Some(level);
        self
    }

    /// Attach a task to the thread. Defaults to the kernel task.
    pub fn attach_task(mut self, task: Arc<Task>) -> Self {
        self.task = Some(task);
        self
    }

    /// Wires the thread to processor `cpu`.
    pub fn wire(mut self, cpu: usize) -> Self {
        self.wired = Some(cpu);
        self.flags |= ThreadFlags::WIRED;
        self
    }

    /// Does not charge the run time of the thread to its task.
    pub fn uncounted(mut self) -> Self {
        self.flags |= ThreadFlags::UNCOUNTED;
        self
    }

    fn into_blueprint<F: FnOnce() + Send + 'static>(
        self,
        kernel: &Kernel,
        thread_fn: F,
    ) -> Result<Blueprint, KernelError> {
        let priority = self
            .priority
            .unwrap_or_else(|| kernel.config().default_priority());
        if priority >= kernel.config().ready_queues {
            return Err(KernelError::InvalidArgument);
        }
        if self.wired.is_some_and(|cpu| cpu >= kernel.config().cpus) {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Blueprint {
            name: self.name,
            task: self.task.unwrap_or_else(|| kernel.kernel_task().clone()),
            priority,
            flags: self.flags,
            wired: self.wired,
            entry: Some(Box::new(thread_fn)),
        })
    }

    /// Creates the thread in the kernel of `kernel` without starting it.
    ///
    /// # Errors
    /// - [`KernelError::NoMemory`] if the thread table is full or the stack
    ///   cannot be allocated.
    /// - [`KernelError::InvalidArgument`] if the priority or the processor is
    ///   out of range.
    pub fn create_in<F: FnOnce() + Send + 'static>(
        self,
        kernel: &'static Kernel,
        thread_fn: F,
    ) -> Result<JoinHandle, KernelError> {
        let blueprint = self.into_blueprint(kernel, thread_fn)?;
        let (handle, tid) = kernel.create_thread(blueprint, true)?;
        Ok(JoinHandle {
            tid,
            kernel,
            handle,
        })
    }

    /// Creates the thread without starting it; see [`JoinHandle::start`].
    pub fn create<F: FnOnce() + Send + 'static>(
        self,
        thread_fn: F,
    ) -> Result<JoinHandle, KernelError> {
        let kernel = Kernel::try_current().ok_or(KernelError::OperationNotPermitted)?;
        self.create_in(kernel, thread_fn)
    }

    /// Spawn the thread in `kernel`.
    pub fn spawn_in<F: FnOnce() + Send + 'static>(
        self,
        kernel: &'static Kernel,
        thread_fn: F,
    ) -> Result<JoinHandle, KernelError> {
        let handle = self.create_in(kernel, thread_fn)?;
        handle.start();
        Ok(handle)
    }

    /// Spawn the thread in the kernel of the executing processor.
    ///
    /// # Errors
    /// See [`create_in`](Self::create_in). Outside of a kernel processor,
    /// [`KernelError::OperationNotPermitted`].
    pub fn spawn<F: FnOnce() + Send + 'static>(
        self,
        thread_fn: F,
    ) -> Result<JoinHandle, KernelError> {
        let kernel = Kernel::try_current().ok_or(KernelError::OperationNotPermitted)?;
        self.spawn_in(kernel, thread_fn)
    }
}

/// Allocates a zeroed kernel stack, reporting exhaustion instead of
/// aborting.
pub(crate) fn alloc_stack(size: usize) -> Result<Box<[u8]>, KernelError> {
    let mut stack = Vec::new();
    stack
        .try_reserve_exact(size)
        .map_err(|_| KernelError::NoMemory)?;
    stack.resize(size, 0);
    Ok(stack.into_boxed_slice())
}
