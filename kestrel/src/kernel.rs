//! The kernel object.
//!
//! A [`Kernel`] owns everything the scheduler core manages: the processors,
//! the thread table and the tasks. It is created once, leaked, and shared by
//! `&'static` reference; code running on a started processor finds it
//! through [`Kernel::try_current`].
use crate::{
    Config, KernelError,
    cpu::{Cpu, IDLE_PRIORITY},
    sched::{self, Wake, balance},
    smp,
    stats::CpuStats,
    task::{AddressSpaceId, Hooks, Task, TaskId},
    thread::{
        Blueprint, Membership, Thread, ThreadBuilder, ThreadFlags, ThreadHandle, ThreadState,
        alloc_stack, table::ThreadTable,
    },
    timer,
};
use abyss::{
    interrupt::{self, InterruptGuard, InterruptState, Vector},
    platform::{current_core, platform},
    spinlock::SpinLock,
};
use alloc::{
    boxed::Box, collections::BTreeMap, format, string::String, sync::Arc, vec::Vec,
};
use core::sync::atomic::{AtomicU64, Ordering};
use crossbeam_utils::CachePadded;

/// The scheduler core of a multiprocessor.
pub struct Kernel {
    config: Config,
    pub(crate) cpus: Box<[CachePadded<Cpu>]>,
    pub(crate) threads: ThreadTable,
    tasks: SpinLock<BTreeMap<TaskId, Arc<Task>>>,
    kernel_task: Arc<Task>,
    hooks: Box<dyn Hooks>,
    next_tid: AtomicU64,
    next_task: AtomicU64,
    /// Clock ticks since processor 0 started.
    pub(crate) jiffies: AtomicU64,
}

impl Kernel {
    /// Creates a kernel for `config`, calling `hooks` at the lifecycle
    /// boundaries of threads and tasks.
    ///
    /// No processor runs yet; every processor has to enter the kernel with
    /// [`Kernel::start_cpu`].
    ///
    /// # Errors
    /// [`KernelError::InvalidArgument`] if `config` does not validate.
    pub fn new(config: Config, hooks: impl Hooks + 'static) -> Result<&'static Kernel, KernelError> {
        config.validate()?;
        let kernel_task = Arc::new(Task::new(TaskId(0), "kernel", None));
        let mut tasks = BTreeMap::new();
        tasks.insert(kernel_task.id(), kernel_task.clone());
        let kernel: &'static Kernel = Box::leak(Box::new(Kernel {
            cpus: (0..config.cpus)
                .map(|id| CachePadded::new(Cpu::new(id, config.ready_queues)))
                .collect(),
            threads: ThreadTable::new(config.max_threads),
            tasks: SpinLock::new(tasks),
            kernel_task,
            hooks: Box::new(hooks),
            next_tid: AtomicU64::new(1),
            next_task: AtomicU64::new(1),
            jiffies: AtomicU64::new(0),
            config,
        }));
        for cpu in kernel.cpus.iter() {
            cpu.attach(kernel);
        }
        Ok(kernel)
    }

    /// The kernel of the executing processor, if it was started.
    pub fn try_current() -> Option<&'static Kernel> {
        let _irq = InterruptGuard::new();
        Cpu::try_current().map(Cpu::kernel)
    }

    /// Turns the boot flow of processor `core` into its idle thread and
    /// starts scheduling.
    ///
    /// `init` runs on the idle thread once the processor is online, with
    /// interrupts disabled. It must not block; spawn a thread instead.
    ///
    /// # Panics
    /// Panics if the caller does not run on processor `core`, or if `core`
    /// is not one of the configured processors.
    pub fn start_cpu(&'static self, core: usize, init: impl FnOnce()) -> ! {
        let Some(state) = current_core() else {
            panic!("cpu{core} started outside of a processor.");
        };
        assert_eq!(state.id(), core, "cpu{core} started on cpu{}", state.id());
        let Some(cpu) = self.cpus.get(core) else {
            panic!("cpu{core} is not configured ({} cpus).", self.cpus.len());
        };
        let cpu: &'static Cpu = cpu;
        state.set_local(cpu as *const Cpu as usize);

        let blueprint = Blueprint {
            name: format!("idle{core}"),
            task: self.kernel_task.clone(),
            priority: self.config.ready_queues - 1,
            flags: ThreadFlags::IDLE | ThreadFlags::WIRED | ThreadFlags::UNCOUNTED,
            wired: Some(core),
            entry: None,
        };
        let idle = match self.create_thread(blueprint, false) {
            Ok((idle, _)) => idle,
            Err(e) => panic!("cpu{core}: cannot create the idle thread: {e:?}"),
        };
        let thread = self.threads.get(idle);
        thread.transition(ThreadState::Entering, ThreadState::Ready);
        thread.transition(ThreadState::Ready, ThreadState::Running);
        thread.set_last_cpu(core);
        // Safety: the boot flow is the running flow, and becomes the idle
        // thread for good.
        unsafe { platform().context_adopt(&mut *thread.context()) };
        cpu.set_idle_thread(idle);
        cpu.set_current(idle, IDLE_PRIORITY);

        interrupt::register(Vector::Timer, timer::handle_tick);
        interrupt::register(Vector::Ipi, smp::handle_ipi);

        if self.config.load_balancer {
            match ThreadBuilder::new(format!("kcpulb{core}"))
                .priority(0)
                .wire(core)
                .uncounted()
                .spawn_in(self, move || balance::kcpulb(self, core))
            {
                Ok(handle) => handle.detach(),
                Err(e) => warning!("cpu{}: no load balancer: {:?}", core, e),
            }
        }
        // Counted threads of this processor exist once it shows up online.
        cpu.online.store(true, Ordering::Release);
        info!("cpu{}: online, {} ready queues", core, self.config.ready_queues);

        init();
        unsafe { InterruptState::enable() };
        sched::idle_loop()
    }

    /// Configuration the kernel was created with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The task of every kernel thread.
    pub fn kernel_task(&self) -> &Arc<Task> {
        &self.kernel_task
    }

    pub(crate) fn hooks(&self) -> &dyn Hooks {
        &*self.hooks
    }

    /// Clock ticks since processor 0 started.
    pub fn jiffies(&self) -> u64 {
        self.jiffies.load(Ordering::Acquire)
    }

    /// Number of processors that entered the kernel.
    pub fn online_cpus(&self) -> usize {
        self.cpus.iter().filter(|cpu| cpu.is_online()).count()
    }

    /// Number of threads in the thread table, idle threads included.
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Number of live tasks, the kernel task included.
    pub fn task_count(&self) -> usize {
        let tasks = self.tasks.lock();
        let count = tasks.len();
        tasks.unlock();
        count
    }

    /// Looks a live task up.
    pub fn task(&self, id: TaskId) -> Option<Arc<Task>> {
        let tasks = self.tasks.lock();
        let task = tasks.get(&id).cloned();
        tasks.unlock();
        task
    }

    /// Creates an empty task running in `address_space`.
    ///
    /// The task goes away once the last thread spawned into it was released.
    pub fn task_create(&self, name: &str, address_space: AddressSpaceId) -> Arc<Task> {
        let id = TaskId(self.next_task.fetch_add(1, Ordering::AcqRel));
        let task = Arc::new(Task::new(id, name, Some(address_space)));
        let mut tasks = self.tasks.lock();
        tasks.insert(id, task.clone());
        tasks.unlock();
        task
    }

    /// Creates a thread in state Entering.
    ///
    /// Nothing is left behind on failure.
    pub(crate) fn create_thread(
        &self,
        blueprint: Blueprint,
        with_stack: bool,
    ) -> Result<(ThreadHandle, u64), KernelError> {
        let task = blueprint.task.clone();
        let tid = self.next_tid.fetch_add(1, Ordering::AcqRel);
        let handle = self.threads.insert(|handle| {
            let stack = if with_stack {
                Some(alloc_stack(self.config.stack_size)?)
            } else {
                None
            };
            let mut thread = Box::new(Thread::new(tid, handle, blueprint, stack));
            if with_stack {
                thread.init_context()?;
            }
            Ok(thread)
        })?;
        task.attach(handle);
        Ok((handle, tid))
    }

    /// Picks the processor whose run queue `thread` goes to.
    fn pick_cpu(&self, thread: &Thread) -> usize {
        if let Some(cpu) = thread.wired() {
            return cpu;
        }
        if let Some(cpu) = thread.last_cpu().filter(|&cpu| self.cpus[cpu].is_online()) {
            return cpu;
        }
        self.cpus
            .iter()
            .filter(|cpu| cpu.is_online())
            .min_by_key(|cpu| cpu.load())
            .map(|cpu| cpu.id)
            .or_else(|| Cpu::try_current().map(|cpu| cpu.id))
            .unwrap_or(0)
    }

    /// Puts `handle` in a run queue.
    ///
    /// The target processor is asked to reschedule if the thread is more
    /// urgent than what it runs.
    pub(crate) fn make_ready(&self, handle: ThreadHandle, wake: Wake) {
        let _irq = InterruptGuard::new();
        let thread = self.threads.get(handle);
        match wake {
            Wake::Spawned => thread.transition(ThreadState::Entering, ThreadState::Ready),
            Wake::Woken => thread.transition(ThreadState::Sleeping, ThreadState::Ready),
            Wake::Preempted => assert_eq!(
                thread.state(),
                ThreadState::Ready,
                "Thread {} requeued while not ready.",
                thread.tid
            ),
        }
        if wake != Wake::Preempted {
            thread.set_priority(thread.base_priority());
        }
        let level = thread.priority();
        let target = self.pick_cpu(thread);
        let cpu = &self.cpus[target];

        let mut rq = cpu.runq.lock();
        rq.push(level, handle);
        thread.link(Membership::Ready(target));
        cpu.nrdy.fetch_add(1, Ordering::AcqRel);
        rq.unlock();

        if level < cpu.current_priority.load(Ordering::Acquire) {
            if Cpu::try_current().is_some_and(|me| me.id == target) {
                cpu.need_resched.store(true, Ordering::Release);
            } else {
                smp::send(self, target, smp::IpiFlags::RESCHEDULE);
            }
        }
    }

    /// Buries a thread that left its processor for the last time.
    pub(crate) fn reap(&self, handle: ThreadHandle) {
        let thread = self.threads.get(handle);
        // Safety: the thread will never be dispatched again.
        unsafe { platform().context_discard(&mut *thread.context()) };
        if thread.task.exited() {
            self.hooks.task_exited(&thread.task);
        }

        let mut joiners = thread.joiners.lock();
        thread.transition(ThreadState::Exiting, ThreadState::Lingering);
        let detached = thread.detached.load(Ordering::Acquire);
        joiners.wakeup_all();
        joiners.unlock();
        if detached {
            self.release(handle);
        }
    }

    /// Lets the thread be released once it lingers.
    pub(crate) fn detach(&self, handle: ThreadHandle) {
        let thread = self.threads.get(handle);
        let joiners = thread.joiners.lock();
        thread.detached.store(true, Ordering::Release);
        let lingering = thread.state() == ThreadState::Lingering;
        joiners.unlock();
        if lingering {
            self.release(handle);
        }
    }

    /// Drops a lingering thread, and its task if it was the last member.
    ///
    /// Called exactly once per thread: by the joiner, or on exit or detach
    /// of a detached thread.
    pub(crate) fn release(&self, handle: ThreadHandle) {
        let thread = self.threads.get(handle);
        while thread.pending_timeouts.load(Ordering::Acquire) > 0 {
            platform().relax();
        }
        thread.transition(ThreadState::Lingering, ThreadState::Invalid);
        let task = thread.task.clone();
        let last = task.detach(handle);
        // Safety: the thread is in no queue, and its handle is gone from its
        // task and from every joiner.
        drop(unsafe { self.threads.remove(handle) });
        if last {
            self.hooks.task_destroy(&task);
            let mut tasks = self.tasks.lock();
            tasks.remove(&task.id());
            tasks.unlock();
        }
    }

    /// Statistics of processor `cpu`.
    ///
    /// # Errors
    /// [`KernelError::InvalidArgument`] if there is no such processor.
    pub fn cpu_stats(&self, cpu: usize) -> Result<CpuStats, KernelError> {
        let cpu = self.cpus.get(cpu).ok_or(KernelError::InvalidArgument)?;
        Ok(CpuStats::collect(self, cpu))
    }

    /// Statistics of every processor.
    pub fn stats(&self) -> Vec<CpuStats> {
        self.cpus
            .iter()
            .map(|cpu| CpuStats::collect(self, cpu))
            .collect()
    }

    /// Dumps the run queues of every online processor.
    pub fn print_runqueues(&self) {
        for cpu in self.cpus.iter().filter(|cpu| cpu.is_online()) {
            let rq = cpu.runq.lock();
            let mut line = String::new();
            for level in 0..rq.levels() {
                for handle in rq.iter_level(level) {
                    if let Some(thread) = self.threads.try_get(handle) {
                        line += &format!(" {}@{}", thread.tid, level);
                    }
                }
            }
            rq.unlock();
            info!(
                "cpu{}: {} ready, current {:?}:{}",
                cpu.id,
                cpu.nrdy.load(Ordering::Acquire),
                cpu.try_current_thread()
                    .and_then(|h| self.threads.try_get(h))
                    .map(|th| th.tid),
                line
            );
        }
    }
}

impl core::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernel")
            .field("cpus", &self.cpus.len())
            .field("online", &self.online_cpus())
            .field("threads", &self.threads.len())
            .field("max_threads", &self.threads.capacity())
            .field("jiffies", &self.jiffies())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_config() {
        assert_eq!(
            Kernel::new(Config::new().cpus(0), ()).err(),
            Some(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn failed_creation_leaves_nothing_behind() {
        let kernel = Kernel::new(Config::new().cpus(1).max_threads(3), ()).expect("valid");
        let spawned = (0..3)
            .map(|_| ThreadBuilder::new("t").create_in(kernel, || ()))
            .collect::<Vec<_>>();
        // No platform is installed: contexts cannot be initialized.
        assert!(spawned.iter().all(|r| r.is_err()));
        assert_eq!(kernel.thread_count(), 0);
        assert_eq!(kernel.kernel_task().thread_count(), 0);
    }

    #[test]
    fn tasks_are_registered() {
        let kernel = Kernel::new(Config::new().cpus(1), ()).expect("valid");
        let task = kernel.task_create("user", AddressSpaceId(7));
        assert_eq!(kernel.task_count(), 2);
        assert_eq!(kernel.task(task.id()).map(|t| t.name().len()), Some(4));
        assert_eq!(task.address_space(), Some(AddressSpaceId(7)));
    }

    #[test]
    fn debug_dumps_show_table_and_queue_state() {
        let kernel = Kernel::new(Config::new().cpus(1).max_threads(8), ()).expect("valid");
        let (handle, tid) = kernel
            .create_thread(
                Blueprint {
                    name: String::from("dumped"),
                    task: kernel.kernel_task().clone(),
                    priority: 3,
                    flags: ThreadFlags::empty(),
                    wired: None,
                    entry: None,
                },
                false,
            )
            .expect("room in the table");
        let thread = kernel.threads.get(handle);
        let dump = format!("{thread:?}");
        assert!(dump.contains(&format!("tid: {tid}")));
        assert!(dump.contains(&format!("handle: {handle:?}")));
        assert!(dump.contains("queued: None"));

        thread.link(Membership::Ready(0));
        assert!(format!("{thread:?}").contains("queued: Ready(0)"));
        thread.unlink(Membership::Ready(0));

        let dump = format!("{kernel:?}");
        assert!(dump.contains("threads: 1"));
        assert!(dump.contains("max_threads: 8"));
    }
}
