//! Per-processor state.
//!
//! Every processor owns one [`Cpu`]. The platform's per-core block holds a
//! pointer to it, which is how code finds "its" processor without any
//! global variable.
use crate::{
    Kernel,
    sched::{Handoff, runq::RunQueue},
    smp::CallRecord,
    stats::Counters,
    thread::ThreadHandle,
    timer::TimeoutQueue,
};
use abyss::{interrupt::InterruptGuard, platform::current_core, spinlock::SpinLock};
use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Priority of a processor that runs its idle thread.
pub(crate) const IDLE_PRIORITY: usize = usize::MAX;

const NO_THREAD: u64 = u64::MAX;

pub(crate) struct Cpu {
    pub(crate) id: usize,
    kernel: AtomicPtr<Kernel>,
    pub(crate) runq: SpinLock<RunQueue>,
    /// Mirror of the run queue length, readable without the lock.
    pub(crate) nrdy: AtomicUsize,
    current: AtomicU64,
    idle: AtomicU64,
    pub(crate) current_priority: AtomicUsize,
    pub(crate) need_resched: AtomicBool,
    pub(crate) relink_ticks: AtomicU64,
    pub(crate) handoff: SpinLock<Option<Handoff>>,
    /// Clock ticks seen by this processor.
    pub(crate) ticks: AtomicU64,
    pub(crate) timeouts: SpinLock<TimeoutQueue>,
    pub(crate) calls: SpinLock<VecDeque<CallRecord>>,
    pub(crate) ipi_pending: AtomicU32,
    pub(crate) online: AtomicBool,
    irq_depth: AtomicUsize,
    pub(crate) counters: Counters,
}

impl Cpu {
    pub(crate) fn new(id: usize, levels: usize) -> Self {
        Self {
            id,
            kernel: AtomicPtr::new(core::ptr::null_mut()),
            runq: SpinLock::new(RunQueue::new(levels)),
            nrdy: AtomicUsize::new(0),
            current: AtomicU64::new(NO_THREAD),
            idle: AtomicU64::new(NO_THREAD),
            current_priority: AtomicUsize::new(IDLE_PRIORITY),
            need_resched: AtomicBool::new(false),
            relink_ticks: AtomicU64::new(0),
            handoff: SpinLock::new(None),
            ticks: AtomicU64::new(0),
            timeouts: SpinLock::new(TimeoutQueue::new()),
            calls: SpinLock::new(VecDeque::new()),
            ipi_pending: AtomicU32::new(0),
            online: AtomicBool::new(false),
            irq_depth: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    /// The processor executing the caller.
    ///
    /// Unless interrupts are disabled, the caller may have migrated by the
    /// time it uses the result.
    pub(crate) fn try_current() -> Option<&'static Cpu> {
        let word = current_core()?.local();
        // Safety: only `Kernel::start_cpu` sets the word, to a processor of a
        // kernel that is never freed.
        unsafe { (word as *const Cpu).as_ref() }
    }

    #[track_caller]
    pub(crate) fn current() -> &'static Cpu {
        match Self::try_current() {
            Some(cpu) => cpu,
            None => panic!("Not running on a kernel processor."),
        }
    }

    pub(crate) fn attach(&self, kernel: &'static Kernel) {
        self.kernel
            .store(kernel as *const Kernel as *mut Kernel, Ordering::Release);
    }

    pub(crate) fn kernel(&self) -> &'static Kernel {
        // Safety: attached right after the kernel was leaked.
        match unsafe { self.kernel.load(Ordering::Acquire).as_ref() } {
            Some(kernel) => kernel,
            None => unreachable!("processor {} is not attached", self.id),
        }
    }

    pub(crate) fn current_thread(&self) -> ThreadHandle {
        let raw = self.current.load(Ordering::Acquire);
        assert_ne!(raw, NO_THREAD, "cpu{} runs no thread", self.id);
        ThreadHandle::from_raw(raw)
    }

    pub(crate) fn try_current_thread(&self) -> Option<ThreadHandle> {
        match self.current.load(Ordering::Acquire) {
            NO_THREAD => None,
            raw => Some(ThreadHandle::from_raw(raw)),
        }
    }

    pub(crate) fn set_current(&self, thread: ThreadHandle, priority: usize) {
        self.current.store(thread.into_raw(), Ordering::Release);
        self.current_priority.store(priority, Ordering::Release);
    }

    pub(crate) fn idle_thread(&self) -> ThreadHandle {
        ThreadHandle::from_raw(self.idle.load(Ordering::Acquire))
    }

    pub(crate) fn set_idle_thread(&self, thread: ThreadHandle) {
        self.idle.store(thread.into_raw(), Ordering::Release);
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.current_priority.load(Ordering::Acquire) == IDLE_PRIORITY
    }

    pub(crate) fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Ready threads plus the running one, if it is not the idle thread.
    pub(crate) fn load(&self) -> usize {
        self.nrdy.load(Ordering::Acquire) + usize::from(!self.is_idle())
    }

    pub(crate) fn in_interrupt(&self) -> bool {
        self.irq_depth.load(Ordering::Acquire) > 0
    }

    pub(crate) fn enter_interrupt(&self) {
        self.irq_depth.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn leave_interrupt(&self) {
        let prev = self.irq_depth.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "Unbalanced interrupt exit on cpu{}", self.id);
    }
}

/// Handle of the thread running the caller.
#[track_caller]
pub(crate) fn current_handle() -> (&'static Kernel, ThreadHandle) {
    let _guard = InterruptGuard::new();
    let cpu = Cpu::current();
    (cpu.kernel(), cpu.current_thread())
}
