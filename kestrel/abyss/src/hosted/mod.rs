//! A shared-memory multiprocessor emulated with host threads.
//!
//! [`Machine`] brings up a number of virtual processors, each one driven by
//! whichever host thread currently holds it, and a clock that raises the
//! timer interrupt on every processor at a fixed host interval. Interrupts
//! are delivered at the points where a real processor would take them:
//! whenever interrupts become enabled, while relaxing in a busy-wait loop,
//! and while halted.
//!
//! The machine runs until a kernel thread calls [`power_off`], a kernel
//! thread panics, or the deadline passes.
//!
//! Every context but the boot flows is a host thread of its own. Discarding
//! a context unwinds its host thread off the processor and ends it.
mod context;

use crate::{
    interrupt::{Vector, do_handle_irq},
    platform::{Context, ContextEntry, ContextError, CoreState, Platform, install},
};
use bitflags::bitflags;
use std::{
    any::Any,
    cell::Cell,
    io::Write,
    sync::{
        Arc, Condvar, Mutex, OnceLock, PoisonError,
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

bitflags! {
    struct Pending: u8 {
        const TIMER = 1 << 0;
        const IPI = 1 << 1;
    }
}

thread_local! {
    static CORE: Cell<Option<&'static VirtualCpu>> = const { Cell::new(None) };
}

fn current() -> Option<&'static VirtualCpu> {
    CORE.with(Cell::get)
}

fn enter(vcpu: &'static VirtualCpu) {
    CORE.with(|core| core.set(Some(vcpu)));
}

fn leave() {
    CORE.with(|core| core.set(None));
}

fn freeze() -> ! {
    loop {
        std::thread::park();
    }
}

/// Why a machine stopped without being powered off.
#[derive(Debug)]
pub enum Failure {
    /// A kernel flow panicked with the given message.
    Panicked(String),
    /// The deadline passed before the machine was powered off.
    Hung,
}

impl core::fmt::Display for Failure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Failure::Panicked(msg) => write!(f, "kernel panicked: {msg}"),
            Failure::Hung => write!(f, "machine did not power off in time"),
        }
    }
}

struct Board {
    cpus: OnceLock<Box<[&'static VirtualCpu]>>,
    /// Contexts whose host thread is alive.
    contexts: AtomicUsize,
    stopped: AtomicBool,
    outcome: Mutex<Option<Result<(), Failure>>>,
    settled: Condvar,
}

impl Board {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn settle(&self, outcome: Result<(), Failure>) {
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(outcome);
        }
        self.stopped.store(true, Ordering::Release);
        self.settled.notify_all();
        drop(slot);
        for vcpu in self.cpus.get().into_iter().flat_map(|cpus| cpus.iter()) {
            vcpu.ring();
        }
    }

    fn fail(&self, payload: Box<dyn Any + Send>) {
        let msg = if let Some(msg) = payload.downcast_ref::<&str>() {
            (*msg).to_string()
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            msg.clone()
        } else {
            "unknown panic payload".to_string()
        };
        self.settle(Err(Failure::Panicked(msg)));
    }
}

struct VirtualCpu {
    state: CoreState,
    board: &'static Board,
    irq_enabled: AtomicBool,
    pending: AtomicU8,
    bell: Mutex<()>,
    doorbell: Condvar,
}

impl VirtualCpu {
    fn raise(&self, pending: Pending) {
        self.pending.fetch_or(pending.bits(), Ordering::AcqRel);
        self.ring();
    }

    fn ring(&self) {
        let _bell = self.bell.lock().unwrap_or_else(PoisonError::into_inner);
        self.doorbell.notify_all();
    }
}

/// Delivers interrupts pending on the executing processor.
fn poll() {
    loop {
        let Some(vcpu) = current() else { return };
        if vcpu.board.is_stopped() {
            freeze()
        }
        if !vcpu.irq_enabled.load(Ordering::Acquire) || std::thread::panicking() {
            return;
        }
        let pending = Pending::from_bits_truncate(vcpu.pending.swap(0, Ordering::AcqRel));
        let (vector, taken) = if pending.contains(Pending::TIMER) {
            (Vector::Timer, Pending::TIMER)
        } else if pending.contains(Pending::IPI) {
            (Vector::Ipi, Pending::IPI)
        } else {
            return;
        };
        let rest = pending - taken;
        vcpu.pending.fetch_or(rest.bits(), Ordering::AcqRel);
        // The handler may switch away; the flow that comes back may be
        // running on another processor, which is why the loop starts over.
        do_handle_irq(vector);
    }
}

struct Hosted;

static HOSTED: Hosted = Hosted;
static HOSTED_PLATFORM: &dyn Platform = &HOSTED;

impl Platform for Hosted {
    fn core(&self) -> Option<&'static CoreState> {
        current().map(|vcpu| &vcpu.state)
    }

    fn interrupts_enabled(&self) -> bool {
        current().is_some_and(|vcpu| vcpu.irq_enabled.load(Ordering::Acquire))
    }

    unsafe fn enable_interrupts(&self) {
        if let Some(vcpu) = current() {
            vcpu.irq_enabled.store(true, Ordering::Release);
            poll();
        }
    }

    unsafe fn disable_interrupts(&self) {
        if let Some(vcpu) = current() {
            vcpu.irq_enabled.store(false, Ordering::Release);
        }
    }

    fn relax(&self) {
        core::hint::spin_loop();
        poll();
        std::thread::yield_now();
    }

    fn halt(&self) {
        let Some(vcpu) = current() else {
            std::thread::yield_now();
            return;
        };
        unsafe { self.enable_interrupts() };
        let bell = vcpu.bell.lock().unwrap_or_else(PoisonError::into_inner);
        if vcpu.pending.load(Ordering::Acquire) == 0 && !vcpu.board.is_stopped() {
            let _ = vcpu
                .doorbell
                .wait_timeout(bell, Duration::from_millis(5))
                .unwrap_or_else(PoisonError::into_inner);
        } else {
            drop(bell);
        }
        poll();
    }

    fn send_ipi(&self, core: usize) {
        let board = match current() {
            Some(vcpu) => vcpu.board,
            None => return,
        };
        if let Some(target) = board.cpus.get().and_then(|cpus| cpus.get(core)) {
            target.raise(Pending::IPI);
        }
    }

    unsafe fn context_init(
        &self,
        ctx: &mut Context,
        entry: ContextEntry,
        arg: usize,
        stack: &mut [u8],
    ) -> Result<(), ContextError> {
        context::init(ctx, entry, arg, stack.len())
    }

    unsafe fn context_adopt(&self, ctx: &mut Context) {
        context::adopt(ctx)
    }

    unsafe fn context_switch(&self, prev: &mut Context, next: &Context) {
        context::switch(prev, next)
    }

    unsafe fn context_discard(&self, ctx: &mut Context) {
        context::discard(ctx)
    }

    fn console(&self, s: &str) {
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(s.as_bytes());
    }
}

/// Powers the machine off from a kernel flow, reporting success.
pub fn power_off() {
    if let Some(vcpu) = current() {
        vcpu.board.settle(Ok(()));
    }
}

/// Number of contexts created on the running machine whose host thread
/// did not finish yet. Zero outside of a machine.
///
/// The host thread of a context finishes once the context is discarded.
pub fn live_contexts() -> usize {
    current().map_or(0, |vcpu| vcpu.board.contexts.load(Ordering::Acquire))
}

/// A virtual multiprocessor.
///
/// # Example
/// ```ignore
/// let outcome = Machine::new(2).run(|core| kernel.start_cpu(core, || ()));
/// ```
pub struct Machine {
    cpus: usize,
    tick: Duration,
    deadline: Duration,
}

impl Machine {
    /// A machine with `cpus` processors, a 1ms clock and a 30s deadline.
    pub fn new(cpus: usize) -> Self {
        Self {
            cpus,
            tick: Duration::from_millis(1),
            deadline: Duration::from_secs(30),
        }
    }

    /// Sets the host interval between two clock ticks.
    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Sets how long the machine may run before it is considered hung.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Runs `boot(core)` on every processor until the machine stops.
    ///
    /// `boot` is expected to never return; it runs on the processor's boot
    /// flow with interrupts disabled.
    pub fn run<F>(self, boot: F) -> Result<(), Failure>
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        assert!(
            (1..=crate::MAX_CPU).contains(&self.cpus),
            "Unsupported number of processors: {}",
            self.cpus
        );
        install(&HOSTED_PLATFORM);

        let board: &'static Board = Box::leak(Box::new(Board {
            cpus: OnceLock::new(),
            contexts: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            outcome: Mutex::new(None),
            settled: Condvar::new(),
        }));
        let cpus = (0..self.cpus)
            .map(|id| {
                &*Box::leak(Box::new(VirtualCpu {
                    state: CoreState::new(id),
                    board,
                    irq_enabled: AtomicBool::new(false),
                    pending: AtomicU8::new(0),
                    bell: Mutex::new(()),
                    doorbell: Condvar::new(),
                }))
            })
            .collect::<Box<[_]>>();
        let _ = board.cpus.set(cpus);

        let tick = self.tick;
        std::thread::Builder::new()
            .name("clock".into())
            .spawn(move || {
                while !board.is_stopped() {
                    std::thread::sleep(tick);
                    for vcpu in board.cpus.get().into_iter().flat_map(|cpus| cpus.iter()) {
                        vcpu.raise(Pending::TIMER);
                    }
                }
            })
            .map_err(|e| Failure::Panicked(e.to_string()))?;

        let boot = Arc::new(boot);
        for id in 0..self.cpus {
            let boot = boot.clone();
            let vcpu = board.cpus.get().map(|cpus| cpus[id]);
            std::thread::Builder::new()
                .name(format!("cpu{id}"))
                .spawn(move || {
                    let Some(vcpu) = vcpu else { return };
                    enter(vcpu);
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        boot(id);
                    }));
                    if let Err(payload) = result {
                        if let Some(vcpu) = current() {
                            vcpu.board.fail(payload);
                        }
                    }
                    freeze()
                })
                .map_err(|e| Failure::Panicked(e.to_string()))?;
        }

        let started = Instant::now();
        let mut outcome = board.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(outcome) = outcome.take() {
                return outcome;
            }
            let elapsed = started.elapsed();
            if elapsed >= self.deadline {
                drop(outcome);
                board.settle(Err(Failure::Hung));
                return Err(Failure::Hung);
            }
            outcome = board
                .settled
                .wait_timeout(outcome, self.deadline - elapsed)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}
