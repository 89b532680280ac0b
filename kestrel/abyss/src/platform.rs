//! The machine underneath the kernel.
//!
//! Every operation the scheduler core needs from a processor goes through the
//! [`Platform`] trait: interrupt masking, halting, inter-processor interrupts
//! and execution context management. A platform is installed once at boot
//! with [`install`]; until then a placeholder that has no processors is in
//! effect, which keeps code that merely touches a [`SpinLock`] usable from
//! plain host unit tests.
//!
//! [`SpinLock`]: crate::spinlock::SpinLock
use crate::interrupt::Nesting;
use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, AtomicUsize, Ordering};

/// Entry point of a freshly initialized execution context.
///
/// The argument is the opaque word passed to [`Platform::context_init`].
pub type ContextEntry = fn(usize) -> !;

/// Saved execution state of a kernel thread.
///
/// The kernel owns the storage while the platform owns the meaning of
/// `frame`. The interrupt nesting of the flow that owns the context is saved
/// alongside it by [`switch_context`] so that it follows the flow when it
/// resumes on another core.
#[derive(Debug, Default)]
pub struct Context {
    /// Platform defined frame word.
    pub frame: usize,
    nesting: Nesting,
}

/// A platform could not set up a new execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextError;

/// Per-core state shared between the platform and the kernel.
///
/// The platform allocates one for each processor and hands it out from
/// [`Platform::core`] to code running on that processor.
pub struct CoreState {
    id: usize,
    nesting_count: AtomicIsize,
    nesting_initial: AtomicBool,
    local: AtomicUsize,
}

impl CoreState {
    /// Creates the state of core `id`.
    pub const fn new(id: usize) -> Self {
        Self {
            id,
            nesting_count: AtomicIsize::new(0),
            nesting_initial: AtomicBool::new(true),
            local: AtomicUsize::new(0),
        }
    }

    /// Index of this core.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Kernel-owned word attached to this core, or 0 when unset.
    #[inline]
    pub fn local(&self) -> usize {
        self.local.load(Ordering::Acquire)
    }

    /// Attaches a kernel-owned word to this core.
    #[inline]
    pub fn set_local(&self, word: usize) {
        self.local.store(word, Ordering::Release);
    }

    pub(crate) fn push_nesting(&self, was_enabled: bool) {
        if self.nesting_count.fetch_add(1, Ordering::SeqCst) == 0 {
            self.nesting_initial.store(was_enabled, Ordering::SeqCst);
        }
    }

    /// Returns true if the outermost guard was the last one and interrupts
    /// must be turned back on.
    pub(crate) fn pop_nesting(&self) -> bool {
        let prev = self.nesting_count.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "Mismatched InterruptGuard drop calls: {prev}");
        prev == 1 && self.nesting_initial.load(Ordering::SeqCst)
    }

    pub(crate) fn nesting_depth(&self) -> isize {
        self.nesting_count.load(Ordering::SeqCst)
    }

    pub(crate) fn nesting(&self) -> Nesting {
        Nesting {
            count: self.nesting_count.load(Ordering::SeqCst),
            initial: self.nesting_initial.load(Ordering::SeqCst),
        }
    }

    pub(crate) fn set_nesting(&self, nesting: Nesting) {
        self.nesting_initial.store(nesting.initial, Ordering::SeqCst);
        self.nesting_count.store(nesting.count, Ordering::SeqCst);
    }
}

/// A multiprocessor the kernel can run on.
pub trait Platform: Sync {
    /// State of the core executing the caller, if the caller runs on one.
    fn core(&self) -> Option<&'static CoreState>;

    /// Whether the executing core currently accepts interrupts.
    fn interrupts_enabled(&self) -> bool;

    /// Lets the executing core accept interrupts again.
    ///
    /// Pending interrupts may be delivered before this returns.
    unsafe fn enable_interrupts(&self);

    /// Masks interrupts on the executing core.
    unsafe fn disable_interrupts(&self);

    /// Called from inside busy-wait loops.
    fn relax(&self);

    /// Puts the executing core to sleep until the next interrupt.
    fn halt(&self);

    /// Sends the inter-processor interrupt vector to `core`.
    fn send_ipi(&self, core: usize);

    /// Prepares `ctx` so that switching to it calls `entry(arg)` on `stack`.
    unsafe fn context_init(
        &self,
        ctx: &mut Context,
        entry: ContextEntry,
        arg: usize,
        stack: &mut [u8],
    ) -> Result<(), ContextError>;

    /// Turns the running flow of control into `ctx`.
    ///
    /// Used once per core to give the boot flow a context it can be resumed
    /// through.
    unsafe fn context_adopt(&self, ctx: &mut Context);

    /// Saves the running flow into `prev` and resumes `next`.
    ///
    /// Returns when some core switches back to `prev`.
    unsafe fn context_switch(&self, prev: &mut Context, next: &Context);

    /// Releases every platform resource held by a context that will never
    /// run again.
    unsafe fn context_discard(&self, ctx: &mut Context);

    /// Writes `s` to the console.
    fn console(&self, s: &str);
}

/// A platform without processors.
struct Nowhere;

impl Platform for Nowhere {
    fn core(&self) -> Option<&'static CoreState> {
        None
    }

    fn interrupts_enabled(&self) -> bool {
        false
    }

    unsafe fn enable_interrupts(&self) {}

    unsafe fn disable_interrupts(&self) {}

    fn relax(&self) {
        core::hint::spin_loop();
    }

    fn halt(&self) {
        core::hint::spin_loop();
    }

    fn send_ipi(&self, _core: usize) {}

    unsafe fn context_init(
        &self,
        _ctx: &mut Context,
        _entry: ContextEntry,
        _arg: usize,
        _stack: &mut [u8],
    ) -> Result<(), ContextError> {
        Err(ContextError)
    }

    unsafe fn context_adopt(&self, _ctx: &mut Context) {
        panic!("No platform is installed.");
    }

    unsafe fn context_switch(&self, _prev: &mut Context, _next: &Context) {
        panic!("No platform is installed.");
    }

    unsafe fn context_discard(&self, _ctx: &mut Context) {}

    fn console(&self, _s: &str) {}
}

static NOWHERE: Nowhere = Nowhere;
static PLATFORM: AtomicPtr<&'static dyn Platform> = AtomicPtr::new(core::ptr::null_mut());

/// Installs the platform.
///
/// The first installation wins. Returns false if a different platform was
/// already installed.
pub fn install(platform: &'static &'static dyn Platform) -> bool {
    let new = platform as *const &'static dyn Platform as *mut &'static dyn Platform;
    match PLATFORM.compare_exchange(
        core::ptr::null_mut(),
        new,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => true,
        Err(prev) => core::ptr::eq(prev, new),
    }
}

/// The installed platform.
#[inline]
pub fn platform() -> &'static dyn Platform {
    let ptr = PLATFORM.load(Ordering::Acquire);
    if ptr.is_null() {
        &NOWHERE
    } else {
        // Safety: only `&'static` references are ever stored.
        unsafe { *ptr }
    }
}

/// State of the core executing the caller.
#[inline]
pub fn current_core() -> Option<&'static CoreState> {
    platform().core()
}

/// Switches from `prev` to `next`, carrying the interrupt nesting of the
/// running flow along with `prev`.
///
/// # Safety
/// `prev` must be the context of the running flow, and `next` a context
/// that was initialized or adopted and is not running anywhere.
pub unsafe fn switch_context(prev: &mut Context, next: &Context) {
    if let Some(core) = current_core() {
        prev.nesting = core.nesting();
    }
    unsafe { platform().context_switch(prev, next) };
    // Possibly on another core from here on.
    if let Some(core) = current_core() {
        core.set_nesting(prev.nesting);
    }
}

/// Resets the interrupt nesting of the executing core for a context that
/// just started at its entry point.
///
/// # Safety
/// Must be called first thing from a [`ContextEntry`], while interrupts are
/// still disabled.
pub unsafe fn begin_context() {
    if let Some(core) = current_core() {
        core.set_nesting(Nesting::default());
    }
}
