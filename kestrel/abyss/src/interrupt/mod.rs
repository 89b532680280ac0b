//! Interrupt
#[cfg(doc)]
use crate::spinlock::SpinLockGuard;
use crate::{platform::platform, spinlock::SpinLock};
use core::{marker::PhantomData, sync::atomic::Ordering};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Interrupt nesting of a flow of control.
///
/// `count` is the number of live [`InterruptGuard`]s and `initial` the
/// interrupt state observed when the outermost one was created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nesting {
    pub(crate) count: isize,
    pub(crate) initial: bool,
}

impl Default for Nesting {
    fn default() -> Self {
        Self {
            count: 0,
            initial: true,
        }
    }
}

/// Enumeration representing the interrupt state.
#[derive(PartialEq, Eq, Debug)]
pub enum InterruptState {
    /// Interrupts are enabled.
    On,
    /// Interrupts are disabled.
    Off,
}

impl InterruptState {
    /// Reads the current interrupt state.
    ///
    /// # Returns
    /// - [`InterruptState::On`] if interrupts are enabled.
    /// - [`InterruptState::Off`] if interrupts are disabled.
    pub fn current() -> Self {
        if platform().interrupts_enabled() {
            Self::On
        } else {
            Self::Off
        }
    }

    pub unsafe fn enable() {
        unsafe { platform().enable_interrupts() }
    }

    pub unsafe fn disable() {
        unsafe { platform().disable_interrupts() }
    }
}

/// An RAII-based guard for managing interrupt disabling.
///
/// When an `InterruptGuard` is created, interrupts are disabled. When it is
/// dropped, the interrupt state is restored to what it was before the guard was
/// created.
///
/// **Important:**
/// - [`InterruptGuard`] instances **must be dropped in reverse order of their
///   creation** to prevent unintended interrupt state changes.
/// - Due to Rust's ownership and scoping rules, this invariant is naturally
///   upheld unless `drop()` is explicitly called prematurely or an
///   [`InterruptGuard`] is stored in a struct field.
///
/// The nesting is tracked per flow of control rather than per core: a guard
/// that is alive across a context switch is dropped on whichever core the flow
/// resumed on, and the count it decrements is the one that travelled with it.
///
/// This structure is created using [`InterruptGuard::new`].
pub struct InterruptGuard {
    _not_send: PhantomData<*const ()>,
}

impl InterruptGuard {
    /// Creates a new `InterruptGuard`, disabling interrupts.
    ///
    /// # Behavior
    /// - Saves the current interrupt state.
    /// - Disables interrupts.
    ///
    /// # Returns
    /// A new instance of `InterruptGuard`, which will restore the original
    /// interrupt state when dropped.
    ///
    /// # Example
    /// ```ignore
    /// let _guard = InterruptGuard::new(); // Disables interrupts
    /// // Critical section...
    /// // Interrupts are restored when `_guard` goes out of scope.
    /// ```
    pub fn new() -> Self {
        let state = InterruptState::current();
        unsafe { InterruptState::disable() };
        core::sync::atomic::fence(Ordering::SeqCst);

        if let Some(core) = platform().core() {
            core.push_nesting(state == InterruptState::On);
        }

        Self {
            _not_send: PhantomData,
        }
    }

    /// Forgets the guard without touching the interrupt state.
    pub fn consume(self) {
        if let Some(core) = platform().core() {
            let _ = core.pop_nesting();
        }
        core::mem::forget(self);
    }

    /// Whether any guard is alive on the executing flow.
    pub fn is_guarded() -> bool {
        platform()
            .core()
            .is_some_and(|core| core.nesting_depth() > 0)
    }

    /// Number of guards alive on the executing flow.
    pub fn depth() -> isize {
        platform().core().map_or(0, |core| core.nesting_depth())
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if let Some(core) = platform().core() {
            if core.pop_nesting() {
                unsafe { InterruptState::enable() };
            }
        }
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

/// Interrupt vectors the kernel can handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Vector {
    /// Periodic clock tick.
    Timer = 32,
    /// Inter-processor interrupt.
    Ipi = 127,
}

impl Vector {
    fn slot(self) -> usize {
        match self {
            Vector::Timer => 0,
            Vector::Ipi => 1,
        }
    }
}

/// Interrupt handler.
pub type Handler = fn();

static HANDLERS: [SpinLock<Option<Handler>>; 2] = [const { SpinLock::new(None) }; 2];

/// Registers `handler` for `vector`, replacing the previous one.
pub fn register(vector: Vector, handler: Handler) {
    let mut guard = HANDLERS[vector.slot()].lock();
    *guard = Some(handler);
    guard.unlock();
}

/// Dispatches `vector` to its handler with interrupts disabled.
///
/// Called by the platform when it delivers an interrupt.
pub fn do_handle_irq(vector: Vector) {
    let _guard = InterruptGuard::new();
    let handler = {
        let guard = HANDLERS[vector.slot()].lock();
        let handler = *guard;
        guard.unlock();
        handler
    };
    match handler {
        Some(handler) => handler(),
        None => warning!("Spurious interrupt: {:?}", vector),
    }
}
