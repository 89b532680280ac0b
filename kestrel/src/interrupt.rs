//! Interrupt context.
//!
//! Interrupt handlers, timeout callbacks and remote calls run on whatever
//! thread the processor was executing, and must neither sleep nor take a
//! lock a thread could hold while sleeping. They receive an [`IrqContext`]
//! instead of running the full thread API: it only offers operations that
//! never block.
//!
//! ```ignore
//! timer::register(5, move |irq| {
//!     irq.wakeup_one(&queue);
//!     irq.request_reschedule();
//! });
//! ```
use crate::{
    cpu::Cpu,
    sync::WaitQueue,
    thread::JoinHandle,
    timer::{self, Timeout},
};
use alloc::boxed::Box;
use core::{marker::PhantomData, sync::atomic::Ordering};

/// Capability of code running in interrupt context.
///
/// Only the kernel creates one, for the duration of a handler.
pub struct IrqContext {
    cpu: &'static Cpu,
    _not_send: PhantomData<*const ()>,
}

impl IrqContext {
    pub(crate) fn enter(cpu: &'static Cpu) -> Self {
        cpu.enter_interrupt();
        Self {
            cpu,
            _not_send: PhantomData,
        }
    }

    /// Processor handling the interrupt.
    pub fn cpu_id(&self) -> usize {
        self.cpu.id
    }

    /// Clock ticks since processor 0 started.
    pub fn jiffies(&self) -> u64 {
        self.cpu.kernel().jiffies()
    }

    /// Wakes the oldest sleeper of `queue`, or remembers the wakeup.
    pub fn wakeup_one(&self, queue: &WaitQueue) -> bool {
        queue.wakeup_one()
    }

    /// Wakes every sleeper of `queue`.
    pub fn wakeup_all(&self, queue: &WaitQueue) -> usize {
        queue.wakeup_all()
    }

    /// Interrupts the thread of `handle`; see [`JoinHandle::interrupt`].
    pub fn interrupt(&self, handle: &JoinHandle) -> bool {
        handle.interrupt()
    }

    /// Makes the interrupted thread go through the scheduler once the
    /// interrupt is over.
    pub fn request_reschedule(&self) {
        self.cpu.need_resched.store(true, Ordering::Release);
    }

    /// Registers a timeout on this processor; see [`timer::register`].
    pub fn timeout_register<F>(&self, ticks: u64, f: F) -> Timeout
    where
        F: FnOnce(&IrqContext) + Send + 'static,
    {
        timer::register_on(self.cpu, ticks, Box::new(f))
    }
}

impl Drop for IrqContext {
    fn drop(&mut self) {
        self.cpu.leave_interrupt();
    }
}
