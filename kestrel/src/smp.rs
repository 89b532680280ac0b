//! Inter-processor interrupts and remote calls.
//!
//! An IPI carries one of three messages:
//! - [`Ipi::Reschedule`]: the target re-runs its scheduler at the end of the
//!   interrupt,
//! - [`Ipi::Shootdown`]: the target calls [`Hooks::tlb_shootdown`],
//! - [`Ipi::Call`]: the target runs a function in interrupt context.
//!
//! Delivery is fire-and-forget. A processor inside a critical section has
//! its interrupts disabled and takes the IPI once it leaves it.
//!
//! [`smp_call`] runs a function on another processor and waits for its
//! result:
//!
//! ```ignore
//! let id = smp::smp_call(1, |irq| irq.cpu_id())?;
//! assert_eq!(id, 1);
//! ```
//!
//! [`Hooks::tlb_shootdown`]: crate::task::Hooks::tlb_shootdown
use crate::{
    Kernel, KernelError, MAX_CPU,
    cpu::Cpu,
    interrupt::IrqContext,
    sched,
    thread::Current,
};
use abyss::{interrupt::InterruptGuard, platform::platform, spinlock::SpinLock};
use alloc::{boxed::Box, sync::Arc};
use bitflags::bitflags;
use core::sync::atomic::{AtomicBool, Ordering};

/// A set of processors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuSet(u64);

impl CpuSet {
    /// No processor.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Processors `0..n`.
    pub const fn first(n: usize) -> Self {
        if n >= MAX_CPU {
            Self(u64::MAX)
        } else {
            Self((1 << n) - 1)
        }
    }

    /// Processor `cpu` only.
    pub const fn single(cpu: usize) -> Self {
        assert!(cpu < MAX_CPU, "cpu is beyond MAX_CPU");
        Self(1 << cpu)
    }

    /// Adds `cpu`.
    pub fn insert(&mut self, cpu: usize) {
        assert!(cpu < MAX_CPU, "cpu{cpu} is beyond MAX_CPU");
        self.0 |= 1 << cpu;
    }

    /// Removes `cpu`.
    pub fn remove(&mut self, cpu: usize) {
        if cpu < MAX_CPU {
            self.0 &= !(1 << cpu);
        }
    }

    /// Whether `cpu` is in the set.
    pub fn contains(&self, cpu: usize) -> bool {
        cpu < MAX_CPU && self.0 & (1 << cpu) != 0
    }

    /// Number of processors in the set.
    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Processors of the set in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_CPU).filter(move |&cpu| self.contains(cpu))
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = CpuSet::empty();
        for cpu in iter {
            set.insert(cpu);
        }
        set
    }
}

bitflags! {
    /// Requests pending on a processor, besides remote calls.
    pub(crate) struct IpiFlags: u32 {
        const RESCHEDULE = 1 << 0;
        const SHOOTDOWN = 1 << 1;
    }
}

/// A message sent to other processors.
#[derive(Clone)]
pub enum Ipi {
    /// Reschedule at the end of the interrupt.
    Reschedule,
    /// Invalidate stale translations.
    Shootdown,
    /// Run a function in interrupt context.
    Call(Arc<dyn Fn(&IrqContext) + Send + Sync>),
}

impl core::fmt::Debug for Ipi {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Ipi::Reschedule => write!(f, "Reschedule"),
            Ipi::Shootdown => write!(f, "Shootdown"),
            Ipi::Call(_) => write!(f, "Call(..)"),
        }
    }
}

/// A remote call waiting for its processor.
pub(crate) struct CallRecord {
    func: Box<dyn FnOnce(&IrqContext) + Send>,
    done: Option<Arc<AtomicBool>>,
}

fn target(kernel: &Kernel, cpu: usize) -> Result<&Cpu, KernelError> {
    match kernel.cpus.get(cpu) {
        Some(target) if target.is_online() => Ok(&**target),
        _ => Err(KernelError::InvalidArgument),
    }
}

/// Raises `flags` on `cpu` and interrupts it.
pub(crate) fn send(kernel: &Kernel, cpu: usize, flags: IpiFlags) {
    kernel.cpus[cpu]
        .ipi_pending
        .fetch_or(flags.bits(), Ordering::AcqRel);
    platform().send_ipi(cpu);
}

fn enqueue(kernel: &Kernel, cpu: usize, record: CallRecord) {
    let mut calls = kernel.cpus[cpu].calls.lock();
    calls.push_back(record);
    calls.unlock();
    platform().send_ipi(cpu);
}

/// Sends `ipi` to every processor of `targets`.
///
/// # Errors
/// - [`KernelError::InvalidArgument`] if a target is not an online
///   processor; nothing was sent then.
/// - [`KernelError::OperationNotPermitted`] outside of a kernel processor.
pub fn ipi_send(targets: CpuSet, ipi: Ipi) -> Result<(), KernelError> {
    let kernel = Kernel::try_current().ok_or(KernelError::OperationNotPermitted)?;
    for cpu in targets.iter() {
        target(kernel, cpu)?;
    }
    for cpu in targets.iter() {
        match &ipi {
            Ipi::Reschedule => send(kernel, cpu, IpiFlags::RESCHEDULE),
            Ipi::Shootdown => send(kernel, cpu, IpiFlags::SHOOTDOWN),
            Ipi::Call(f) => {
                let f = f.clone();
                enqueue(
                    kernel,
                    cpu,
                    CallRecord {
                        func: Box::new(move |irq| f(irq)),
                        done: None,
                    },
                );
            }
        }
    }
    Ok(())
}

/// Sends `ipi` to every other online processor.
///
/// Returns the number of processors the message went to.
///
/// # Errors
/// [`KernelError::OperationNotPermitted`] outside of a kernel processor.
pub fn ipi_broadcast(ipi: Ipi) -> Result<usize, KernelError> {
    let kernel = Kernel::try_current().ok_or(KernelError::OperationNotPermitted)?;
    let me = {
        let _irq = InterruptGuard::new();
        Cpu::current().id
    };
    let targets = kernel
        .cpus
        .iter()
        .filter(|cpu| cpu.id != me && cpu.is_online())
        .map(|cpu| cpu.id)
        .collect::<CpuSet>();
    ipi_send(targets, ipi)?;
    Ok(targets.len())
}

/// Runs `f` on processor `cpu` in interrupt context and returns its result.
///
/// Runs `f` right away if `cpu` is the executing processor.
///
/// # Errors
/// - [`KernelError::InvalidArgument`] if `cpu` is not an online processor.
/// - [`KernelError::OperationNotPermitted`] outside of a kernel processor.
///
/// # Panics
/// Panics if called from interrupt context or with interrupts disabled.
pub fn smp_call<R, F>(cpu: usize, f: F) -> Result<R, KernelError>
where
    R: Send + 'static,
    F: FnOnce(&IrqContext) -> R + Send + 'static,
{
    let kernel = Kernel::try_current().ok_or(KernelError::OperationNotPermitted)?;
    let dest = target(kernel, cpu)?;
    sched::assert_thread_context();
    assert_eq!(
        InterruptGuard::depth(),
        0,
        "smp_call with interrupts disabled never completes."
    );

    let pin = Current::pin();
    if Current::cpu() == cpu {
        let _irq = InterruptGuard::new();
        let irq = IrqContext::enter(dest);
        let r = f(&irq);
        drop(irq);
        drop(pin);
        return Ok(r);
    }
    drop(pin);

    let result = Arc::new(SpinLock::new(None));
    let done = Arc::new(AtomicBool::new(false));
    let slot = result.clone();
    enqueue(
        kernel,
        cpu,
        CallRecord {
            func: Box::new(move |irq| {
                let r = f(irq);
                let mut slot = slot.lock();
                *slot = Some(r);
                slot.unlock();
            }),
            done: Some(done.clone()),
        },
    );
    while !done.load(Ordering::Acquire) {
        platform().relax();
    }

    let mut slot = result.lock();
    let r = slot.take();
    slot.unlock();
    match r {
        Some(r) => Ok(r),
        None => unreachable!("remote call on cpu{cpu} completed without a result"),
    }
}

/// Queues `f` to run on processor `cpu` in interrupt context, without
/// waiting for it.
///
/// # Errors
/// See [`smp_call`].
pub fn smp_call_async<F>(cpu: usize, f: F) -> Result<(), KernelError>
where
    F: FnOnce(&IrqContext) + Send + 'static,
{
    let kernel = Kernel::try_current().ok_or(KernelError::OperationNotPermitted)?;
    target(kernel, cpu)?;
    enqueue(
        kernel,
        cpu,
        CallRecord {
            func: Box::new(f),
            done: None,
        },
    );
    Ok(())
}

/// IPI handler.
pub(crate) fn handle_ipi() {
    {
        let cpu = Cpu::current();
        let kernel = cpu.kernel();
        let irq = IrqContext::enter(cpu);
        cpu.counters.ipis.fetch_add(1, Ordering::Relaxed);

        let pending = IpiFlags::from_bits_truncate(cpu.ipi_pending.swap(0, Ordering::AcqRel));
        if pending.contains(IpiFlags::RESCHEDULE) {
            cpu.need_resched.store(true, Ordering::Release);
        }
        if pending.contains(IpiFlags::SHOOTDOWN) {
            kernel.hooks().tlb_shootdown(cpu.id);
        }
        loop {
            let record = {
                let mut calls = cpu.calls.lock();
                let record = calls.pop_front();
                calls.unlock();
                record
            };
            let Some(CallRecord { func, done }) = record else {
                break;
            };
            func(&irq);
            if let Some(done) = done {
                done.store(true, Ordering::Release);
            }
        }
    }
    sched::preempt_check(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn set_membership() {
        let mut set = CpuSet::empty();
        assert!(set.is_empty());
        set.insert(0);
        set.insert(5);
        set.insert(63);
        assert_eq!(set.len(), 3);
        assert!(set.contains(5) && !set.contains(4));
        assert!(!set.contains(64));
        set.remove(5);
        assert_eq!(set.iter().collect::<Vec<_>>(), [0, 63]);
    }

    #[test]
    fn first_n_processors() {
        assert_eq!(CpuSet::first(0), CpuSet::empty());
        assert_eq!(CpuSet::first(3).iter().collect::<Vec<_>>(), [0, 1, 2]);
        assert_eq!(CpuSet::first(MAX_CPU).len(), MAX_CPU);
        assert_eq!([2, 2, 7].into_iter().collect::<CpuSet>().len(), 2);
        assert_eq!(CpuSet::single(4).iter().next(), Some(4));
        assert_eq!(CpuSet::single(MAX_CPU - 1).len(), 1);
    }

    #[test]
    #[should_panic(expected = "beyond MAX_CPU")]
    fn single_rejects_out_of_range() {
        let _ = CpuSet::single(MAX_CPU);
    }
}
