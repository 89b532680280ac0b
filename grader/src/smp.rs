//! Inter-processor interrupts and remote calls.
use crate::wait_until;
use abyss::hosted::Failure;
use kestrel::{
    Kernel, KernelError,
    smp::{self, CpuSet, Ipi},
    sync::{SleepResult, WaitQueue},
    task::Hooks,
    thread::{Current, ThreadBuilder},
};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

/// `smp_call` runs on the requested processor and returns its result.
pub fn remote_call(kernel: &'static Kernel) {
    let cpus = kernel.config().cpus;
    for cpu in 0..cpus {
        assert_eq!(smp::smp_call(cpu, |irq| irq.cpu_id()), Ok(cpu));
    }
    let data = Arc::new(AtomicUsize::new(0));
    for cpu in 0..cpus {
        let data = data.clone();
        smp::smp_call(cpu, move |irq| {
            data.fetch_add(irq.cpu_id(), Ordering::AcqRel);
        })
        .expect("online");
    }
    assert_eq!(data.load(Ordering::Acquire), (0..cpus).sum::<usize>());

    assert_eq!(
        smp::smp_call(cpus, |_| ()),
        Err(KernelError::InvalidArgument)
    );
    assert!(kernel.stats().iter().map(|cpu| cpu.ipis).sum::<u64>() > 0);
}

/// Queued remote calls run on their processor and may wake threads.
pub fn async_call(kernel: &'static Kernel) {
    let target = kernel.config().cpus - 1;
    let queue = Arc::new(WaitQueue::new());
    {
        let queue = queue.clone();
        smp::smp_call_async(target, move |irq| {
            assert_eq!(irq.cpu_id(), target);
            irq.wakeup_one(&queue);
        })
        .expect("online");
    }
    assert_eq!(queue.sleep(Some(1000), false), SleepResult::Woken);
}

#[derive(Default)]
pub struct Shootdowns(Arc<AtomicUsize>);

impl Hooks for Shootdowns {
    fn tlb_shootdown(&self, _cpu: usize) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }
}

/// Broadcasts reach every other online processor.
pub fn broadcast(kernel: &'static Kernel, shootdowns: Arc<AtomicUsize>) {
    let cpus = kernel.config().cpus;
    let calls = Arc::new(AtomicUsize::new(0));
    let sent = {
        let calls = calls.clone();
        smp::ipi_broadcast(Ipi::Call(Arc::new(move |_irq: &kestrel::interrupt::IrqContext| {
            calls.fetch_add(1, Ordering::AcqRel);
        })))
        .expect("running on a kernel processor")
    };
    assert_eq!(sent, cpus - 1);
    wait_until(kernel, 1000, "every call to run", || {
        calls.load(Ordering::Acquire) == cpus - 1
    });

    assert_eq!(smp::ipi_send(CpuSet::first(cpus), Ipi::Shootdown), Ok(()));
    wait_until(kernel, 1000, "every shootdown", || {
        shootdowns.load(Ordering::Acquire) == cpus
    });
    assert_eq!(smp::ipi_send(CpuSet::single(0), Ipi::Reschedule), Ok(()));
    assert_eq!(
        smp::ipi_send(CpuSet::first(cpus + 1), Ipi::Shootdown),
        Err(KernelError::InvalidArgument)
    );
    // Nothing was sent on failure.
    Current::sleep(5);
    assert_eq!(shootdowns.load(Ordering::Acquire), cpus);
}

/// Runs [`broadcast`] with a kernel counting shootdowns.
pub fn run_broadcast(cpus: usize) -> Result<(), Failure> {
    let shootdowns = Shootdowns::default();
    let counter = shootdowns.0.clone();
    crate::run_with(
        kestrel::Config::new().cpus(cpus),
        shootdowns,
        move |kernel| broadcast(kernel, counter),
    )
}

/// A processor handles an `smp_call` aimed at itself without an IPI.
pub fn local_call(_kernel: &'static Kernel) {
    let handle = ThreadBuilder::new("local")
        .spawn(|| {
            let pin = Current::pin();
            let me = Current::cpu();
            drop(pin);
            // May have migrated meanwhile; the call still goes to `me`.
            assert_eq!(smp::smp_call(me, |irq| irq.cpu_id()), Ok(me));
        })
        .expect("spawn");
    assert_eq!(handle.join(), Ok(0));
}
