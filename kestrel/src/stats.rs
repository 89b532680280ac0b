//! Per-processor statistics.
//!
//! Every processor counts what its scheduler does in a set of relaxed
//! atomic counters. [`CpuStats`] is a snapshot of them, taken by
//! [`Kernel::cpu_stats`] or [`Kernel::stats`]. Counters are never reset.
//!
//! [`Kernel::cpu_stats`]: crate::Kernel::cpu_stats
//! [`Kernel::stats`]: crate::Kernel::stats
use crate::{Kernel, config::MAX_READY_QUEUES, cpu::Cpu};
use arrayvec::ArrayVec;
use core::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) idle_ticks: AtomicU64,
    pub(crate) busy_ticks: AtomicU64,
    pub(crate) context_switches: AtomicU64,
    pub(crate) preemptions: AtomicU64,
    pub(crate) steals: AtomicU64,
    pub(crate) migrations_in: AtomicU64,
    pub(crate) migrations_out: AtomicU64,
    pub(crate) ipis: AtomicU64,
    pub(crate) relinks: AtomicU64,
}

/// Snapshot of the statistics of one processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuStats {
    /// Processor id.
    pub id: usize,
    /// Whether the processor was started.
    pub online: bool,
    /// Ready threads, the running one excluded.
    pub ready: usize,
    /// Ready threads per level.
    pub levels: ArrayVec<usize, MAX_READY_QUEUES>,
    /// Timeouts armed on this processor.
    pub timeouts: usize,
    /// Ticks spent in the idle thread.
    pub idle_ticks: u64,
    /// Ticks spent in any other thread.
    pub busy_ticks: u64,
    /// Context switches.
    pub context_switches: u64,
    /// Context switches forced on the running thread.
    pub preemptions: u64,
    /// Threads this processor stole.
    pub steals: u64,
    /// Threads moved to this processor.
    pub migrations_in: u64,
    /// Threads moved away from this processor.
    pub migrations_out: u64,
    /// IPIs received.
    pub ipis: u64,
    /// Aging passes over the run queue.
    pub relinks: u64,
    /// Id of the running thread.
    pub current: Option<u64>,
}

impl CpuStats {
    pub(crate) fn collect(kernel: &Kernel, cpu: &Cpu) -> Self {
        let (ready, levels) = {
            let rq = cpu.runq.lock();
            let levels = (0..rq.levels())
                .map(|level| rq.level_len(level))
                .collect::<ArrayVec<_, MAX_READY_QUEUES>>();
            let ready = rq.len();
            rq.unlock();
            (ready, levels)
        };
        let timeouts = {
            let queue = cpu.timeouts.lock();
            let n = queue.len();
            queue.unlock();
            n
        };
        let c = &cpu.counters;
        Self {
            id: cpu.id,
            online: cpu.is_online(),
            ready,
            levels,
            timeouts,
            idle_ticks: c.idle_ticks.load(Ordering::Relaxed),
            busy_ticks: c.busy_ticks.load(Ordering::Relaxed),
            context_switches: c.context_switches.load(Ordering::Relaxed),
            preemptions: c.preemptions.load(Ordering::Relaxed),
            steals: c.steals.load(Ordering::Relaxed),
            migrations_in: c.migrations_in.load(Ordering::Relaxed),
            migrations_out: c.migrations_out.load(Ordering::Relaxed),
            ipis: c.ipis.load(Ordering::Relaxed),
            relinks: c.relinks.load(Ordering::Relaxed),
            current: cpu
                .try_current_thread()
                .and_then(|h| kernel.threads.try_get(h))
                .map(|th| th.tid),
        }
    }

    /// Share of ticks spent outside of the idle thread, in percent.
    pub fn utilization(&self) -> u64 {
        match self.idle_ticks + self.busy_ticks {
            0 => 0,
            total => self.busy_ticks * 100 / total,
        }
    }
}

impl core::fmt::Display for CpuStats {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "cpu{}{}: {} ready {:?}, busy {}/{} ticks ({}%), {} switches ({} preempted), \
             {} steals, migrations {} in / {} out, {} ipis, {} relinks, {} timeouts",
            self.id,
            if self.online { "" } else { " (offline)" },
            self.ready,
            self.levels.as_slice(),
            self.busy_ticks,
            self.busy_ticks + self.idle_ticks,
            self.utilization(),
            self.context_switches,
            self.preemptions,
            self.steals,
            self.migrations_in,
            self.migrations_out,
            self.ipis,
            self.relinks,
            self.timeouts,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, KernelError, thread::ThreadHandle, timer::Expiry};
    use alloc::{boxed::Box, string::ToString};

    #[test]
    fn snapshot_of_a_fresh_processor() {
        let kernel = Kernel::new(Config::new().cpus(2).ready_queues(4), ()).expect("valid");
        kernel.cpus[1].counters.busy_ticks.store(3, Ordering::Relaxed);
        kernel.cpus[1].counters.idle_ticks.store(1, Ordering::Relaxed);

        let stats = kernel.cpu_stats(1).expect("cpu1 exists");
        assert_eq!(stats.id, 1);
        assert!(!stats.online);
        assert_eq!(stats.ready, 0);
        assert_eq!(stats.levels.as_slice(), [0, 0, 0, 0]);
        assert_eq!(stats.timeouts, 0);
        assert_eq!(stats.current, None);
        assert_eq!(stats.utilization(), 75);
        assert!(stats.to_string().starts_with("cpu1 (offline): 0 ready"));

        assert_eq!(kernel.stats().len(), 2);
        assert_eq!(kernel.cpu_stats(2), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn snapshot_reads_queues_under_their_locks() {
        let kernel = Kernel::new(Config::new().cpus(1).ready_queues(4), ()).expect("valid");
        let cpu = &kernel.cpus[0];
        cpu.runq.lock().push(2, ThreadHandle::from_raw(0));
        cpu.runq.lock().push(2, ThreadHandle::from_raw(1));
        cpu.timeouts
            .lock()
            .register(5, Expiry::Callback(Box::new(|_| ())));

        let stats = kernel.cpu_stats(0).expect("cpu0 exists");
        assert_eq!(stats.ready, 2);
        assert_eq!(stats.levels.as_slice(), [0, 0, 2, 0]);
        assert_eq!(stats.timeouts, 1);
        assert!(stats.to_string().ends_with("0 relinks, 1 timeouts"));
    }
}
