//! Kernel configuration.
//!
//! A [`Config`] is built once and handed to [`Kernel::new`], which validates
//! it. The defaults follow a 100Hz clock.
//!
//! [`Kernel::new`]: crate::Kernel::new
use crate::KernelError;

/// Upper bound on the number of priority levels of a ready queue.
pub const MAX_READY_QUEUES: usize = 32;

/// Kernel configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of processors the kernel will bring up.
    pub cpus: usize,
    /// Clock ticks per second.
    pub hz: u64,
    /// Number of priority levels, level 0 being the most urgent.
    pub ready_queues: usize,
    /// Quantum of a level-0 thread, in ticks. A thread dispatched from level
    /// `i` receives `quantum_base * (i + 1)` ticks.
    pub quantum_base: u64,
    /// Ticks between two aging passes of a ready queue.
    pub aging_period: u64,
    /// Levels every waiting thread is promoted by on each aging pass.
    pub aging_step: usize,
    /// Ticks between two periodic balancing rounds.
    pub balance_interval: u64,
    /// Whether every processor runs a periodic balancer thread.
    pub load_balancer: bool,
    /// Capacity of the thread table.
    pub max_threads: usize,
    /// Size of every kernel stack, in bytes.
    pub stack_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// A four processor configuration with the default tunables.
    pub const fn new() -> Self {
        Self {
            cpus: 4,
            hz: 100,
            ready_queues: 16,
            quantum_base: 1,
            aging_period: 10,
            aging_step: 1,
            balance_interval: 100,
            load_balancer: true,
            max_threads: 1024,
            stack_size: 16 * 1024,
        }
    }

    /// Sets the number of processors.
    pub const fn cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus;
        self
    }

    /// Sets the number of priority levels.
    pub const fn ready_queues(mut self, levels: usize) -> Self {
        self.ready_queues = levels;
        self
    }

    /// Sets the level-0 quantum.
    pub const fn quantum_base(mut self, ticks: u64) -> Self {
        self.quantum_base = ticks;
        self
    }

    /// Sets the aging cadence and step.
    pub const fn aging(mut self, period: u64, step: usize) -> Self {
        self.aging_period = period;
        self.aging_step = step;
        self
    }

    /// Turns the periodic balancer on or off and sets its interval.
    pub const fn load_balancer(mut self, enabled: bool, interval: u64) -> Self {
        self.load_balancer = enabled;
        self.balance_interval = interval;
        self
    }

    /// Sets the capacity of the thread table.
    pub const fn max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Sets the kernel stack size.
    pub const fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Priority level new threads get unless told otherwise.
    pub fn default_priority(&self) -> usize {
        self.ready_queues / 2
    }

    /// Quantum of a thread dispatched from `level`.
    ///
    /// Cannot overflow for a level of a validated configuration.
    pub fn quantum(&self, level: usize) -> u64 {
        self.quantum_base * (level as u64 + 1)
    }

    /// Checks every field against its legal range.
    pub fn validate(&self) -> Result<(), KernelError> {
        let ok = (1..=crate::MAX_CPU).contains(&self.cpus)
            && (1..=MAX_READY_QUEUES).contains(&self.ready_queues)
            && self.hz > 0
            && self.quantum_base > 0
            && self.quantum_base.checked_mul(self.ready_queues as u64).is_some()
            && self.aging_period > 0
            && self.aging_step > 0
            && self.balance_interval > 0
            && self.max_threads > self.cpus
            && self.max_threads <= u32::MAX as usize
            && self.stack_size >= 4096;
        if ok {
            Ok(())
        } else {
            Err(KernelError::InvalidArgument)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantum_grows_with_level() {
        let config = Config::new().quantum_base(2);
        assert_eq!(config.quantum(0), 2);
        assert_eq!(config.quantum(3), 8);
    }

    #[test]
    fn rejects_nonsense() {
        assert!(Config::new().validate().is_ok());
        assert_eq!(
            Config::new().cpus(0).validate(),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            Config::new().ready_queues(MAX_READY_QUEUES + 1).validate(),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            Config::new().cpus(4).max_threads(4).validate(),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn quantum_of_the_last_level_must_fit() {
        let levels = 16;
        let fits = Config::new().ready_queues(levels).quantum_base(u64::MAX / levels as u64);
        assert!(fits.validate().is_ok());
        assert_eq!(fits.quantum(levels - 1), u64::MAX / 16 * 16);

        let overflows = fits.quantum_base(u64::MAX / levels as u64 + 1);
        assert_eq!(overflows.validate(), Err(KernelError::InvalidArgument));
    }
}
