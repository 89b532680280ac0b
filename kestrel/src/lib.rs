//! # Kestrel: an SMP preemptive kernel scheduler core
//!
//! Kestrel is the thread management and scheduling core of a symmetric
//! multiprocessing kernel. It provides
//!
//! - kernel threads grouped into tasks, with a strict lifecycle
//!   (`Entering → Ready → Running → Sleeping/Exiting → Lingering`),
//! - a per-processor multi-level feedback queue with aging against
//!   starvation,
//! - load balancing between processors, on demand from idle processors and
//!   periodically from a per-processor balancer thread (`kcpulb`),
//! - blocking synchronization built on a single primitive, the [`WaitQueue`],
//!   which supports timeouts, interruption and counts missed wakeups,
//! - inter-processor interrupts and remote function calls,
//! - per-processor statistics,
//! - work queues that run deferred functions on a pool of kernel threads.
//!
//! Everything that touches the hardware is reached through the
//! [`abyss`] platform layer, which also provides a hosted multiprocessor so
//! that the kernel runs as an ordinary host program in tests.
//!
//! ## Execution contexts
//!
//! Code runs either in *thread context* or in *interrupt context*. The two
//! expose different capabilities: interrupt handlers and timeout callbacks
//! receive an [`IrqContext`], which can wake threads and request
//! rescheduling but has no way to block. Blocking operations assert that
//! they are called from a thread that holds no spin lock.
//!
//! ## Bringing up a kernel
//!
//! ```ignore
//! let kernel = Kernel::new(Config::new().cpus(4), ())?;
//! // On each processor, from its boot flow:
//! kernel.start_cpu(core, || {
//!     if core == 0 {
//!         ThreadBuilder::new("init").spawn(init).unwrap().detach();
//!     }
//! });
//! ```
//!
//! [`WaitQueue`]: sync::WaitQueue
//! [`IrqContext`]: interrupt::IrqContext

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

#[macro_use]
extern crate abyss;
extern crate alloc;

mod cpu;
mod kernel;
mod sched;

pub mod config;
pub mod interrupt;
pub mod smp;
pub mod stats;
pub mod sync;
pub mod task;
pub mod thread;
pub mod timer;
pub mod workq;

pub use abyss::{MAX_CPU, debug, info, print, println, warning};
pub use config::Config;
pub use kernel::Kernel;

/// Enum representing errors that can occur during a kernel operation.
///
/// This enum is used to categorize errors encountered by the kernel operation.
/// Each variant corresponds to a specific type of error that might
/// occur during the handling of a kernel operation.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted,
    /// No such thread. (ESRCH)
    NoSuchThread,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Device or resource busy. (EBUSY)
    Busy,
    /// Invalid arguement. (EINVAL)
    InvalidArgument,
    /// Operation would block. (EAGAIN)
    WouldBlock,
    /// Operation timed out. (ETIMEDOUT)
    TimedOut,
    /// Interrupted while sleeping. (EINTR)
    Interrupted,
    /// Operation is not supported. (ENOTSUPP)
    NotSupportedOperation,
}

impl KernelError {
    /// Converts the [`KernelError`] enum into a corresponding `usize` error
    /// code.
    pub fn into_usize(self) -> usize {
        (match self {
            KernelError::OperationNotPermitted => -1isize,
            KernelError::NoSuchThread => -3,
            KernelError::Interrupted => -4,
            KernelError::WouldBlock => -11,
            KernelError::NoMemory => -12,
            KernelError::Busy => -16,
            KernelError::InvalidArgument => -22,
            KernelError::TimedOut => -110,
            KernelError::NotSupportedOperation => -524,
        }) as usize
    }
}

/// The given `isize` does not indicate an [`KernelError`].
#[derive(Debug, Eq, PartialEq)]
pub struct TryFromError {
    e: isize,
}

impl TryFrom<isize> for KernelError {
    type Error = TryFromError;

    fn try_from(value: isize) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::OperationNotPermitted),
            -3 => Ok(Self::NoSuchThread),
            -4 => Ok(Self::Interrupted),
            -11 => Ok(Self::WouldBlock),
            -12 => Ok(Self::NoMemory),
            -16 => Ok(Self::Busy),
            -22 => Ok(Self::InvalidArgument),
            -110 => Ok(Self::TimedOut),
            -524 => Ok(Self::NotSupportedOperation),
            e => Err(TryFromError { e }),
        }
    }
}

impl From<abyss::WouldBlock> for KernelError {
    fn from(_: abyss::WouldBlock) -> Self {
        KernelError::WouldBlock
    }
}

#[cfg(test)]
mod tests {
    use super::KernelError;

    #[test]
    fn errno_round_trip() {
        for e in [
            KernelError::OperationNotPermitted,
            KernelError::NoSuchThread,
            KernelError::NoMemory,
            KernelError::Busy,
            KernelError::InvalidArgument,
            KernelError::WouldBlock,
            KernelError::TimedOut,
            KernelError::Interrupted,
            KernelError::NotSupportedOperation,
        ] {
            assert_eq!(KernelError::try_from(e.into_usize() as isize), Ok(e));
        }
        assert!(KernelError::try_from(-2).is_err());
    }
}
