//! The abyss of kernel that operates processors.
//!
//! This crate contains everything the scheduler core needs from the machine
//! underneath it: per-core interrupt state, spin locks, interrupt vectors,
//! inter-processor interrupts and execution context switching.
//!
//! All of it is reached through a single [`Platform`] object installed at
//! boot with [`platform::install`]. The `hosted` feature ships one such
//! platform, [`hosted::Machine`], that emulates a shared-memory
//! multiprocessor on top of host threads so that the kernel can be brought
//! up and tested without hardware.
//!
//! **YOU ARE *NOT* SUPPOSED TO REACH INTO THE INTERNALS OF THIS CRATE FROM
//! KERNEL CODE.** Use the re-exports of the [`kestrel`] crate instead.
//!
//! [`Platform`]: platform::Platform
//! [`kestrel`]: ../kestrel/index.html
#![cfg_attr(not(any(test, feature = "hosted")), no_std)]
#![allow(clippy::missing_safety_doc)]

use core::sync::atomic::AtomicBool;

extern crate alloc;

#[doc(hidden)]
#[macro_use]
pub mod kprint;
#[cfg(feature = "hosted")]
pub mod hosted;
pub mod interrupt;
pub mod platform;
pub mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard, WouldBlock};

/// Maximum number of CPU the kernel can support.
pub const MAX_CPU: usize = 64;

#[doc(hidden)]
pub static QUITE: AtomicBool = AtomicBool::new(false);
