//! Scenario driver for the kestrel scheduler.
//!
//! Every scenario boots a fresh kernel on a hosted multiprocessor, runs a
//! test function on a kernel thread named `main` once every processor is
//! online, and powers the machine off when the function returns. A panic on
//! any kernel flow, or a machine that does not power off in time, fails the
//! scenario.
//!
//! ```ignore
//! kestrel_grader::grade(Config::new().cpus(2), |kernel| {
//!     assert_eq!(kernel.online_cpus(), 2);
//! });
//! ```
pub mod lifecycle;
pub mod sched;
pub mod smp;
pub mod sync;
pub mod workq;

use abyss::{
    hosted::{Failure, Machine, power_off},
    platform::platform,
};
use kestrel::{
    Config, Kernel,
    task::Hooks,
    thread::{Current, ThreadBuilder},
};
use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

/// A test function, run on the `main` thread.
pub type Test = fn(&'static Kernel);

/// Runs `test` on a kernel configured by `config`.
pub fn run<F>(config: Config, test: F) -> Result<(), Failure>
where
    F: FnOnce(&'static Kernel) + Send + 'static,
{
    run_with(config, (), test)
}

/// Runs `test` on a kernel configured by `config` that calls `hooks`.
pub fn run_with<H, F>(config: Config, hooks: H, test: F) -> Result<(), Failure>
where
    H: Hooks + 'static,
    F: FnOnce(&'static Kernel) + Send + 'static,
{
    let cpus = config.cpus;
    let kernel = Kernel::new(config, hooks)
        .map_err(|e| Failure::Panicked(format!("invalid configuration: {e:?}")))?;
    let test = Mutex::new(Some(test));
    Machine::new(cpus)
        .deadline(Duration::from_secs(60))
        .run(move |core| {
            let test = test.lock().unwrap_or_else(PoisonError::into_inner).take();
            kernel.start_cpu(core, move || {
                let Some(test) = test else { return };
                let main = ThreadBuilder::new("main").spawn_in(kernel, move || {
                    while kernel.online_cpus() < cpus {
                        Current::sleep(1);
                    }
                    test(kernel);
                    power_off();
                });
                match main {
                    Ok(main) => main.detach(),
                    Err(e) => panic!("cannot spawn the main thread: {e:?}"),
                }
            })
        })
}

/// Like [`run`], panicking on failure.
#[track_caller]
pub fn grade<F>(config: Config, test: F)
where
    F: FnOnce(&'static Kernel) + Send + 'static,
{
    expect_pass(run(config, test));
}

/// Panics unless the machine powered off normally.
#[track_caller]
pub fn expect_pass(outcome: Result<(), Failure>) {
    if let Err(failure) = outcome {
        panic!("{failure}");
    }
}

/// Panics unless a kernel flow panicked with a message containing `msg`.
#[track_caller]
pub fn expect_panic(outcome: Result<(), Failure>, msg: &str) {
    match outcome {
        Err(Failure::Panicked(actual)) if actual.contains(msg) => (),
        Err(failure) => panic!("expected a kernel panic with `{msg}`, got: {failure}"),
        Ok(()) => panic!("expected a kernel panic with `{msg}`, but the machine powered off"),
    }
}

/// Busy-waits for `ticks` clock ticks with interrupts enabled, so that the
/// caller can be preempted meanwhile.
pub fn spin_for(kernel: &Kernel, ticks: u64) {
    let until = kernel.jiffies() + ticks;
    while kernel.jiffies() < until {
        platform().relax();
    }
}

/// Sleeps tick by tick until `cond` holds.
///
/// # Panics
/// Panics if `cond` still does not hold after `ticks` ticks.
#[track_caller]
pub fn wait_until(kernel: &Kernel, ticks: u64, what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = kernel.jiffies() + ticks;
    while !cond() {
        assert!(
            kernel.jiffies() < deadline,
            "gave up waiting for {what} after {ticks} ticks"
        );
        Current::sleep(1);
    }
}

/// Scenarios that need nothing but their configuration.
pub const SCENARIOS: &[(&str, Config, Test)] = &[
    ("sync::mutex_exclusion", Config::new().cpus(4), sync::mutex_exclusion),
    ("sync::mutex_contention", Config::new().cpus(2), sync::mutex_contention),
    ("sync::waitq_fifo", Config::new().cpus(2), sync::waitq_fifo),
    ("sync::missed_wakeup", uniprocessor(), sync::missed_wakeup),
    ("sync::sleep_timeout", Config::new().cpus(2), sync::sleep_timeout),
    ("sync::interruption", Config::new().cpus(2), sync::interruption),
    ("sync::wakeup_from_interrupt", Config::new().cpus(2), sync::wakeup_from_interrupt),
    ("sync::condvar_handoff", Config::new().cpus(4), sync::condvar_handoff),
    ("sync::semaphore_limits", Config::new().cpus(4), sync::semaphore_limits),
    ("sync::sleep_outcome_race", Config::new().cpus(4), sync::sleep_outcome_race),
    ("sched::priority_order", uniprocessor(), sched::priority_order),
    ("sched::time_slicing", uniprocessor(), sched::time_slicing),
    ("sched::aging", uniprocessor(), sched::aging),
    ("sched::pinning", Config::new().cpus(2), sched::pinning),
    ("sched::load_distribution", Config::new().cpus(4), sched::load_distribution),
    ("sched::statistics", Config::new().cpus(4), sched::statistics),
    ("smp::remote_call", Config::new().cpus(4), smp::remote_call),
    ("smp::async_call", Config::new().cpus(4), smp::async_call),
    ("smp::local_call", Config::new().cpus(2), smp::local_call),
    ("lifecycle::join_semantics", Config::new().cpus(2), lifecycle::join_semantics),
    ("lifecycle::self_join", Config::new().cpus(2), lifecycle::self_join),
    ("lifecycle::no_leak", Config::new().cpus(4), lifecycle::no_leak),
    ("lifecycle::table_exhaustion", lifecycle::tiny_table(), lifecycle::table_exhaustion),
    ("lifecycle::boot_census", Config::new().cpus(4), lifecycle::boot_census),
    ("lifecycle::contexts_reclaimed", Config::new().cpus(2), lifecycle::contexts_reclaimed),
    ("workq::runs_and_drains", Config::new().cpus(2), workq::runs_and_drains),
    ("workq::pool_adapts", Config::new().cpus(4), workq::pool_adapts),
    ("workq::serial_order", uniprocessor(), workq::serial_order),
    ("workq::invalid_limits", uniprocessor(), workq::invalid_limits),
];

/// A single-processor kernel without periodic balancing, on which dispatch
/// order is deterministic.
pub const fn uniprocessor() -> Config {
    Config::new().cpus(1).load_balancer(false, 100)
}
