use kestrel::Config;
use kestrel_grader::{
    expect_panic, expect_pass, grade, lifecycle, sched, smp, sync, uniprocessor, workq,
};

#[test]
fn mutex_exclusion() {
    grade(Config::new().cpus(4), sync::mutex_exclusion);
}

#[test]
fn mutex_contention() {
    grade(Config::new().cpus(2), sync::mutex_contention);
}

#[test]
fn foreign_unlock_panics() {
    expect_panic(
        kestrel_grader::run(uniprocessor(), sync::foreign_unlock),
        "unlocked a mutex owned by thread",
    );
}

#[test]
fn waitq_fifo() {
    grade(Config::new().cpus(2), sync::waitq_fifo);
}

#[test]
fn waitq_fifo_uniprocessor() {
    grade(uniprocessor(), sync::waitq_fifo);
}

#[test]
fn missed_wakeup() {
    grade(uniprocessor(), sync::missed_wakeup);
}

#[test]
fn sleep_timeout() {
    grade(Config::new().cpus(2), sync::sleep_timeout);
}

#[test]
fn interruption() {
    grade(Config::new().cpus(2), sync::interruption);
}

#[test]
fn wakeup_from_interrupt() {
    grade(Config::new().cpus(2), sync::wakeup_from_interrupt);
}

#[test]
fn condvar_handoff() {
    grade(Config::new().cpus(4), sync::condvar_handoff);
}

#[test]
fn semaphore_limits() {
    grade(Config::new().cpus(4), sync::semaphore_limits);
}

#[test]
fn priority_order() {
    grade(uniprocessor(), sched::priority_order);
}

#[test]
fn time_slicing() {
    grade(uniprocessor(), sched::time_slicing);
}

#[test]
fn aging() {
    grade(uniprocessor().aging(2, 1), sched::aging);
}

#[test]
fn pinning() {
    grade(Config::new().cpus(2), sched::pinning);
}

#[test]
fn load_distribution() {
    grade(Config::new().cpus(4), sched::load_distribution);
}

#[test]
fn load_distribution_with_fast_balancer() {
    grade(
        Config::new().cpus(4).load_balancer(true, 5),
        sched::load_distribution,
    );
}

#[test]
fn statistics() {
    grade(Config::new().cpus(4), sched::statistics);
}

#[test]
fn remote_call() {
    grade(Config::new().cpus(4), smp::remote_call);
}

#[test]
fn async_call() {
    grade(Config::new().cpus(4), smp::async_call);
}

#[test]
fn local_call() {
    grade(Config::new().cpus(2), smp::local_call);
}

#[test]
fn broadcast() {
    expect_pass(smp::run_broadcast(4));
}

#[test]
fn join_semantics() {
    grade(Config::new().cpus(2), lifecycle::join_semantics);
}

#[test]
fn self_join() {
    grade(Config::new().cpus(2), lifecycle::self_join);
}

#[test]
fn no_leak() {
    grade(Config::new().cpus(4), lifecycle::no_leak);
}

#[test]
fn table_exhaustion() {
    grade(lifecycle::tiny_table(), lifecycle::table_exhaustion);
}

#[test]
fn task_lifecycle() {
    expect_pass(lifecycle::run_task_lifecycle(2));
}

#[test]
fn boot_census() {
    grade(Config::new().cpus(4), lifecycle::boot_census);
}

#[test]
fn boot_census_without_balancer() {
    grade(Config::new().cpus(3).load_balancer(false, 100), lifecycle::boot_census);
}

#[test]
fn self_join_right_after_boot() {
    for _ in 0..5 {
        grade(Config::new().cpus(4), lifecycle::self_join);
    }
}

#[test]
fn contexts_reclaimed() {
    grade(Config::new().cpus(2), lifecycle::contexts_reclaimed);
}

#[test]
fn sleep_outcome_race() {
    grade(Config::new().cpus(4), sync::sleep_outcome_race);
}

#[test]
fn sleep_outcome_race_uniprocessor() {
    grade(uniprocessor(), sync::sleep_outcome_race);
}

#[test]
fn exclusive_dispatch() {
    expect_pass(sched::run_exclusive_dispatch(4));
}

#[test]
fn workq_runs_and_drains() {
    grade(Config::new().cpus(2), workq::runs_and_drains);
}

#[test]
fn workq_pool_adapts() {
    grade(Config::new().cpus(4), workq::pool_adapts);
}

#[test]
fn workq_serial_order() {
    grade(uniprocessor(), workq::serial_order);
}

#[test]
fn workq_invalid_limits() {
    grade(uniprocessor(), workq::invalid_limits);
}

#[test]
fn invalid_configuration() {
    assert!(kestrel_grader::run(Config::new().cpus(0), |_| ()).is_err());
}
