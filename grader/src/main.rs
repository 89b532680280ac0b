//! Runs every scenario, each on a fresh machine.
use kestrel_grader::{SCENARIOS, lifecycle, run, sched, smp, sync, uniprocessor};

fn main() {
    let mut outcomes = SCENARIOS
        .iter()
        .map(|(name, config, test)| (*name, run(config.clone(), *test)))
        .collect::<Vec<_>>();
    outcomes.push(("smp::broadcast", smp::run_broadcast(4)));
    outcomes.push(("lifecycle::task_lifecycle", lifecycle::run_task_lifecycle(2)));
    outcomes.push(("sched::exclusive_dispatch", sched::run_exclusive_dispatch(4)));

    let foreign = match run(uniprocessor(), sync::foreign_unlock) {
        Err(abyss::hosted::Failure::Panicked(msg)) if msg.contains("owned by thread") => Ok(()),
        Err(failure) => Err(failure),
        Ok(()) => Err(abyss::hosted::Failure::Panicked(
            "unlocking a foreign mutex went unnoticed".into(),
        )),
    };
    outcomes.push(("sync::foreign_unlock", foreign));

    let mut failed = 0;
    for (name, outcome) in &outcomes {
        match outcome {
            Ok(()) => println!("{name:<36} ok"),
            Err(failure) => {
                failed += 1;
                println!("{name:<36} FAILED: {failure}");
            }
        }
    }
    println!("{} passed, {} failed", outcomes.len() - failed, failed);
    if failed > 0 {
        std::process::exit(1);
    }
}
