//! Built-in steps available to every front end.

use std::thread;
use std::time::Duration;

use rand::Rng;

use crate::worker::{Worker, WorkloadStep};

/// Register the built-in steps on `worker`.
pub fn register_defaults(worker: &mut dyn Worker) {
    worker.add_workload_step(WorkloadStep::new(
        "dummy",
        dummy,
        "Sleeps for a random 1-4 seconds",
    ));
    worker.add_workload_step(WorkloadStep::new(
        "dummy-with-errors",
        dummy_with_errors,
        "Sleeps like dummy, then fails roughly one time in ten",
    ));
}

pub fn dummy() -> anyhow::Result<()> {
    let secs = rand::thread_rng().gen_range(1..5);
    thread::sleep(Duration::from_secs(secs));
    Ok(())
}

pub fn dummy_with_errors() -> anyhow::Result<()> {
    dummy()?;
    if unlucky(&mut rand::thread_rng()) {
        anyhow::bail!("Random (dummy) error");
    }
    Ok(())
}

fn unlucky(rng: &mut impl Rng) -> bool {
    rng.gen_range(0..10) > 8
}
