//! Run a small workload from Rust and print what was recorded.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pat_core::{
    ExperimentConfiguration, Laboratory, LocalWorker, SampleHandler, StoreConfig, Worker,
    WorkloadStep,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut worker = LocalWorker::new();
    pat_core::workloads::register_defaults(&mut worker);
    worker.add_workload_step(WorkloadStep::new(
        "nap",
        || {
            thread::sleep(Duration::from_millis(200));
            Ok(())
        },
        "Sleeps for 200ms",
    ));

    let store = StoreConfig::File {
        dir: "./experiments".into(),
    }
    .open()?;
    let lab = Laboratory::new(store)?;

    let printer: SampleHandler = Box::new(|stream| {
        for sample in stream {
            println!(
                "[{}] total={} errors={} workers={} avg={:?}",
                sample.sample_type,
                sample.total,
                sample.total_errors,
                sample.total_workers,
                sample.average
            );
        }
    });

    let config = ExperimentConfiguration::new(
        10,
        4,
        Duration::ZERO,
        Duration::ZERO,
        Arc::new(worker),
        "nap",
    );
    let running = lab.run_with_handlers(config, vec![printer])?;
    println!("Started experiment {}", running.guid());
    println!("Finished: {}", running.wait());

    let data = lab.get_data(running.guid())?;
    println!("{} samples stored", data.len());
    Ok(())
}
