//! pat-core: step registry, laboratory and sample stores for pat.
//!
//! A [`Worker`] knows named steps; a workload is a comma-separated list of
//! them. The [`Laboratory`] runs a workload over many iterations and lanes,
//! folds every outcome into a running [`Sample`], and persists each sample
//! to a [`Store`]. Sending a sample never blocks the lanes: persistence and
//! display happen on the laboratory's background runtime.

pub mod concurrency;
pub mod config;
pub mod error;
pub mod experiment;
pub mod export;
pub mod laboratory;
pub mod models;
pub mod store;
pub mod worker;
pub mod workloads;

pub use config::{RunPlan, StoreConfig};
pub use error::{PatError, Result};
pub use experiment::{ExperimentConfiguration, ExperimentState, RunnableExperiment};
pub use laboratory::{Laboratory, RunningExperiment, SampleHandler, SampleStream};
pub use models::{IterationResult, Sample, SampleType, StepResult};
pub use store::{Experiment, Store};
pub use worker::{LocalWorker, StepContext, Worker, WorkloadStep};
