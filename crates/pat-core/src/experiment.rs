//! Run configuration and lifecycle types.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PatError, Result};
use crate::worker::Worker;

/// Everything needed to start an experiment. Immutable once built.
#[derive(Clone)]
pub struct ExperimentConfiguration {
    /// Total iterations across all lanes. Ignored when the run repeats on an
    /// interval.
    pub iterations: usize,
    /// Number of lanes running the workload in parallel.
    pub concurrency: usize,
    pub interval: Duration,
    pub stop: Duration,
    pub worker: Arc<dyn Worker>,
    /// Comma-separated step names making up one iteration.
    pub workload: String,
}

impl ExperimentConfiguration {
    pub fn new(
        iterations: usize,
        concurrency: usize,
        interval: Duration,
        stop: Duration,
        worker: Arc<dyn Worker>,
        workload: impl Into<String>,
    ) -> Self {
        Self {
            iterations,
            concurrency,
            interval,
            stop,
            worker,
            workload: workload.into(),
        }
    }

    /// Whether each lane repeats on `interval` until `stop`, rather than
    /// sharing a fixed number of iterations.
    pub fn repeats(&self) -> bool {
        !self.interval.is_zero() && !self.stop.is_zero()
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(PatError::InvalidConfiguration(
                "concurrency must be at least 1".into(),
            ));
        }
        self.worker.validate(&self.workload)
    }
}

impl fmt::Debug for ExperimentConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExperimentConfiguration")
            .field("iterations", &self.iterations)
            .field("concurrency", &self.concurrency)
            .field("interval", &self.interval)
            .field("stop", &self.stop)
            .field("workload", &self.workload)
            .finish_non_exhaustive()
    }
}

/// A configuration paired with the guid its samples are stored under.
#[derive(Debug, Clone)]
pub struct RunnableExperiment {
    guid: String,
    config: ExperimentConfiguration,
}

impl RunnableExperiment {
    pub fn new(config: ExperimentConfiguration) -> Self {
        Self {
            guid: Uuid::new_v4().to_string(),
            config,
        }
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn config(&self) -> &ExperimentConfiguration {
        &self.config
    }
}

/// Lifecycle of a started experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExperimentState {
    Created,
    Running,
    Completed,
    Cancelled,
}

impl ExperimentState {
    pub fn is_finished(&self) -> bool {
        matches!(self, ExperimentState::Completed | ExperimentState::Cancelled)
    }
}

impl fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExperimentState::Created => write!(f, "CREATED"),
            ExperimentState::Running => write!(f, "RUNNING"),
            ExperimentState::Completed => write!(f, "COMPLETED"),
            ExperimentState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{LocalWorker, WorkloadStep};

    fn worker() -> Arc<dyn Worker> {
        let mut worker = LocalWorker::new();
        worker.add_workload_step(WorkloadStep::new("push", || Ok(()), ""));
        Arc::new(worker)
    }

    #[test]
    fn repeats_only_with_interval_and_stop() {
        let secs = Duration::from_secs;
        assert!(ExperimentConfiguration::new(1, 1, secs(1), secs(5), worker(), "push").repeats());
        assert!(!ExperimentConfiguration::new(1, 1, secs(0), secs(5), worker(), "push").repeats());
        assert!(!ExperimentConfiguration::new(1, 1, secs(1), secs(0), worker(), "push").repeats());
    }

    #[test]
    fn rejects_zero_concurrency_and_unknown_steps() {
        let zero = ExperimentConfiguration::new(1, 0, Duration::ZERO, Duration::ZERO, worker(), "push");
        assert!(matches!(zero.validate(), Err(PatError::InvalidConfiguration(_))));

        let unknown =
            ExperimentConfiguration::new(1, 1, Duration::ZERO, Duration::ZERO, worker(), "push,pull");
        assert!(matches!(unknown.validate(), Err(PatError::Validation(ref s)) if s == "pull"));
    }

    #[test]
    fn each_runnable_gets_a_fresh_guid() {
        let config = ExperimentConfiguration::new(1, 1, Duration::ZERO, Duration::ZERO, worker(), "push");
        let a = RunnableExperiment::new(config.clone());
        let b = RunnableExperiment::new(config);
        assert_ne!(a.guid(), b.guid());
        assert!(Uuid::parse_str(a.guid()).is_ok());
    }
}
