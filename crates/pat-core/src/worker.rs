//! Step registry and sequencer.
//!
//! A [`LocalWorker`] is populated once at startup and then shared read-only
//! (behind an `Arc<dyn Worker>`) by every lane of a running experiment.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::concurrency;
use crate::error::{PatError, Result};
use crate::models::{IterationResult, StepResult};

/// Scratch space threaded through the steps of a single iteration.
pub type StepContext = HashMap<String, serde_json::Value>;

type StatelessFn = dyn Fn() -> anyhow::Result<()> + Send + Sync;
type ContextFn = dyn Fn(&mut StepContext) -> anyhow::Result<()> + Send + Sync;

/// The callable behind a step.
#[derive(Clone)]
pub enum StepFn {
    Stateless(Arc<StatelessFn>),
    WithContext(Arc<ContextFn>),
}

impl StepFn {
    fn call(&self, context: &mut StepContext) -> anyhow::Result<()> {
        match self {
            StepFn::Stateless(f) => f(),
            StepFn::WithContext(f) => f(context),
        }
    }
}

/// A named unit of work a worker knows how to run.
#[derive(Clone)]
pub struct WorkloadStep {
    pub name: String,
    pub description: String,
    func: StepFn,
}

impl WorkloadStep {
    pub fn new<F>(name: impl Into<String>, f: F, description: impl Into<String>) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            func: StepFn::Stateless(Arc::new(f)),
        }
    }

    /// A step that reads and writes the iteration's shared [`StepContext`].
    pub fn with_context<F>(name: impl Into<String>, f: F, description: impl Into<String>) -> Self
    where
        F: Fn(&mut StepContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            func: StepFn::WithContext(Arc::new(f)),
        }
    }

    pub fn accepts_context(&self) -> bool {
        matches!(self.func, StepFn::WithContext(_))
    }

    pub fn func(&self) -> &StepFn {
        &self.func
    }

    pub fn run(&self, context: &mut StepContext) -> anyhow::Result<()> {
        self.func.call(context)
    }
}

impl fmt::Debug for WorkloadStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadStep")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("accepts_context", &self.accepts_context())
            .finish()
    }
}

/// Something that can run comma-separated workloads of named steps.
pub trait Worker: Send + Sync {
    /// Register a step. A step with the same name is replaced.
    fn add_workload_step(&mut self, step: WorkloadStep);

    /// Call `f` for every registered step, in registration order.
    fn visit(&self, f: &mut dyn FnMut(&WorkloadStep));

    /// Check that every step named in `workload` is registered.
    fn validate(&self, workload: &str) -> Result<()>;

    /// Run `workload` once, timing each step.
    fn time(&self, workload: &str) -> IterationResult;

    fn is_valid(&self, workload: &str) -> bool {
        self.validate(workload).is_ok()
    }
}

/// In-process worker backed by an insertion-ordered registry.
#[derive(Default, Clone)]
pub struct LocalWorker {
    steps: Vec<WorkloadStep>,
    index: HashMap<String, usize>,
}

impl LocalWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&WorkloadStep> {
        self.index.get(name).map(|&i| &self.steps[i])
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn resolve<'a>(&'a self, workload: &str) -> Result<Vec<&'a WorkloadStep>> {
        workload
            .split(',')
            .map(str::trim)
            .map(|name| {
                self.get(name)
                    .ok_or_else(|| PatError::Validation(name.to_string()))
            })
            .collect()
    }
}

impl Worker for LocalWorker {
    fn add_workload_step(&mut self, step: WorkloadStep) {
        match self.index.get(&step.name) {
            Some(&i) => self.steps[i] = step,
            None => {
                self.index.insert(step.name.clone(), self.steps.len());
                self.steps.push(step);
            }
        }
    }

    fn visit(&self, f: &mut dyn FnMut(&WorkloadStep)) {
        self.steps.iter().for_each(f);
    }

    fn validate(&self, workload: &str) -> Result<()> {
        self.resolve(workload).map(|_| ())
    }

    /// Unknown names are rejected before anything runs: the result then
    /// carries no steps and a validation error.
    fn time(&self, workload: &str) -> IterationResult {
        let steps = match self.resolve(workload) {
            Ok(steps) => steps,
            Err(e) => {
                return IterationResult {
                    error: Some(e.into()),
                    ..Default::default()
                }
            }
        };

        let mut context = StepContext::new();
        let mut result = IterationResult {
            steps: Vec::with_capacity(steps.len()),
            ..Default::default()
        };

        let start = Instant::now();
        for step in steps {
            let (duration, outcome) = concurrency::time(|| step.run(&mut context));
            result.steps.push(StepResult {
                command: step.name.clone(),
                duration,
            });
            if let Err(e) = outcome {
                result.error = Some(e);
                break;
            }
        }
        result.duration = start.elapsed();
        result
    }
}
