//! The laboratory: runs experiments and hands back what they recorded.
//!
//! `run()` returns as soon as the experiment is wired up. Lanes execute on
//! their own OS threads and report every finished iteration (and every lane
//! start/stop) over channels to a sampler task on the laboratory's tokio
//! runtime. The sampler folds them into [`Sample`]s and fans each one out to
//!
//! - the store, through an unbounded queue drained by a blocking writer, so
//!   every sample is persisted no matter how slow the backend is, and
//! - any number of handlers, through a bounded broadcast channel. A handler
//!   that falls behind loses the oldest samples instead of holding up the run.

use std::sync::Arc;
use std::time::Instant;

use tokio::runtime::{Handle, Runtime};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::concurrency::{counted, execute_concurrently, repeat, repeat_every_until};
use crate::error::{PatError, Result};
use crate::experiment::{ExperimentConfiguration, ExperimentState, RunnableExperiment};
use crate::models::{IterationResult, Sample};
use crate::store::{Experiment, SampleWriter, Store};

/// Samples a handler may fall behind by before it starts losing them.
pub const HANDLER_BUFFER: usize = 1024;

/// Consumes the samples of one experiment. Runs on a blocking thread.
pub type SampleHandler = Box<dyn FnOnce(SampleStream) + Send + 'static>;

/// The samples of a running experiment, as seen by one handler.
///
/// Ends once the experiment has finished and every sample was delivered.
pub struct SampleStream {
    guid: String,
    rx: broadcast::Receiver<Sample>,
}

impl SampleStream {
    fn new(guid: &str, rx: broadcast::Receiver<Sample>) -> Self {
        Self {
            guid: guid.to_string(),
            rx,
        }
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// Block until the next sample. Must not be called from async code.
    pub fn recv(&mut self) -> Option<Sample> {
        loop {
            match self.rx.blocking_recv() {
                Ok(sample) => return Some(sample),
                Err(RecvError::Lagged(skipped)) => self.lagged(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub async fn recv_async(&mut self) -> Option<Sample> {
        loop {
            match self.rx.recv().await {
                Ok(sample) => return Some(sample),
                Err(RecvError::Lagged(skipped)) => self.lagged(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    fn lagged(&self, skipped: u64) {
        warn!(guid = %self.guid, skipped, "Sample handler fell behind, samples dropped");
    }
}

impl Iterator for SampleStream {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        self.recv()
    }
}

/// Handle to an experiment started by [`Laboratory::run`].
#[derive(Clone)]
pub struct RunningExperiment {
    guid: String,
    state: watch::Receiver<ExperimentState>,
    cancel: CancellationToken,
    handle: Handle,
}

impl RunningExperiment {
    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn state(&self) -> ExperimentState {
        *self.state.borrow()
    }

    /// Ask every lane to stop. Iterations already under way finish and are
    /// recorded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once every sample has been persisted.
    pub async fn finished(&self) -> ExperimentState {
        let mut state = self.state.clone();
        if let Ok(done) = state.wait_for(ExperimentState::is_finished).await {
            return *done;
        }
        let last = *state.borrow();
        last
    }

    /// Blocking form of [`finished`](Self::finished). Must not be called from
    /// async code.
    pub fn wait(&self) -> ExperimentState {
        self.handle.block_on(self.finished())
    }
}

/// Shuts its runtime down without waiting, so a laboratory may be dropped
/// from inside async code.
struct OwnedRuntime(Option<Runtime>);

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

/// Runs experiments against a [`Store`] and reads them back.
///
/// Dropping a laboratory that owns its runtime abandons experiments still in
/// flight.
pub struct Laboratory {
    store: Arc<dyn Store>,
    handle: Handle,
    _runtime: Option<OwnedRuntime>,
}

impl Laboratory {
    /// Create a laboratory with its own background runtime.
    pub fn new(store: Arc<dyn Store>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("pat-lab")
            .enable_all()
            .build()?;
        Ok(Self {
            store,
            handle: runtime.handle().clone(),
            _runtime: Some(OwnedRuntime(Some(runtime))),
        })
    }

    /// Create a laboratory that schedules its tasks on an existing runtime.
    pub fn with_handle(store: Arc<dyn Store>, handle: Handle) -> Self {
        Self {
            store,
            handle,
            _runtime: None,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Start an experiment under a fresh guid.
    pub fn run(&self, config: ExperimentConfiguration) -> Result<RunningExperiment> {
        self.run_with_handlers(config, vec![])
    }

    /// Start an experiment, also streaming its samples to `handlers`.
    ///
    /// Fails without starting anything when the configuration is invalid or
    /// the store refuses the new experiment.
    pub fn run_with_handlers(
        &self,
        config: ExperimentConfiguration,
        handlers: Vec<SampleHandler>,
    ) -> Result<RunningExperiment> {
        config.validate()?;
        let experiment = RunnableExperiment::new(config);
        let guid = experiment.guid().to_string();
        let writer = self.store.writer(&guid)?;

        let (store_tx, store_rx) = mpsc::unbounded_channel();
        let (display_tx, _) = broadcast::channel(HANDLER_BUFFER);
        for handler in handlers {
            let stream = SampleStream::new(&guid, display_tx.subscribe());
            self.handle.spawn_blocking(move || handler(stream));
        }

        let (state_tx, state_rx) = watch::channel(ExperimentState::Created);
        let cancel = CancellationToken::new();

        info!(
            guid = %guid,
            workload = %experiment.config().workload,
            iterations = experiment.config().iterations,
            concurrency = experiment.config().concurrency,
            interval = ?experiment.config().interval,
            stop = ?experiment.config().stop,
            "Experiment started"
        );

        self.handle.spawn(drive(
            experiment,
            writer,
            store_rx,
            Outlet {
                store: store_tx,
                display: display_tx,
            },
            state_tx,
            cancel.clone(),
        ));

        Ok(RunningExperiment {
            guid,
            state: state_rx,
            cancel,
            handle: self.handle.clone(),
        })
    }

    /// Every stored experiment, oldest first.
    pub fn experiments(&self) -> Result<Vec<Box<dyn Experiment>>> {
        self.store.load_all()
    }

    /// Call `f` for every stored experiment, oldest first.
    pub fn visit(&self, mut f: impl FnMut(&dyn Experiment)) -> Result<()> {
        for experiment in self.store.load_all()? {
            f(experiment.as_ref());
        }
        Ok(())
    }

    /// Stored samples of one experiment, in the order they were produced.
    pub fn get_data(&self, guid: &str) -> Result<Vec<Sample>> {
        self.store
            .get(guid)?
            .ok_or_else(|| PatError::UnknownExperiment(guid.to_string()))?
            .get_data()
    }
}

// ─── Experiment pipeline ─────────────────────────────────────────────────────

/// Where the sampler sends each sample.
struct Outlet {
    store: mpsc::UnboundedSender<Sample>,
    display: broadcast::Sender<Sample>,
}

impl Outlet {
    fn emit(&self, sample: &Sample) {
        if self.store.send(sample.clone()).is_err() {
            error!("Store writer stopped, sample not persisted");
        }
        // Only fails when no handler is listening.
        let _ = self.display.send(sample.clone());
    }
}

async fn drive(
    experiment: RunnableExperiment,
    writer: Box<dyn SampleWriter>,
    samples: mpsc::UnboundedReceiver<Sample>,
    outlet: Outlet,
    state: watch::Sender<ExperimentState>,
    cancel: CancellationToken,
) {
    let guid = experiment.guid().to_string();
    let _ = state.send(ExperimentState::Running);
    let started = Instant::now();

    let persist_guid = guid.clone();
    let persisted = tokio::task::spawn_blocking(move || persist(&persist_guid, writer, samples));

    let (results_tx, results_rx) = mpsc::unbounded_channel();
    let (workers_tx, workers_rx) = mpsc::unbounded_channel();
    let sampler = tokio::spawn(sample(results_rx, workers_rx, started, outlet));

    let lane_cancel = cancel.clone();
    let lanes = tokio::task::spawn_blocking(move || {
        run_lanes(experiment.config(), results_tx, workers_tx, lane_cancel)
    });

    if let Err(e) = lanes.await {
        error!(guid = %guid, "Experiment lanes failed: {}", e);
    }
    if let Err(e) = sampler.await {
        error!(guid = %guid, "Sampler failed: {}", e);
    }
    let written = persisted.await.unwrap_or_else(|e| {
        error!(guid = %guid, "Store writer failed: {}", e);
        0
    });

    let finished = if cancel.is_cancelled() {
        ExperimentState::Cancelled
    } else {
        ExperimentState::Completed
    };
    info!(
        guid = %guid,
        state = %finished,
        samples = written,
        elapsed = ?started.elapsed(),
        "Experiment finished"
    );
    let _ = state.send(finished);
}

/// Run every lane to completion on the calling thread. Returns once all of
/// them have stopped; dropping the senders then lets the sampler finish.
fn run_lanes(
    config: &ExperimentConfiguration,
    results: mpsc::UnboundedSender<IterationResult>,
    workers: mpsc::UnboundedSender<i32>,
    cancel: CancellationToken,
) {
    let iteration = || {
        let _ = results.send(config.worker.time(&config.workload));
    };

    if config.repeats() {
        let ticks = repeat_every_until(config.interval, config.stop, iteration, Some(cancel));
        execute_concurrently(config.concurrency, counted(workers, ticks));
    } else {
        let budget = repeat(config.iterations, iteration).until_cancelled(cancel);
        execute_concurrently(config.concurrency, counted(workers, budget));
    }
}

/// Fold results and lane changes into samples until both inputs close.
async fn sample(
    mut results: mpsc::UnboundedReceiver<IterationResult>,
    mut workers: mpsc::UnboundedReceiver<i32>,
    started: Instant,
    outlet: Outlet,
) {
    let mut current = Sample::default();
    let mut live: usize = 0;
    let mut results_open = true;
    let mut workers_open = true;

    while results_open || workers_open {
        tokio::select! {
            biased;

            delta = workers.recv(), if workers_open => match delta {
                Some(delta) => {
                    live = live.saturating_add_signed(delta as isize);
                    current = current.with_workers(live, started.elapsed());
                    outlet.emit(&current);
                }
                None => workers_open = false,
            },

            result = results.recv(), if results_open => match result {
                Some(result) => {
                    if let Some(e) = &result.error {
                        debug!("Iteration failed: {:#}", e);
                    }
                    current = current.record(&result, live, started.elapsed());
                    outlet.emit(&current);
                }
                None => results_open = false,
            },
        }
    }
}

/// Drain the store queue into `writer`. A failed write is logged and the
/// next sample is still attempted.
fn persist(
    guid: &str,
    mut writer: Box<dyn SampleWriter>,
    mut samples: mpsc::UnboundedReceiver<Sample>,
) -> usize {
    let mut written = 0;
    while let Some(sample) = samples.blocking_recv() {
        match writer.write(&sample) {
            Ok(()) => written += 1,
            Err(e) => error!(guid, "Failed to persist sample: {}", e),
        }
    }
    written
}
