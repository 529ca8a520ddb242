//! Shared application state for the Axum server.

use std::sync::Arc;

use dashmap::DashMap;
use pat_core::{ExperimentState, Laboratory, RunningExperiment, StoreConfig, Worker};
use tracing::debug;

/// Environment variable carrying the port on Cloud Foundry.
pub const PORT_ENV: &str = "VCAP_APP_PORT";

#[derive(Clone)]
pub struct AppState {
    pub lab: Arc<Laboratory>,
    pub worker: Arc<dyn Worker>,
    /// Experiments started by this process that have not finished yet.
    pub running: Arc<DashMap<String, RunningExperiment>>,
    /// Final state of every experiment this process saw finish.
    pub finished: Arc<DashMap<String, ExperimentState>>,
}

impl AppState {
    pub fn new(lab: Laboratory, worker: Arc<dyn Worker>) -> Self {
        Self {
            lab: Arc::new(lab),
            worker,
            running: Arc::new(DashMap::new()),
            finished: Arc::new(DashMap::new()),
        }
    }

    /// Keep `experiment` around while it runs; once it finishes only its
    /// final state is kept. Must be called from within a tokio runtime.
    pub fn track(&self, experiment: RunningExperiment) {
        let guid = experiment.guid().to_string();
        self.running.insert(guid.clone(), experiment.clone());

        let state = self.clone();
        tokio::spawn(async move {
            let last = experiment.finished().await;
            state.finished.insert(guid.clone(), last);
            state.running.remove(&guid);
            debug!(guid = %guid, state = %last, "Stopped tracking experiment");
        });
    }

    pub fn running(&self, guid: &str) -> Option<RunningExperiment> {
        self.running.get(guid).map(|r| r.value().clone())
    }

    /// State of an experiment started by this process, if any.
    pub fn state(&self, guid: &str) -> Option<ExperimentState> {
        if let Some(r) = self.running.get(guid) {
            return Some(r.state());
        }
        self.finished.get(guid).map(|s| *s.value())
    }
}

/// Configuration for the web server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub store: StoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            store: StoreConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults, with the port taken from `VCAP_APP_PORT` when it is set to a
    /// valid number.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(port) = std::env::var(PORT_ENV).ok().and_then(|p| p.parse().ok()) {
            config.port = port;
        }
        config
    }
}
