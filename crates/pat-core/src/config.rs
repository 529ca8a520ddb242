//! File-backed configuration: which store to open and what to run.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::experiment::ExperimentConfiguration;
use crate::store::{FileStore, KvStore, MemoryLists, RedisConnection, Store};
use crate::worker::Worker;

/// Where samples are persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    File {
        dir: PathBuf,
    },
    Redis {
        host: String,
        port: u16,
        #[serde(default)]
        password: Option<String>,
    },
    /// Process-local lists; nothing survives a restart.
    Memory,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::File {
            dir: PathBuf::from("experiments"),
        }
    }
}

impl StoreConfig {
    /// Open the configured backend. Connection problems surface here.
    pub fn open(&self) -> Result<Arc<dyn Store>> {
        let store: Arc<dyn Store> = match self {
            StoreConfig::File { dir } => {
                info!(dir = %dir.display(), "Using file store");
                Arc::new(FileStore::open(dir)?)
            }
            StoreConfig::Redis {
                host,
                port,
                password,
            } => {
                info!(%host, port, "Using redis store");
                Arc::new(KvStore::new(RedisConnection::connect(
                    host,
                    *port,
                    password.as_deref(),
                )?))
            }
            StoreConfig::Memory => Arc::new(KvStore::new(MemoryLists::new())),
        };
        Ok(store)
    }
}

/// A serializable description of one experiment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunPlan {
    pub iterations: usize,
    pub concurrency: usize,
    /// Seconds between ticks of a repeating run.
    pub interval_secs: u64,
    /// Seconds after which a repeating run stops.
    pub stop_secs: u64,
    pub workload: String,
}

impl Default for RunPlan {
    fn default() -> Self {
        Self {
            iterations: 1,
            concurrency: 1,
            interval_secs: 0,
            stop_secs: 0,
            workload: "dummy".to_string(),
        }
    }
}

impl RunPlan {
    pub fn into_configuration(self, worker: Arc<dyn Worker>) -> ExperimentConfiguration {
        ExperimentConfiguration::new(
            self.iterations,
            self.concurrency,
            Duration::from_secs(self.interval_secs),
            Duration::from_secs(self.stop_secs),
            worker,
            self.workload,
        )
    }
}

pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

pub fn save_yaml<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    fs::write(path, serde_yaml::to_string(data)?)?;
    Ok(())
}
