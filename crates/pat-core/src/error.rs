//! Error types for pat-core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PatError {
    /// A workload names a step the worker does not know.
    #[error("invalid workload step: {0}")]
    Validation(String),

    #[error("experiment not found: {0}")]
    UnknownExperiment(String),

    #[error("invalid experiment configuration: {0}")]
    InvalidConfiguration(String),

    /// The store backend could not be reached or refused the credentials.
    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, PatError>;
