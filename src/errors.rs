use std::io;

use thiserror::Error;

/// Why a request was not admitted. The caller drops or backs off; nothing is
/// retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("task cache is full ({capacity} tasks in flight)")]
    Rejected { capacity: usize },
    #[error("request id '{request_id}' is already in flight")]
    DuplicateRequest { request_id: String },
    #[error("pending queue is full ({capacity} tasks waiting)")]
    QueueFull { capacity: usize },
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker pool is full ({max} workers)")]
    PoolFull { max: usize },
    #[error("failed to connect to worker {address}: {source}")]
    ConnectFailed { address: String, source: io::Error },
    #[error("failed to send to worker {index}: {reason}")]
    SendFailed { index: usize, reason: String },
    #[error("worker {index} is not connected")]
    NotConnected { index: usize },
    #[error("no worker with index {index}")]
    UnknownWorker { index: usize },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io { path: String, source: io::Error },
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid config value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Startup failures of the client listener.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid listen address '{0}'")]
    ListenAddress(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
