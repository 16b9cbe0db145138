//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

/// Errors raised by the worker runtime itself.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Handler already registered for queue '{0}'")]
    DuplicateHandler(String),

    #[error("Worker is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Queue error: {0}")]
    Queue(#[from] leadflow_queue::QueueError),

    #[error("Broker error: {0}")]
    Broker(#[from] leadflow_broker::BrokerError),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }
}

/// Error returned by a job handler. A failed attempt is retried with the
/// job's backoff policy until its attempts are exhausted.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),

    #[error("Job timed out")]
    Timeout,

    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl JobError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}
