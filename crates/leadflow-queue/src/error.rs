//! Queue error types.

use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Fatal configuration error; the caller cannot proceed and must not retry.
    #[error("Invalid queue name: {0}")]
    InvalidName(String),

    /// Fatal for the caller; the named queue was never registered.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Shutdown has begun; no new jobs or registrations are accepted.
    #[error("Queue core is shut down")]
    Closed,

    #[error("Broker error: {0}")]
    Broker(#[from] leadflow_broker::BrokerError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn invalid_name(msg: impl Into<String>) -> Self {
        Self::InvalidName(msg.into())
    }

    pub fn not_found(name: impl Into<String>) -> Self {
        Self::QueueNotFound(name.into())
    }
}
