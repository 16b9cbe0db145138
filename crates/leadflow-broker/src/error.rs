//! Broker error types and classification.

use thiserror::Error;

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Enqueue failed: {0}")]
    EnqueueFailed(String),

    #[error("Broker is closed")]
    Closed,

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification used for logging and escalation. All kinds take
/// the same escalation path; the classification only changes how the
/// failure is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorKind {
    /// Transport-level failure (refused, dropped, I/O)
    Connection,
    /// The operation did not complete in time
    Timeout,
    /// Anything else the broker reported
    Operation,
}

impl BrokerErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerErrorKind::Connection => "connection",
            BrokerErrorKind::Timeout => "timeout",
            BrokerErrorKind::Operation => "operation",
        }
    }
}

impl BrokerError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn enqueue_failed(msg: impl Into<String>) -> Self {
        Self::EnqueueFailed(msg.into())
    }

    /// Classify the error for structured logging.
    pub fn kind(&self) -> BrokerErrorKind {
        match self {
            BrokerError::ConnectionFailed(_) | BrokerError::Closed => BrokerErrorKind::Connection,
            BrokerError::Timeout(_) => BrokerErrorKind::Timeout,
            BrokerError::Redis(e) => {
                if e.is_timeout() {
                    BrokerErrorKind::Timeout
                } else if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error()
                {
                    BrokerErrorKind::Connection
                } else {
                    BrokerErrorKind::Operation
                }
            }
            BrokerError::EnqueueFailed(_) | BrokerError::Json(_) => BrokerErrorKind::Operation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_labels() {
        assert_eq!(
            BrokerError::connection_failed("refused").kind().as_str(),
            "connection"
        );
        assert_eq!(
            BrokerError::Timeout("ping".to_string()).kind().as_str(),
            "timeout"
        );
        assert_eq!(
            BrokerError::enqueue_failed("full").kind().as_str(),
            "operation"
        );
    }
}
