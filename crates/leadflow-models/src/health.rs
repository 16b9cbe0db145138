//! Per-queue operational health records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Queue health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Operational snapshot for one queue.
///
/// Mutated by the health monitor and by queue error handlers; read by
/// anything that wants a status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueHealth {
    /// Current status
    pub status: HealthStatus,
    /// When the record was last updated
    pub last_check: DateTime<Utc>,
    /// Completed jobs observed by this process
    pub completed_count: u64,
    /// Dead-lettered jobs retained by the broker for this queue
    pub failed_count: u64,
    /// Last error observed, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueueHealth {
    /// Fresh record in healthy state.
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            last_check: Utc::now(),
            completed_count: 0,
            failed_count: 0,
            last_error: None,
        }
    }

    /// Mark the record unhealthy with the error captured.
    pub fn mark_unhealthy(&mut self, error: impl Into<String>) {
        self.status = HealthStatus::Unhealthy;
        self.last_check = Utc::now();
        self.last_error = Some(error.into());
    }
}

impl Default for QueueHealth {
    fn default() -> Self {
        Self::healthy()
    }
}
