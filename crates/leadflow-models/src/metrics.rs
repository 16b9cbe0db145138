//! Queue metrics snapshot types.

use serde::{Deserialize, Serialize};

/// Raw depth counts reported by the broker for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Jobs waiting for delivery
    pub waiting: u64,
    /// Jobs scheduled for later delivery
    pub delayed: u64,
    /// Jobs in terminal failed state (dead-lettered)
    pub failed: u64,
}

/// Read-only operational snapshot for dashboards and CLIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMetrics {
    /// Queue name
    pub queue: String,
    /// Cumulative completed jobs
    pub total_completed: u64,
    /// Cumulative failed attempts
    pub total_failed: u64,
    /// completed / (completed + failed), 1.0 when idle
    pub completion_rate: f64,
    /// failed / (completed + failed), 0.0 when idle
    pub error_rate: f64,
    /// Jobs currently being processed
    pub active_jobs: u64,
    /// Jobs waiting for delivery
    pub waiting_jobs: u64,
    /// Jobs scheduled for later delivery
    pub delayed_jobs: u64,
}

impl QueueMetrics {
    /// Assemble a snapshot from cumulative counters plus broker depth counts.
    pub fn compute(
        queue: impl Into<String>,
        total_completed: u64,
        total_failed: u64,
        active_jobs: u64,
        counts: QueueCounts,
    ) -> Self {
        let total = total_completed + total_failed;
        let (completion_rate, error_rate) = if total == 0 {
            (1.0, 0.0)
        } else {
            (
                total_completed as f64 / total as f64,
                total_failed as f64 / total as f64,
            )
        };

        Self {
            queue: queue.into(),
            total_completed,
            total_failed,
            completion_rate,
            error_rate,
            active_jobs,
            waiting_jobs: counts.waiting,
            delayed_jobs: counts.delayed,
        }
    }
}
