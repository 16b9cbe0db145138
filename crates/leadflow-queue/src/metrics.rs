//! Metrics facade recording for the queue core.

use metrics::{counter, gauge};

use leadflow_models::QueueCounts;

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_ENQUEUED_TOTAL: &str = "lf_jobs_enqueued_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "lf_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "lf_jobs_failed_total";
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "lf_jobs_dead_lettered_total";

    pub const QUEUE_WAITING: &str = "lf_queue_waiting";
    pub const QUEUE_DELAYED: &str = "lf_queue_delayed";
    pub const QUEUE_FAILED: &str = "lf_queue_failed";
    pub const QUEUE_ACTIVE: &str = "lf_queue_active";
}

/// Record a job enqueued.
pub fn record_job_enqueued(queue: &str) {
    let labels = [("queue", queue.to_string())];
    counter!(names::JOBS_ENQUEUED_TOTAL, &labels).increment(1);
}

/// Record a job completed.
pub fn record_job_completed(queue: &str) {
    let labels = [("queue", queue.to_string())];
    counter!(names::JOBS_COMPLETED_TOTAL, &labels).increment(1);
}

/// Record a failed attempt.
pub fn record_job_failed(queue: &str) {
    let labels = [("queue", queue.to_string())];
    counter!(names::JOBS_FAILED_TOTAL, &labels).increment(1);
}

/// Record a job moved to the dead letter set.
pub fn record_job_dead_lettered(queue: &str) {
    let labels = [("queue", queue.to_string())];
    counter!(names::JOBS_DEAD_LETTERED_TOTAL, &labels).increment(1);
}

/// Update queue depth gauges from a broker snapshot.
pub fn set_queue_depths(queue: &str, counts: QueueCounts) {
    let labels = [("queue", queue.to_string())];
    gauge!(names::QUEUE_WAITING, &labels).set(counts.waiting as f64);
    gauge!(names::QUEUE_DELAYED, &labels).set(counts.delayed as f64);
    gauge!(names::QUEUE_FAILED, &labels).set(counts.failed as f64);
}

/// Update the active jobs gauge.
pub fn set_active_jobs(queue: &str, active: u64) {
    let labels = [("queue", queue.to_string())];
    gauge!(names::QUEUE_ACTIVE, &labels).set(active as f64);
}
