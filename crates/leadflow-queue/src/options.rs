//! Per-queue configuration.

use leadflow_models::JobOptions;

/// Options applied when a queue is registered.
///
/// `job_options` are the defaults for jobs enqueued to this queue; a
/// caller of `add_job` can replace them per call. The defaults match the
/// removal policy of dropping completed jobs and retaining failed ones.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// Worker concurrency override; `None` uses the worker config default.
    pub concurrency: Option<usize>,
    /// Default job options for this queue.
    pub job_options: JobOptions,
}

impl QueueOptions {
    /// Set the per-queue worker concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Set the default job options.
    pub fn with_job_options(mut self, job_options: JobOptions) -> Self {
        self.job_options = job_options;
        self
    }
}
