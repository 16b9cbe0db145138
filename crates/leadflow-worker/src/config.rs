//! Worker configuration.

use std::collections::HashMap;
use std::time::Duration;

use leadflow_queue::QueueOptions;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Default concurrent executions per queue
    pub default_concurrency: usize,
    /// Per-queue concurrency overrides
    pub queue_concurrency: HashMap<String, usize>,
    /// Maximum jobs fetched per dequeue call
    pub dequeue_batch: usize,
    /// How long one dequeue call blocks waiting for work
    pub block_timeout: Duration,
    /// Per-attempt execution timeout
    pub job_timeout: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// How often the worker scans for stalled deliveries
    pub claim_interval: Duration,
    /// Minimum idle time before a stalled delivery can be reclaimed
    pub claim_min_idle: Duration,
    /// Register the built-in log-and-complete handlers on the standard
    /// queues. Off by default: those handlers acknowledge every job, so
    /// a daemon started against live queues would silently discard work.
    pub log_only: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 4,
            queue_concurrency: HashMap::new(),
            dequeue_batch: 5,
            block_timeout: Duration::from_secs(1),
            job_timeout: Duration::from_secs(600),
            shutdown_timeout: Duration::from_secs(30),
            claim_interval: Duration::from_secs(30),
            claim_min_idle: Duration::from_secs(300),
            log_only: false,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    ///
    /// Per-queue concurrency overrides come from `WORKER_QUEUE_CONCURRENCY`
    /// as comma-separated `queue=n` pairs, e.g.
    /// `email-sequence=8,lead-scoring=2`.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            default_concurrency: std::env::var("WORKER_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.default_concurrency),
            queue_concurrency: std::env::var("WORKER_QUEUE_CONCURRENCY")
                .map(|s| parse_overrides(&s))
                .unwrap_or_default(),
            dequeue_batch: std::env::var("WORKER_DEQUEUE_BATCH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.dequeue_batch),
            block_timeout: Duration::from_millis(
                std::env::var("WORKER_BLOCK_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1_000),
            ),
            job_timeout: Duration::from_secs(
                std::env::var("WORKER_JOB_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(600),
            ),
            shutdown_timeout: Duration::from_secs(
                std::env::var("WORKER_SHUTDOWN_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            claim_interval: Duration::from_secs(
                std::env::var("WORKER_CLAIM_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            claim_min_idle: Duration::from_secs(
                std::env::var("WORKER_CLAIM_MIN_IDLE_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            log_only: std::env::var("WORKER_LOG_ONLY")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    /// Effective concurrency for one queue: the queue's own option wins,
    /// then the env override, then the worker default.
    pub fn concurrency_for(&self, queue: &str, options: &QueueOptions) -> usize {
        options
            .concurrency
            .or_else(|| self.queue_concurrency.get(queue).copied())
            .unwrap_or(self.default_concurrency)
            .max(1)
    }
}

fn parse_overrides(raw: &str) -> HashMap<String, usize> {
    raw.split(',')
        .filter_map(|pair| {
            let (queue, n) = pair.split_once('=')?;
            let queue = queue.trim();
            if queue.is_empty() {
                return None;
            }
            Some((queue.to_string(), n.trim().parse().ok()?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_parse_and_skip_garbage() {
        let map = parse_overrides("email-sequence=8, lead-scoring=2,bad,=3,x=notanum");
        assert_eq!(map.len(), 2);
        assert_eq!(map["email-sequence"], 8);
        assert_eq!(map["lead-scoring"], 2);
    }

    #[test]
    fn log_only_handlers_are_opt_in() {
        assert!(!WorkerConfig::default().log_only);

        std::env::set_var("WORKER_LOG_ONLY", "1");
        assert!(WorkerConfig::from_env().log_only);
        std::env::remove_var("WORKER_LOG_ONLY");
        assert!(!WorkerConfig::from_env().log_only);
    }

    #[test]
    fn queue_option_beats_override_and_default() {
        let mut config = WorkerConfig::default();
        config.queue_concurrency.insert("lead-scoring".into(), 2);

        let plain = QueueOptions::default();
        assert_eq!(config.concurrency_for("lead-scoring", &plain), 2);
        assert_eq!(
            config.concurrency_for("cache-warmup", &plain),
            config.default_concurrency
        );

        let explicit = QueueOptions::default().with_concurrency(7);
        assert_eq!(config.concurrency_for("lead-scoring", &explicit), 7);
    }
}
