//! Periodic queue health monitoring.
//!
//! The monitor runs on a fixed interval, polls each queue's counters and
//! broker depth counts, and assigns a healthy/unhealthy status. One
//! queue's failure never stops checks for the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use leadflow_broker::Broker;
use leadflow_models::{HealthStatus, QueueHealth};

use crate::registry::QueueRegistry;

/// Shared map of per-queue health records.
///
/// Mutated by the monitor loop and by queue error handlers; this is the
/// one piece of truly shared mutable state in the subsystem.
#[derive(Default)]
pub struct HealthRegistry {
    records: RwLock<HashMap<String, QueueHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize a record in healthy state.
    pub async fn init(&self, queue: &str) {
        let mut records = self.records.write().await;
        records
            .entry(queue.to_string())
            .or_insert_with(QueueHealth::healthy);
    }

    /// Snapshot one queue's record.
    pub async fn get(&self, queue: &str) -> Option<QueueHealth> {
        self.records.read().await.get(queue).cloned()
    }

    /// Snapshot all records.
    pub async fn all(&self) -> HashMap<String, QueueHealth> {
        self.records.read().await.clone()
    }

    pub async fn is_unhealthy(&self, queue: &str) -> bool {
        self.records
            .read()
            .await
            .get(queue)
            .map(|r| !r.status.is_healthy())
            .unwrap_or(false)
    }

    /// Mark a queue unhealthy with the error captured. Usable by any
    /// error handler, not just the monitor loop.
    pub async fn mark_unhealthy(&self, queue: &str, error: impl Into<String>) {
        let mut records = self.records.write().await;
        records
            .entry(queue.to_string())
            .or_insert_with(QueueHealth::healthy)
            .mark_unhealthy(error);
    }

    async fn apply(&self, queue: &str, status: HealthStatus, completed: u64, dead_lettered: u64) {
        let mut records = self.records.write().await;
        let record = records
            .entry(queue.to_string())
            .or_insert_with(QueueHealth::healthy);
        record.status = status;
        record.completed_count = completed;
        record.failed_count = dead_lettered;
        record.last_check = Utc::now();
        if status.is_healthy() {
            record.last_error = None;
        }
    }

    pub(crate) async fn clear(&self) {
        self.records.write().await.clear();
    }
}

/// Status assignment policy.
#[derive(Debug, Clone)]
pub enum HealthPolicy {
    /// Once cumulative failures cross the threshold the queue stays
    /// unhealthy until explicit intervention (legacy behavior).
    Sticky { failure_threshold: u64 },
    /// Sliding-window error rate; the queue recovers once the recent
    /// rate drops back below the threshold.
    ErrorRate {
        window: Duration,
        max_error_rate: f64,
        min_samples: u64,
    },
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self::ErrorRate {
            window: Duration::from_secs(300),
            max_error_rate: 0.5,
            min_samples: 5,
        }
    }
}

/// One observation per monitor cycle, kept for windowed evaluation.
#[derive(Debug, Clone, Copy)]
struct Sample {
    at: tokio::time::Instant,
    completed: u64,
    failed: u64,
}

#[derive(Default)]
struct History {
    samples: Vec<Sample>,
}

impl History {
    fn push(&mut self, sample: Sample, window: Duration) {
        self.samples.push(sample);
        let cutoff = sample.at - window;
        self.samples.retain(|s| s.at >= cutoff);
    }

    /// Failure rate over the retained window, with the number of
    /// attempts observed in it.
    fn window_rate(&self) -> (f64, u64) {
        let (Some(first), Some(last)) = (self.samples.first(), self.samples.last()) else {
            return (0.0, 0);
        };
        let delta_failed = last.failed.saturating_sub(first.failed);
        let delta_completed = last.completed.saturating_sub(first.completed);
        let total = delta_failed + delta_completed;
        if total == 0 {
            (0.0, 0)
        } else {
            (delta_failed as f64 / total as f64, total)
        }
    }
}

impl HealthPolicy {
    fn evaluate(
        &self,
        previous: HealthStatus,
        completed: u64,
        failed: u64,
        history: &History,
    ) -> HealthStatus {
        match *self {
            HealthPolicy::Sticky { failure_threshold } => {
                if previous == HealthStatus::Unhealthy || failed >= failure_threshold {
                    HealthStatus::Unhealthy
                } else {
                    HealthStatus::Healthy
                }
            }
            HealthPolicy::ErrorRate {
                max_error_rate,
                min_samples,
                ..
            } => {
                let _ = (completed, failed);
                let (rate, total) = history.window_rate();
                if total >= min_samples && rate >= max_error_rate {
                    HealthStatus::Unhealthy
                } else {
                    HealthStatus::Healthy
                }
            }
        }
    }

    fn window(&self) -> Duration {
        match *self {
            HealthPolicy::Sticky { .. } => Duration::from_secs(300),
            HealthPolicy::ErrorRate { window, .. } => window,
        }
    }
}

/// Interval-driven monitor over all registered queues.
pub struct HealthMonitor {
    registry: Arc<QueueRegistry>,
    health: Arc<HealthRegistry>,
    broker: Arc<dyn Broker>,
    policy: HealthPolicy,
    interval: Duration,
    histories: tokio::sync::Mutex<HashMap<String, History>>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<QueueRegistry>,
        health: Arc<HealthRegistry>,
        broker: Arc<dyn Broker>,
        policy: HealthPolicy,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            health,
            broker,
            policy,
            interval,
            histories: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the monitor loop; it exits when `shutdown` flips to true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("health monitor stopping");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.run_cycle().await;
                    }
                }
            }
        })
    }

    /// One pass over every registered queue.
    pub async fn run_cycle(&self) {
        for name in self.registry.queue_names().await {
            if let Err(e) = self.check_queue(&name).await {
                // The monitor loop itself must never crash; capture and move on
                warn!(queue = %name, error = %e, "health check cycle failed");
                self.health.mark_unhealthy(&name, e.to_string()).await;
            }
        }
    }

    async fn check_queue(&self, name: &str) -> Result<(), leadflow_broker::BrokerError> {
        // Broker reachability is part of the check; the DLQ depth feeds
        // the record's failed count
        let counts = self.broker.counts(name).await?;

        let handle = match self.registry.get_queue(name).await {
            Ok(handle) => handle,
            Err(_) => return Ok(()), // unregistered between listing and check
        };

        let completed = handle.counters().completed();
        let failed = handle.counters().failed();

        let mut histories = self.histories.lock().await;
        let history = histories.entry(name.to_string()).or_default();
        history.push(
            Sample {
                at: tokio::time::Instant::now(),
                completed,
                failed,
            },
            self.policy.window(),
        );

        let previous = self
            .health
            .get(name)
            .await
            .map(|r| r.status)
            .unwrap_or_default();
        let status = self.policy.evaluate(previous, completed, failed, history);

        if status != previous {
            warn!(queue = name, status = status.as_str(), "queue health changed");
        }
        // completed is process-local (the broker deletes completed jobs);
        // failed is the broker-wide dead-letter depth
        self.health.apply(name, status, completed, counts.failed).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn sample(at: Instant, completed: u64, failed: u64) -> Sample {
        Sample {
            at,
            completed,
            failed,
        }
    }

    #[tokio::test]
    async fn sticky_policy_never_recovers() {
        let policy = HealthPolicy::Sticky {
            failure_threshold: 10,
        };
        let history = History::default();

        assert_eq!(
            policy.evaluate(HealthStatus::Healthy, 100, 9, &history),
            HealthStatus::Healthy
        );
        assert_eq!(
            policy.evaluate(HealthStatus::Healthy, 100, 10, &history),
            HealthStatus::Unhealthy
        );
        // Failures cleared, status stays stuck
        assert_eq!(
            policy.evaluate(HealthStatus::Unhealthy, 1000, 0, &history),
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn error_rate_policy_recovers_when_rate_drops() {
        let policy = HealthPolicy::ErrorRate {
            window: Duration::from_secs(60),
            max_error_rate: 0.5,
            min_samples: 4,
        };
        let window = policy.window();
        let start = Instant::now();

        let mut history = History::default();
        history.push(sample(start, 0, 0), window);
        history.push(sample(start + Duration::from_secs(1), 1, 5), window);
        assert_eq!(
            policy.evaluate(HealthStatus::Healthy, 1, 5, &history),
            HealthStatus::Unhealthy
        );

        // Later cycles succeed; windowed rate falls below threshold
        history.push(sample(start + Duration::from_secs(2), 30, 5), window);
        assert_eq!(
            policy.evaluate(HealthStatus::Unhealthy, 30, 5, &history),
            HealthStatus::Healthy
        );
    }

    #[tokio::test]
    async fn error_rate_policy_needs_min_samples() {
        let policy = HealthPolicy::ErrorRate {
            window: Duration::from_secs(60),
            max_error_rate: 0.5,
            min_samples: 10,
        };
        let window = policy.window();
        let start = Instant::now();

        let mut history = History::default();
        history.push(sample(start, 0, 0), window);
        history.push(sample(start + Duration::from_secs(1), 0, 3), window);

        // 100% failure rate but below the sample floor
        assert_eq!(
            policy.evaluate(HealthStatus::Healthy, 0, 3, &history),
            HealthStatus::Healthy
        );
    }
}
