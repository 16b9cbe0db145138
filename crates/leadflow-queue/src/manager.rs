//! Queue manager facade and shutdown coordination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::{Map, Value};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use leadflow_broker::Broker;
use leadflow_models::{Job, JobOptions, QueueHealth, QueueMetrics};

use crate::dispatcher::Dispatcher;
use crate::error::QueueResult;
use crate::health::{HealthMonitor, HealthPolicy, HealthRegistry};
use crate::metrics;
use crate::options::QueueOptions;
use crate::registry::{QueueHandle, QueueRegistry};

/// Outcome of `close_all`. All failures are collected; none aborts the
/// shutdown of the remaining queues.
#[derive(Debug, Default)]
pub struct CloseReport {
    pub errors: Vec<String>,
}

impl CloseReport {
    /// True when every queue drained and the broker closed cleanly.
    /// Hosts map this to the process exit code.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Owns the registry, dispatcher, health monitor, and shutdown state for
/// the whole queue subsystem.
pub struct QueueManager {
    broker: Arc<dyn Broker>,
    registry: Arc<QueueRegistry>,
    health: Arc<HealthRegistry>,
    dispatcher: Dispatcher,
    closed: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
    drain_timeout: Duration,
}

impl QueueManager {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        let health = Arc::new(HealthRegistry::new());
        let registry = Arc::new(QueueRegistry::new(Arc::clone(&broker), Arc::clone(&health)));
        let closed = Arc::new(AtomicBool::new(false));
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&broker),
            Arc::clone(&closed),
        );
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            broker,
            registry,
            health,
            dispatcher,
            closed,
            shutdown_tx,
            monitor_handle: Mutex::new(None),
            drain_timeout: Duration::from_secs(30),
        }
    }

    /// Set how long `close_all` waits for in-flight jobs per queue.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Start the periodic health monitor. Call once after registering
    /// the standard queues.
    pub async fn start_health_monitor(&self, policy: HealthPolicy, interval: Duration) {
        let monitor = HealthMonitor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.health),
            Arc::clone(&self.broker),
            policy,
            interval,
        );
        let handle = monitor.spawn(self.subscribe_shutdown());
        *self.monitor_handle.lock().await = Some(handle);
        info!(interval_secs = interval.as_secs(), "health monitor started");
    }

    pub async fn create_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> QueueResult<Arc<QueueHandle>> {
        self.registry.create_queue(name, options).await
    }

    pub async fn get_queue(&self, name: &str) -> QueueResult<Arc<QueueHandle>> {
        self.registry.get_queue(name).await
    }

    /// Enqueue a job; see [`Dispatcher::add_job`].
    pub async fn add_job(
        &self,
        queue_name: &str,
        payload: Map<String, Value>,
        options: Option<JobOptions>,
    ) -> QueueResult<Job> {
        self.dispatcher.add_job(queue_name, payload, options).await
    }

    /// Read-only operational snapshot for one queue.
    pub async fn queue_metrics(&self, queue_name: &str) -> QueueResult<QueueMetrics> {
        let handle = self.registry.get_queue(queue_name).await?;
        let counts = self.broker.counts(queue_name).await?;

        metrics::set_queue_depths(queue_name, counts);
        metrics::set_active_jobs(queue_name, handle.counters().active());

        Ok(QueueMetrics::compute(
            queue_name,
            handle.counters().completed(),
            handle.counters().failed(),
            handle.counters().active(),
            counts,
        ))
    }

    /// Health record for one queue.
    pub async fn queue_health(&self, queue_name: &str) -> Option<QueueHealth> {
        self.health.get(queue_name).await
    }

    pub fn registry(&self) -> Arc<QueueRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn health_registry(&self) -> Arc<HealthRegistry> {
        Arc::clone(&self.health)
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }

    /// Shared flag the worker runtime checks before accepting new
    /// processor registrations.
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Receiver that flips to `true` when shutdown begins.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Coordinated graceful shutdown.
    ///
    /// Stops accepting jobs, drains every queue concurrently (collecting
    /// failures rather than aborting on the first), stops the health
    /// monitor, closes the broker, and clears the registries. Idempotent.
    pub async fn close_all(&self) -> CloseReport {
        let mut report = CloseReport::default();

        if self.closed.swap(true, Ordering::SeqCst) {
            info!("close_all called on already-closed manager");
            return report;
        }

        info!("shutting down queue core");
        // send_replace: the flag must latch even with no subscribers yet
        self.shutdown_tx.send_replace(true);

        // Drain in-flight jobs across all queues concurrently
        let names = self.registry.queue_names().await;
        let drains = names.iter().map(|name| self.drain_queue(name));
        for result in join_all(drains).await {
            if let Err(e) = result {
                warn!(error = %e, "queue failed to drain");
                report.errors.push(e);
            }
        }

        // Stop the health monitor
        if let Some(mut handle) = self.monitor_handle.lock().await.take() {
            if tokio::time::timeout(Duration::from_secs(5), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }

        if let Err(e) = self.broker.close().await {
            report.errors.push(format!("broker close failed: {e}"));
        }

        self.registry.clear().await;
        self.health.clear().await;

        if report.is_clean() {
            info!("queue core shut down cleanly");
        } else {
            warn!(errors = report.errors.len(), "queue core shut down with errors");
        }
        report
    }

    /// Wait for one queue's active jobs to reach zero.
    async fn drain_queue(&self, name: &str) -> Result<(), String> {
        let handle = self
            .registry
            .get_queue(name)
            .await
            .map_err(|e| format!("{name}: {e}"))?;

        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        loop {
            let active = handle.counters().active();
            if active == 0 {
                info!(queue = name, "queue drained");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(format!(
                    "{name}: {active} jobs still active after {:?}",
                    self.drain_timeout
                ));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
