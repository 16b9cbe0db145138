//! Queue registry.
//!
//! Owns every queue for the process lifetime; dispatcher and workers
//! hold `Arc` handles, never ownership.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use leadflow_broker::Broker;

use crate::error::{QueueError, QueueResult};
use crate::health::HealthRegistry;
use crate::options::QueueOptions;

/// Cumulative execution counters for one queue, updated by the worker
/// runtime and read by the health monitor and metrics snapshots.
#[derive(Debug, Default)]
pub struct QueueCounters {
    completed: AtomicU64,
    failed: AtomicU64,
    active: AtomicU64,
}

impl QueueCounters {
    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_started(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_finished(&self) {
        // Saturating: a stray double-decrement must not wrap
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                v.checked_sub(1)
            });
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// Handle to one registered queue.
pub struct QueueHandle {
    name: String,
    options: QueueOptions,
    counters: QueueCounters,
}

impl QueueHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn counters(&self) -> &QueueCounters {
        &self.counters
    }
}

/// Creates, names, and tracks the fixed set of logical queues.
pub struct QueueRegistry {
    broker: Arc<dyn Broker>,
    queues: RwLock<HashMap<String, Arc<QueueHandle>>>,
    health: Arc<HealthRegistry>,
}

impl QueueRegistry {
    pub fn new(broker: Arc<dyn Broker>, health: Arc<HealthRegistry>) -> Self {
        Self {
            broker,
            queues: RwLock::new(HashMap::new()),
            health,
        }
    }

    /// Register a queue, binding it to the broker and initializing its
    /// health record as healthy.
    ///
    /// Re-registering an existing name is idempotent: the existing handle
    /// is returned with its health and counters preserved, and a warning
    /// is logged.
    pub async fn create_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> QueueResult<Arc<QueueHandle>> {
        let name = name.trim();
        if name.is_empty() {
            return Err(QueueError::invalid_name("queue name must be non-empty"));
        }

        {
            let queues = self.queues.read().await;
            if let Some(existing) = queues.get(name) {
                warn!(queue = name, "queue already registered, returning existing handle");
                return Ok(Arc::clone(existing));
            }
        }

        self.broker.ensure_queue(name).await?;

        let handle = Arc::new(QueueHandle {
            name: name.to_string(),
            options,
            counters: QueueCounters::default(),
        });

        let mut queues = self.queues.write().await;
        // Lost a race with a concurrent create for the same name
        if let Some(existing) = queues.get(name) {
            warn!(queue = name, "queue already registered, returning existing handle");
            return Ok(Arc::clone(existing));
        }
        queues.insert(name.to_string(), Arc::clone(&handle));
        drop(queues);

        self.health.init(name).await;
        info!(queue = name, "registered queue");
        Ok(handle)
    }

    /// Look up a queue handle.
    ///
    /// Fail-open: an unhealthy queue still returns its handle with a
    /// warning; the caller decides whether to proceed.
    pub async fn get_queue(&self, name: &str) -> QueueResult<Arc<QueueHandle>> {
        let queues = self.queues.read().await;
        let handle = queues
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::not_found(name))?;
        drop(queues);

        if self.health.is_unhealthy(name).await {
            warn!(queue = name, "queue is unhealthy; returning handle anyway");
        }
        Ok(handle)
    }

    /// Names of all registered queues.
    pub async fn queue_names(&self) -> Vec<String> {
        self.queues.read().await.keys().cloned().collect()
    }

    /// Number of registered queues.
    pub async fn len(&self) -> usize {
        self.queues.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queues.read().await.is_empty()
    }

    /// Drop every registered queue. Used by shutdown.
    pub(crate) async fn clear(&self) {
        self.queues.write().await.clear();
    }
}
