//! Job dispatch.
//!
//! Validates the target queue, sanitizes the payload, merges options,
//! and enqueues through the broker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{info, warn};

use leadflow_broker::Broker;
use leadflow_models::{Job, JobOptions};

use crate::error::{QueueError, QueueResult};
use crate::metrics;
use crate::registry::QueueRegistry;

/// Payload keys redacted before a job is persisted or logged.
/// Matching is literal and case-sensitive.
const SENSITIVE_KEYS: [&str; 1] = ["apiKey"];

/// Accepts typed job payloads and enqueues them with per-job options.
pub struct Dispatcher {
    registry: Arc<QueueRegistry>,
    broker: Arc<dyn Broker>,
    closed: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<QueueRegistry>,
        broker: Arc<dyn Broker>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            registry,
            broker,
            closed,
        }
    }

    /// Enqueue a job.
    ///
    /// `options` replaces the queue's default job options when given.
    /// Broker unavailability is surfaced to the caller; retrying the
    /// enqueue is the caller's decision.
    pub async fn add_job(
        &self,
        queue_name: &str,
        payload: Map<String, Value>,
        options: Option<JobOptions>,
    ) -> QueueResult<Job> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        // QueueNotFound is fatal to the caller; unhealthy queues are
        // fail-open and already warned about by the registry.
        let handle = self.registry.get_queue(queue_name).await?;

        let payload = sanitize_payload(queue_name, payload);
        let options = options.unwrap_or_else(|| handle.options().job_options.clone());
        let job = Job::new(queue_name, payload, options);

        self.broker.enqueue(queue_name, &job).await?;
        metrics::record_job_enqueued(queue_name);
        info!(queue = queue_name, job_id = %job.id, "job dispatched");
        Ok(job)
    }
}

/// Remove sensitive fields from the payload before it reaches broker
/// storage or logs. Walks nested objects and arrays.
fn sanitize_payload(queue: &str, mut payload: Map<String, Value>) -> Map<String, Value> {
    let mut redacted = 0usize;
    for key in SENSITIVE_KEYS {
        if payload.remove(key).is_some() {
            redacted += 1;
        }
    }
    for value in payload.values_mut() {
        redacted += sanitize_value(value);
    }
    if redacted > 0 {
        warn!(queue, redacted, "removed sensitive payload fields");
    }
    payload
}

fn sanitize_value(value: &mut Value) -> usize {
    let mut redacted = 0usize;
    match value {
        Value::Object(map) => {
            for key in SENSITIVE_KEYS {
                if map.remove(key).is_some() {
                    redacted += 1;
                }
            }
            for nested in map.values_mut() {
                redacted += sanitize_value(nested);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                redacted += sanitize_value(item);
            }
        }
        _ => {}
    }
    redacted
}
