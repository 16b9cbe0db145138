//! The broker transport seam.
//!
//! Dispatcher and worker runtime talk to queues only through this trait,
//! so the concrete broker (Redis Streams, in-memory) is swappable without
//! touching scheduling logic.

use std::time::Duration;

use async_trait::async_trait;

use leadflow_models::{Job, QueueCounts};

use crate::error::BrokerResult;

/// One delivered job plus the broker's delivery handle, needed to
/// ack/retry/dead-letter it later.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned delivery ID (distinct from the job ID)
    pub delivery_id: String,
    /// The job as stored
    pub job: Job,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Create broker-side structures for a queue if missing. Idempotent.
    async fn ensure_queue(&self, queue: &str) -> BrokerResult<()>;

    /// Store a job for delivery, honoring its delay option. Returns the
    /// broker-assigned ID.
    async fn enqueue(&self, queue: &str, job: &Job) -> BrokerResult<String>;

    /// Fetch up to `count` jobs for this consumer, blocking up to `block`.
    async fn dequeue(
        &self,
        queue: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> BrokerResult<Vec<Delivery>>;

    /// Mark a delivery completed and remove it.
    async fn ack(&self, queue: &str, delivery_id: &str) -> BrokerResult<()>;

    /// Schedule a failed delivery for re-delivery after `delay`. The
    /// delivery's job carries the already-incremented attempt counter.
    async fn retry(&self, queue: &str, delivery: &Delivery, delay: Duration) -> BrokerResult<()>;

    /// Move a delivery to the terminal failed set, retaining it for
    /// inspection together with the final error.
    async fn dead_letter(&self, queue: &str, delivery: &Delivery, error: &str) -> BrokerResult<()>;

    /// Reclaim deliveries that have been pending longer than `min_idle`
    /// (stalled consumers, crashed workers).
    async fn claim_stalled(
        &self,
        queue: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>>;

    /// Depth counts for one queue.
    async fn counts(&self, queue: &str) -> BrokerResult<QueueCounts>;

    /// Release broker resources. Idempotent.
    async fn close(&self) -> BrokerResult<()>;
}
