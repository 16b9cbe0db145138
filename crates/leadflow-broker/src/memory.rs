//! In-memory broker implementation.
//!
//! Process-local broker used by the test suite and by embedded
//! deployments that do not run Redis. Honors priority and delay
//! ordering; delivery state does not survive a restart.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use leadflow_models::{Job, QueueCounts};

use crate::broker::{Broker, Delivery};
use crate::error::{BrokerError, BrokerResult};

/// Cap on one blocking-dequeue sleep so delayed promotion stays timely.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

struct ReadyEntry {
    priority: i32,
    seq: u64,
    job: Job,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    // Max-heap: highest priority first, FIFO within a priority.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PendingEntry {
    job: Job,
    claimed_at: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: BinaryHeap<ReadyEntry>,
    delayed: Vec<(Instant, Job)>,
    pending: HashMap<String, PendingEntry>,
    failed: Vec<(Job, String)>,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant, seq: &AtomicU64) {
        let mut idx = 0;
        while idx < self.delayed.len() {
            if self.delayed[idx].0 <= now {
                let (_, job) = self.delayed.swap_remove(idx);
                self.ready.push(ReadyEntry {
                    priority: job.options.priority,
                    seq: seq.fetch_add(1, Ordering::SeqCst),
                    job,
                });
            } else {
                idx += 1;
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    notify: Notify,
    seq: AtomicU64,
    closed: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    /// Terminal failed jobs with their final errors, for inspection.
    pub async fn failed_jobs(&self, queue: &str) -> Vec<(Job, String)> {
        let queues = self.queues.lock().await;
        queues
            .get(queue)
            .map(|state| state.failed.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ensure_queue(&self, queue: &str) -> BrokerResult<()> {
        self.check_open()?;
        let mut queues = self.queues.lock().await;
        queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn enqueue(&self, queue: &str, job: &Job) -> BrokerResult<String> {
        self.check_open()?;
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();

        if job.options.delay_ms > 0 {
            let due = Instant::now() + Duration::from_millis(job.options.delay_ms);
            state.delayed.push((due, job.clone()));
        } else {
            state.ready.push(ReadyEntry {
                priority: job.options.priority,
                seq: self.seq.fetch_add(1, Ordering::SeqCst),
                job: job.clone(),
            });
        }
        drop(queues);

        self.notify.notify_waiters();
        debug!(queue, job_id = %job.id, "enqueued job");
        Ok(job.id.to_string())
    }

    async fn dequeue(
        &self,
        queue: &str,
        _consumer: &str,
        count: usize,
        block: Duration,
    ) -> BrokerResult<Vec<Delivery>> {
        let deadline = Instant::now() + block;

        loop {
            self.check_open()?;
            let notified = self.notify.notified();

            {
                let mut queues = self.queues.lock().await;
                if let Some(state) = queues.get_mut(queue) {
                    let now = Instant::now();
                    state.promote_due(now, &self.seq);

                    let mut out = Vec::new();
                    while out.len() < count {
                        let Some(entry) = state.ready.pop() else { break };
                        let delivery_id =
                            format!("mem-{}", self.seq.fetch_add(1, Ordering::SeqCst));
                        state.pending.insert(
                            delivery_id.clone(),
                            PendingEntry {
                                job: entry.job.clone(),
                                claimed_at: now,
                            },
                        );
                        out.push(Delivery {
                            delivery_id,
                            job: entry.job,
                        });
                    }
                    if !out.is_empty() {
                        return Ok(out);
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(remaining.min(POLL_INTERVAL), notified).await;
        }
    }

    async fn ack(&self, queue: &str, delivery_id: &str) -> BrokerResult<()> {
        self.check_open()?;
        let mut queues = self.queues.lock().await;
        if let Some(state) = queues.get_mut(queue) {
            state.pending.remove(delivery_id);
        }
        Ok(())
    }

    async fn retry(&self, queue: &str, delivery: &Delivery, delay: Duration) -> BrokerResult<()> {
        self.check_open()?;
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        state.pending.remove(&delivery.delivery_id);
        state
            .delayed
            .push((Instant::now() + delay, delivery.job.clone()));
        drop(queues);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self, queue: &str, delivery: &Delivery, error: &str) -> BrokerResult<()> {
        self.check_open()?;
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        state.pending.remove(&delivery.delivery_id);
        if delivery.job.options.keep_failed {
            state.failed.push((delivery.job.clone(), error.to_string()));
        }
        warn!(queue, job_id = %delivery.job.id, error, "dead-lettered job");
        Ok(())
    }

    async fn claim_stalled(
        &self,
        queue: &str,
        _consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        self.check_open()?;
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut out = Vec::new();
        for (delivery_id, entry) in state.pending.iter_mut() {
            if out.len() >= count {
                break;
            }
            if now.duration_since(entry.claimed_at) >= min_idle {
                entry.claimed_at = now;
                out.push(Delivery {
                    delivery_id: delivery_id.clone(),
                    job: entry.job.clone(),
                });
            }
        }
        Ok(out)
    }

    async fn counts(&self, queue: &str) -> BrokerResult<QueueCounts> {
        self.check_open()?;
        let queues = self.queues.lock().await;
        let counts = queues
            .get(queue)
            .map(|state| QueueCounts {
                waiting: state.ready.len() as u64,
                delayed: state.delayed.len() as u64,
                failed: state.failed.len() as u64,
            })
            .unwrap_or_default();
        Ok(counts)
    }

    async fn close(&self) -> BrokerResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut queues = self.queues.lock().await;
        queues.clear();
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_models::JobOptions;
    use serde_json::Map;

    fn job(queue: &str, options: JobOptions) -> Job {
        Job::new(queue, Map::new(), options)
    }

    #[tokio::test]
    async fn higher_priority_delivered_first() {
        let broker = MemoryBroker::new();
        broker.ensure_queue("q").await.unwrap();

        let low = job("q", JobOptions::default().with_priority(0));
        let high = job("q", JobOptions::default().with_priority(5));
        broker.enqueue("q", &low).await.unwrap();
        broker.enqueue("q", &high).await.unwrap();

        let deliveries = broker
            .dequeue("q", "c1", 2, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].job.id, high.id);
        assert_eq!(deliveries[1].job.id, low.id);
    }

    #[tokio::test]
    async fn delayed_job_not_delivered_early() {
        let broker = MemoryBroker::new();
        broker.ensure_queue("q").await.unwrap();

        let delayed = job(
            "q",
            JobOptions::default().with_delay(Duration::from_millis(80)),
        );
        broker.enqueue("q", &delayed).await.unwrap();

        let early = broker
            .dequeue("q", "c1", 1, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(early.is_empty());

        let late = broker
            .dequeue("q", "c1", 1, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].job.id, delayed.id);
    }

    #[tokio::test]
    async fn ack_removes_pending_and_dead_letter_retains() {
        let broker = MemoryBroker::new();
        broker.ensure_queue("q").await.unwrap();

        let j = job("q", JobOptions::default());
        broker.enqueue("q", &j).await.unwrap();
        let deliveries = broker
            .dequeue("q", "c1", 1, Duration::from_millis(50))
            .await
            .unwrap();
        let delivery = &deliveries[0];

        broker.dead_letter("q", delivery, "boom").await.unwrap();
        let failed = broker.failed_jobs("q").await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].1, "boom");

        let counts = broker.counts("q").await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.waiting, 0);
    }

    #[tokio::test]
    async fn retry_schedules_redelivery() {
        let broker = MemoryBroker::new();
        broker.ensure_queue("q").await.unwrap();

        let j = job("q", JobOptions::default());
        broker.enqueue("q", &j).await.unwrap();
        let deliveries = broker
            .dequeue("q", "c1", 1, Duration::from_millis(50))
            .await
            .unwrap();

        let mut delivery = deliveries[0].clone();
        delivery.job.attempts_made = 1;
        broker
            .retry("q", &delivery, Duration::from_millis(10))
            .await
            .unwrap();

        let redelivered = broker
            .dequeue("q", "c1", 1, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].job.attempts_made, 1);
    }

    #[tokio::test]
    async fn closed_broker_refuses_enqueue() {
        let broker = MemoryBroker::new();
        broker.close().await.unwrap();
        broker.close().await.unwrap(); // idempotent

        let j = job("q", JobOptions::default());
        assert!(matches!(
            broker.enqueue("q", &j).await,
            Err(BrokerError::Closed)
        ));
    }
}
