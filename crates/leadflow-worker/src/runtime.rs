//! Worker runtime.
//!
//! One handler per queue, bounded by a semaphore. Deliveries flow
//! waiting -> active -> completed, or back through the broker's delayed
//! set with the job's backoff until attempts are exhausted, then into
//! the dead letter set.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use leadflow_broker::{Broker, Delivery};
use leadflow_models::{Job, JobId};
use leadflow_queue::registry::QueueHandle;
use leadflow_queue::{metrics, QueueManager};

use crate::config::WorkerConfig;
use crate::error::{JobError, WorkerError, WorkerResult};

/// Per-execution context handed to the handler.
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    queue: String,
    progress: Arc<AtomicU8>,
}

impl JobContext {
    fn new(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            queue: job.queue.clone(),
            progress: Arc::new(AtomicU8::new(0)),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Report advisory progress (0-100). Monotonic within one execution;
    /// regressions are ignored.
    pub fn report_progress(&self, percent: u8) {
        let percent = percent.min(100);
        let previous = self.progress.fetch_max(percent, Ordering::SeqCst);
        if percent > previous {
            debug!(queue = %self.queue, job_id = %self.job_id, percent, "job progress");
        }
    }

    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::SeqCst)
    }
}

/// A queue processor. Implemented directly or via any async closure
/// taking `(Job, JobContext)`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job, ctx: JobContext) -> Result<(), JobError>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn handle(&self, job: Job, ctx: JobContext) -> Result<(), JobError> {
        (self)(job, ctx).await
    }
}

/// Pulls deliveries from the broker and drives registered handlers.
pub struct WorkerRuntime {
    manager: Arc<QueueManager>,
    config: WorkerConfig,
    consumer_name: String,
    registered: parking_lot::Mutex<HashSet<String>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerRuntime {
    pub fn new(manager: Arc<QueueManager>, config: WorkerConfig) -> Self {
        let consumer_name = format!("worker-{}", Uuid::new_v4());
        Self {
            manager,
            config,
            consumer_name,
            registered: parking_lot::Mutex::new(HashSet::new()),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Register `handler` as the processor for `queue` and start
    /// consuming with at most `concurrency` concurrent executions.
    ///
    /// One handler per queue; a second registration for the same queue is
    /// rejected, as is any registration after shutdown has begun.
    pub async fn process<H>(&self, queue: &str, handler: H, concurrency: usize) -> WorkerResult<()>
    where
        H: JobHandler + 'static,
    {
        if self.manager.is_closed() {
            return Err(WorkerError::ShuttingDown);
        }
        {
            let mut registered = self.registered.lock();
            if !registered.insert(queue.to_string()) {
                return Err(WorkerError::DuplicateHandler(queue.to_string()));
            }
        }

        let handle = match self.manager.get_queue(queue).await {
            Ok(handle) => handle,
            Err(e) => {
                self.registered.lock().remove(queue);
                return Err(e.into());
            }
        };

        let concurrency = concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let handler = Arc::new(handler);
        let broker = self.manager.broker();

        info!(
            queue,
            concurrency,
            consumer = %self.consumer_name,
            "registered queue processor"
        );

        let consume_task = self.spawn_consume_loop(
            queue.to_string(),
            Arc::clone(&broker),
            Arc::clone(&handle),
            Arc::clone(&semaphore),
            Arc::clone(&handler),
        );
        let claim_task = self.spawn_claim_loop(
            queue.to_string(),
            broker,
            handle,
            semaphore,
            handler,
        );

        let mut tasks = self.tasks.lock();
        tasks.push(consume_task);
        tasks.push(claim_task);
        Ok(())
    }

    /// Wait for all consume and claim loops to exit. Call after
    /// `close_all` has signaled shutdown.
    pub async fn join(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    fn spawn_consume_loop<H>(
        &self,
        queue: String,
        broker: Arc<dyn Broker>,
        handle: Arc<QueueHandle>,
        semaphore: Arc<Semaphore>,
        handler: Arc<H>,
    ) -> JoinHandle<()>
    where
        H: JobHandler + 'static,
    {
        let mut shutdown = self.manager.subscribe_shutdown();
        let consumer = self.consumer_name.clone();
        let batch = self.config.dequeue_batch;
        let block = self.config.block_timeout;
        let job_timeout = self.config.job_timeout;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!(queue, "stopping queue consumer");
                            break;
                        }
                    }
                    result = Self::consume_batch(
                        &queue, &broker, &handle, &semaphore, &handler,
                        &consumer, batch, block, job_timeout,
                    ) => {
                        if let Err(e) = result {
                            error!(queue, error = %e, "error consuming jobs");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        })
    }

    fn spawn_claim_loop<H>(
        &self,
        queue: String,
        broker: Arc<dyn Broker>,
        handle: Arc<QueueHandle>,
        semaphore: Arc<Semaphore>,
        handler: Arc<H>,
    ) -> JoinHandle<()>
    where
        H: JobHandler + 'static,
    {
        let mut shutdown = self.manager.subscribe_shutdown();
        let consumer = self.consumer_name.clone();
        let interval = self.config.claim_interval;
        let min_idle = self.config.claim_min_idle;
        let batch = self.config.dequeue_batch;
        let job_timeout = self.config.job_timeout;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match broker.claim_stalled(&queue, &consumer, min_idle, batch).await {
                            Ok(deliveries) if !deliveries.is_empty() => {
                                info!(queue, count = deliveries.len(), "claimed stalled deliveries");
                                for delivery in deliveries {
                                    let Ok(permit) =
                                        Arc::clone(&semaphore).acquire_owned().await
                                    else {
                                        return;
                                    };
                                    let broker = Arc::clone(&broker);
                                    let handle = Arc::clone(&handle);
                                    let handler = Arc::clone(&handler);
                                    tokio::spawn(async move {
                                        let _permit = permit;
                                        Self::execute_delivery(
                                            broker, handle, handler, delivery, job_timeout,
                                        )
                                        .await;
                                    });
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!(queue, error = %e, "failed to claim stalled deliveries");
                            }
                        }
                    }
                }
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn consume_batch<H>(
        queue: &str,
        broker: &Arc<dyn Broker>,
        handle: &Arc<QueueHandle>,
        semaphore: &Arc<Semaphore>,
        handler: &Arc<H>,
        consumer: &str,
        batch: usize,
        block: Duration,
        job_timeout: Duration,
    ) -> WorkerResult<()>
    where
        H: JobHandler + 'static,
    {
        let available = semaphore.available_permits();
        if available == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let deliveries = broker
            .dequeue(queue, consumer, available.min(batch), block)
            .await?;
        if deliveries.is_empty() {
            return Ok(());
        }
        debug!(queue, count = deliveries.len(), "consumed deliveries");

        for delivery in deliveries {
            let permit = Arc::clone(semaphore)
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::ShuttingDown)?;
            let broker = Arc::clone(broker);
            let handle = Arc::clone(handle);
            let handler = Arc::clone(handler);
            tokio::spawn(async move {
                let _permit = permit;
                Self::execute_delivery(broker, handle, handler, delivery, job_timeout).await;
            });
        }
        Ok(())
    }

    /// Run one delivery to completion, retry scheduling, or dead letter.
    async fn execute_delivery<H>(
        broker: Arc<dyn Broker>,
        handle: Arc<QueueHandle>,
        handler: Arc<H>,
        mut delivery: Delivery,
        job_timeout: Duration,
    ) where
        H: JobHandler + 'static,
    {
        let queue = delivery.job.queue.clone();
        let job_id = delivery.job.id.clone();
        let ctx = JobContext::new(&delivery.job);

        handle.counters().job_started();
        info!(queue = %queue, job_id = %job_id, attempt = delivery.job.attempts_made + 1, "executing job");

        let result = match tokio::time::timeout(
            job_timeout,
            handler.handle(delivery.job.clone(), ctx.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(JobError::Timeout),
        };

        match result {
            Ok(()) => {
                if let Err(e) = broker.ack(&queue, &delivery.delivery_id).await {
                    error!(queue = %queue, job_id = %job_id, error = %e, "failed to ack job");
                }
                handle.counters().record_completed();
                metrics::record_job_completed(&queue);
                info!(queue = %queue, job_id = %job_id, progress = ctx.progress(), "job completed");
            }
            Err(e) => {
                error!(queue = %queue, job_id = %job_id, error = %e, "job attempt failed");
                delivery.job.attempts_made += 1;

                if delivery.job.attempts_exhausted() {
                    warn!(
                        queue = %queue,
                        job_id = %job_id,
                        attempts = delivery.job.attempts_made,
                        "attempts exhausted, dead-lettering job"
                    );
                    if let Err(dlq_err) = broker.dead_letter(&queue, &delivery, &e.to_string()).await
                    {
                        error!(queue = %queue, job_id = %job_id, error = %dlq_err, "failed to dead-letter job");
                    }
                    handle.counters().record_failed();
                    metrics::record_job_failed(&queue);
                    metrics::record_job_dead_lettered(&queue);
                } else {
                    let delay = delivery
                        .job
                        .options
                        .backoff
                        .delay_for_attempt(delivery.job.attempts_made);
                    info!(
                        queue = %queue,
                        job_id = %job_id,
                        attempt = delivery.job.attempts_made,
                        max_attempts = delivery.job.options.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "scheduling retry"
                    );
                    if let Err(retry_err) = broker.retry(&queue, &delivery, delay).await {
                        error!(queue = %queue, job_id = %job_id, error = %retry_err, "failed to schedule retry");
                    }
                }
            }
        }

        handle.counters().job_finished();
    }
}
