//! Redis Streams broker implementation.
//!
//! Each queue maps to a stream plus a consumer group, a sorted set for
//! delayed deliveries, and a dead-letter stream for terminal failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use leadflow_models::{Job, QueueCounts};

use crate::broker::{Broker, Delivery};
use crate::connection::{BrokerConnection, ConnectionManager};
use crate::error::{BrokerError, BrokerResult};

/// How many due delayed entries are promoted per dequeue pass.
const PROMOTE_BATCH: usize = 64;

pub struct RedisBroker {
    manager: Arc<ConnectionManager>,
    group: String,
    // One connection per queue for blocking reads. XREADGROUP BLOCK
    // would stall every command multiplexed on the shared transport.
    blocking: Mutex<HashMap<String, BrokerConnection>>,
}

impl RedisBroker {
    /// Create a broker over an existing connection manager.
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            manager,
            group: "lf:workers".to_string(),
            blocking: Mutex::new(HashMap::new()),
        }
    }

    /// Override the consumer group name.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    fn stream_key(queue: &str) -> String {
        format!("lf:{queue}:stream")
    }

    fn delayed_key(queue: &str) -> String {
        format!("lf:{queue}:delayed")
    }

    fn dlq_key(queue: &str) -> String {
        format!("lf:{queue}:dlq")
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    async fn conn(&self) -> BrokerResult<BrokerConnection> {
        self.manager.connection().await
    }

    /// Report a failed operation to the connection manager. Transport
    /// errors drop the shared cached connection so the next call
    /// re-establishes it.
    async fn guard<T>(&self, result: BrokerResult<T>) -> BrokerResult<T> {
        if let Err(e) = &result {
            self.manager.note_failure(e).await;
        }
        result
    }

    /// Connection used for blocking reads on one queue, created on first
    /// use and dropped after an error.
    async fn blocking_conn(&self, queue: &str) -> BrokerResult<BrokerConnection> {
        let mut map = self.blocking.lock().await;
        if let Some(conn) = map.get(queue) {
            return Ok(conn.clone());
        }
        let conn = self.manager.dedicated_connection().await?;
        map.insert(queue.to_string(), conn.clone());
        Ok(conn)
    }

    async fn drop_blocking_conn(&self, queue: &str) {
        self.blocking.lock().await.remove(queue);
    }

    /// Move due entries from the delayed set into the stream.
    ///
    /// ZREM-first so concurrent consumers cannot promote the same entry
    /// twice.
    async fn promote_due(&self, conn: &mut BrokerConnection, queue: &str) -> BrokerResult<()> {
        let delayed_key = Self::delayed_key(queue);
        let due: Vec<String> = conn
            .zrangebyscore_limit(&delayed_key, 0u64, Self::now_ms(), 0, PROMOTE_BATCH as isize)
            .await?;

        for payload in due {
            let removed: u64 = conn.zrem(&delayed_key, &payload).await?;
            if removed == 0 {
                continue;
            }
            redis::cmd("XADD")
                .arg(Self::stream_key(queue))
                .arg("*")
                .arg("job")
                .arg(&payload)
                .query_async::<()>(conn)
                .await?;
        }
        Ok(())
    }

    fn parse_entries(
        &self,
        entries: Vec<(String, Option<Vec<u8>>)>,
    ) -> (Vec<Delivery>, Vec<String>) {
        let mut deliveries = Vec::new();
        let mut malformed = Vec::new();

        for (delivery_id, payload) in entries {
            let Some(payload) = payload else {
                warn!(delivery_id, "stream entry missing job field");
                malformed.push(delivery_id);
                continue;
            };
            match serde_json::from_slice::<Job>(&payload) {
                Ok(job) => {
                    debug!(job_id = %job.id, delivery_id, "consumed job from stream");
                    deliveries.push(Delivery { delivery_id, job });
                }
                Err(e) => {
                    warn!(delivery_id, error = %e, "failed to parse job payload");
                    malformed.push(delivery_id);
                }
            }
        }
        (deliveries, malformed)
    }

    async fn ensure_queue_inner(&self, queue: &str) -> BrokerResult<()> {
        let mut conn = self.conn().await?;

        // Create consumer group (ignore error if already exists)
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(Self::stream_key(queue))
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!(queue, group = %self.group, "created consumer group"),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(queue, group = %self.group, "consumer group already exists");
            }
            Err(e) => return Err(BrokerError::Redis(e)),
        }
        Ok(())
    }

    async fn enqueue_inner(&self, queue: &str, job: &Job) -> BrokerResult<String> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(job)?;

        if job.options.delay_ms > 0 {
            let due = Self::now_ms() + job.options.delay_ms;
            conn.zadd::<_, _, _, ()>(Self::delayed_key(queue), &payload, due)
                .await?;
            debug!(queue, job_id = %job.id, delay_ms = job.options.delay_ms, "enqueued delayed job");
            return Ok(job.id.to_string());
        }

        let message_id: String = redis::cmd("XADD")
            .arg(Self::stream_key(queue))
            .arg("*")
            .arg("job")
            .arg(&payload)
            .query_async(&mut conn)
            .await?;

        info!(queue, job_id = %job.id, message_id, "enqueued job");
        Ok(message_id)
    }

    async fn dequeue_inner(
        &self,
        queue: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> BrokerResult<Vec<Delivery>> {
        let mut conn = self.blocking_conn(queue).await?;
        self.promote_due(&mut conn, queue).await?;

        let result: redis::streams::StreamReadReply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(Self::stream_key(queue))
            .arg(">") // Only new messages
            .query_async(&mut conn)
            .await?;

        let mut raw = Vec::new();
        for stream_key in result.keys {
            for entry in stream_key.ids {
                let payload = match entry.map.get("job") {
                    Some(redis::Value::BulkString(bytes)) => Some(bytes.clone()),
                    _ => None,
                };
                raw.push((entry.id, payload));
            }
        }

        let (deliveries, malformed) = self.parse_entries(raw);
        for delivery_id in malformed {
            // Ack malformed entries so they are not redelivered forever
            self.ack_inner(queue, &delivery_id).await.ok();
        }
        Ok(deliveries)
    }

    async fn ack_inner(&self, queue: &str, delivery_id: &str) -> BrokerResult<()> {
        let mut conn = self.conn().await?;

        redis::cmd("XACK")
            .arg(Self::stream_key(queue))
            .arg(&self.group)
            .arg(delivery_id)
            .query_async::<()>(&mut conn)
            .await?;

        redis::cmd("XDEL")
            .arg(Self::stream_key(queue))
            .arg(delivery_id)
            .query_async::<()>(&mut conn)
            .await?;

        debug!(queue, delivery_id, "acknowledged delivery");
        Ok(())
    }

    async fn retry_inner(
        &self,
        queue: &str,
        delivery: &Delivery,
        delay: Duration,
    ) -> BrokerResult<()> {
        self.ack_inner(queue, &delivery.delivery_id).await?;

        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(&delivery.job)?;
        let due = Self::now_ms() + delay.as_millis() as u64;
        conn.zadd::<_, _, _, ()>(Self::delayed_key(queue), &payload, due)
            .await?;

        info!(
            queue,
            job_id = %delivery.job.id,
            attempt = delivery.job.attempts_made,
            delay_ms = delay.as_millis() as u64,
            "scheduled re-delivery"
        );
        Ok(())
    }

    async fn dead_letter_inner(
        &self,
        queue: &str,
        delivery: &Delivery,
        error: &str,
    ) -> BrokerResult<()> {
        if delivery.job.options.keep_failed {
            let mut conn = self.conn().await?;
            let payload = serde_json::to_string(&delivery.job)?;
            redis::cmd("XADD")
                .arg(Self::dlq_key(queue))
                .arg("*")
                .arg("job")
                .arg(&payload)
                .arg("error")
                .arg(error)
                .arg("original_id")
                .arg(&delivery.delivery_id)
                .query_async::<()>(&mut conn)
                .await?;
        }

        self.ack_inner(queue, &delivery.delivery_id).await?;
        warn!(queue, job_id = %delivery.job.id, error, "moved job to dead letter queue");
        Ok(())
    }

    async fn claim_stalled_inner(
        &self,
        queue: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        let mut conn = self.conn().await?;

        let pending: redis::streams::StreamPendingReply = redis::cmd("XPENDING")
            .arg(Self::stream_key(queue))
            .arg(&self.group)
            .query_async(&mut conn)
            .await?;

        if pending.count() == 0 {
            return Ok(Vec::new());
        }

        let result: redis::streams::StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
            .arg(Self::stream_key(queue))
            .arg(&self.group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        let mut raw = Vec::new();
        for entry in result.claimed {
            let payload = match entry.map.get("job") {
                Some(redis::Value::BulkString(bytes)) => Some(bytes.clone()),
                _ => None,
            };
            raw.push((entry.id, payload));
        }

        let (deliveries, malformed) = self.parse_entries(raw);
        for delivery_id in malformed {
            self.ack_inner(queue, &delivery_id).await.ok();
        }
        if !deliveries.is_empty() {
            info!(queue, claimed = deliveries.len(), "claimed stalled deliveries");
        }
        Ok(deliveries)
    }

    async fn counts_inner(&self, queue: &str) -> BrokerResult<QueueCounts> {
        let mut conn = self.conn().await?;
        let waiting: u64 = conn.xlen(Self::stream_key(queue)).await?;
        let delayed: u64 = conn.zcard(Self::delayed_key(queue)).await?;
        let failed: u64 = conn.xlen(Self::dlq_key(queue)).await?;
        Ok(QueueCounts {
            waiting,
            delayed,
            failed,
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ensure_queue(&self, queue: &str) -> BrokerResult<()> {
        let result = self.ensure_queue_inner(queue).await;
        self.guard(result).await
    }

    async fn enqueue(&self, queue: &str, job: &Job) -> BrokerResult<String> {
        let result = self.enqueue_inner(queue, job).await;
        self.guard(result).await
    }

    async fn dequeue(
        &self,
        queue: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> BrokerResult<Vec<Delivery>> {
        let result = self.dequeue_inner(queue, consumer, count, block).await;
        if result.is_err() {
            // The dedicated connection is suspect after any failed read
            self.drop_blocking_conn(queue).await;
        }
        self.guard(result).await
    }

    async fn ack(&self, queue: &str, delivery_id: &str) -> BrokerResult<()> {
        let result = self.ack_inner(queue, delivery_id).await;
        self.guard(result).await
    }

    async fn retry(&self, queue: &str, delivery: &Delivery, delay: Duration) -> BrokerResult<()> {
        let result = self.retry_inner(queue, delivery, delay).await;
        self.guard(result).await
    }

    async fn dead_letter(&self, queue: &str, delivery: &Delivery, error: &str) -> BrokerResult<()> {
        let result = self.dead_letter_inner(queue, delivery, error).await;
        self.guard(result).await
    }

    async fn claim_stalled(
        &self,
        queue: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        let result = self
            .claim_stalled_inner(queue, consumer, min_idle, count)
            .await;
        self.guard(result).await
    }

    async fn counts(&self, queue: &str) -> BrokerResult<QueueCounts> {
        let result = self.counts_inner(queue).await;
        self.guard(result).await
    }

    async fn close(&self) -> BrokerResult<()> {
        self.blocking.lock().await.clear();
        self.manager.close().await;
        Ok(())
    }
}
