//! Worker runtime tests over the in-memory broker.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use leadflow_broker::{Broker, MemoryBroker};
use leadflow_models::{BackoffPolicy, JobOptions};
use leadflow_queue::{QueueManager, QueueOptions};
use leadflow_worker::{JobError, WorkerConfig, WorkerError, WorkerRuntime};

fn payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other:?}"),
    }
}

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        block_timeout: Duration::from_millis(20),
        job_timeout: Duration::from_secs(5),
        claim_interval: Duration::from_secs(3600),
        ..WorkerConfig::default()
    }
}

fn setup() -> (Arc<MemoryBroker>, Arc<QueueManager>) {
    let memory = Arc::new(MemoryBroker::new());
    let broker: Arc<dyn Broker> = Arc::clone(&memory) as Arc<dyn Broker>;
    (memory, Arc::new(QueueManager::new(broker)))
}

async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < end {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn failing_job_is_retried_exactly_max_attempts_then_dead_lettered() {
    let (memory, manager) = setup();
    let handle = manager
        .create_queue(
            "lead-scoring",
            QueueOptions::default().with_job_options(
                JobOptions::default()
                    .with_max_attempts(3)
                    .with_backoff(BackoffPolicy::Fixed { delay_ms: 10 }),
            ),
        )
        .await
        .unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    let runtime = WorkerRuntime::new(Arc::clone(&manager), fast_config());
    let seen = Arc::clone(&attempts);
    runtime
        .process(
            "lead-scoring",
            move |_job, _ctx| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Err(JobError::failed("scoring backend unavailable"))
                }
            },
            1,
        )
        .await
        .unwrap();

    manager
        .add_job("lead-scoring", payload(json!({ "leadId": "L-7" })), None)
        .await
        .unwrap();

    let end = tokio::time::Instant::now() + Duration::from_secs(5);
    while memory.failed_jobs("lead-scoring").await.is_empty() {
        assert!(
            tokio::time::Instant::now() < end,
            "job never reached the dead letter set"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(handle.counters().failed(), 1);

    let failed = memory.failed_jobs("lead-scoring").await;
    assert_eq!(failed[0].0.attempts_made, 3);
    assert_eq!(failed[0].1, "scoring backend unavailable");

    // No fourth attempt after the terminal failure
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let metrics = manager.queue_metrics("lead-scoring").await.unwrap();
    assert_eq!(metrics.total_failed, 1);
    assert_eq!(metrics.waiting_jobs, 0);
}

#[tokio::test]
async fn concurrency_never_exceeds_limit() {
    let (_memory, manager) = setup();
    let handle = manager
        .create_queue("email-sequence", QueueOptions::default())
        .await
        .unwrap();

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let runtime = WorkerRuntime::new(Arc::clone(&manager), fast_config());
    let current_c = Arc::clone(&current);
    let peak_c = Arc::clone(&peak);
    runtime
        .process(
            "email-sequence",
            move |_job, _ctx| {
                let current = Arc::clone(&current_c);
                let peak = Arc::clone(&peak_c);
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), JobError>(())
                }
            },
            2,
        )
        .await
        .unwrap();

    for i in 0..5 {
        manager
            .add_job("email-sequence", payload(json!({ "sendId": i })), None)
            .await
            .unwrap();
    }

    let done = wait_until(Duration::from_secs(5), || handle.counters().completed() == 5).await;
    assert!(done, "jobs did not complete");
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn completed_job_is_acked_and_counted() {
    let (memory, manager) = setup();
    let handle = manager
        .create_queue("cache-warmup", QueueOptions::default())
        .await
        .unwrap();

    let runtime = WorkerRuntime::new(Arc::clone(&manager), fast_config());
    runtime
        .process(
            "cache-warmup",
            |_job, ctx: leadflow_worker::JobContext| async move {
                ctx.report_progress(100);
                Ok::<(), JobError>(())
            },
            1,
        )
        .await
        .unwrap();

    manager
        .add_job("cache-warmup", payload(json!({ "key": "dashboard" })), None)
        .await
        .unwrap();

    let done = wait_until(Duration::from_secs(5), || handle.counters().completed() == 1).await;
    assert!(done, "job did not complete");

    let counts = memory.counts("cache-warmup").await.unwrap();
    assert_eq!(counts.waiting, 0);
    assert_eq!(counts.failed, 0);
    assert_eq!(handle.counters().active(), 0);
}

#[tokio::test]
async fn duplicate_and_post_shutdown_registrations_rejected() {
    let (_memory, manager) = setup();
    manager
        .create_queue("analytics-rollup", QueueOptions::default())
        .await
        .unwrap();

    let runtime = WorkerRuntime::new(Arc::clone(&manager), fast_config());
    let noop = |_job, _ctx| async move { Ok::<(), JobError>(()) };

    runtime.process("analytics-rollup", noop, 1).await.unwrap();
    let dup = runtime.process("analytics-rollup", noop, 1).await;
    assert!(matches!(dup, Err(WorkerError::DuplicateHandler(_))));

    let report = manager.close_all().await;
    assert!(report.is_clean());

    let late = runtime.process("data-enrichment", noop, 1).await;
    assert!(matches!(late, Err(WorkerError::ShuttingDown)));

    runtime.join().await;
}
