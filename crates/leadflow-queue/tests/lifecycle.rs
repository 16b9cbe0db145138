//! End-to-end lifecycle tests over the in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use leadflow_broker::{Broker, MemoryBroker};
use leadflow_models::{HealthStatus, JobOptions};
use leadflow_queue::{HealthMonitor, HealthPolicy, QueueError, QueueManager, QueueOptions};

fn payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other:?}"),
    }
}

fn manager() -> (QueueManager, Arc<dyn Broker>) {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    (QueueManager::new(Arc::clone(&broker)), broker)
}

#[tokio::test]
async fn create_and_get_round_trip() {
    let (manager, _broker) = manager();

    let created = manager
        .create_queue("email-sequence", QueueOptions::default().with_concurrency(4))
        .await
        .unwrap();
    let fetched = manager.get_queue("email-sequence").await.unwrap();

    assert!(Arc::ptr_eq(&created, &fetched));
    assert_eq!(fetched.options().concurrency, Some(4));
}

#[tokio::test]
async fn dispatched_job_is_sanitized_before_storage() {
    let (manager, broker) = manager();
    manager
        .create_queue("data-enrichment", QueueOptions::default())
        .await
        .unwrap();

    let job = manager
        .add_job(
            "data-enrichment",
            payload(json!({
                "leadId": "L-42",
                "apiKey": "sk-live-secret",
                "provider": { "name": "clearbit", "apiKey": "sk-nested" },
            })),
            None,
        )
        .await
        .unwrap();
    assert!(!job.payload.contains_key("apiKey"));

    // What the broker stored matches what add_job returned
    let deliveries = broker
        .dequeue("data-enrichment", "test-consumer", 1, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(deliveries.len(), 1);
    let stored = &deliveries[0].job;
    assert_eq!(stored.id, job.id);
    assert!(!stored.payload.contains_key("apiKey"));
    assert_eq!(stored.payload["provider"], json!({ "name": "clearbit" }));
}

#[tokio::test]
async fn add_job_to_unknown_queue_fails() {
    let (manager, _broker) = manager();
    let result = manager
        .add_job("never-registered", payload(json!({ "x": 1 })), None)
        .await;
    assert!(matches!(result, Err(QueueError::QueueNotFound(_))));
}

#[tokio::test]
async fn explicit_options_override_queue_defaults() {
    let (manager, broker) = manager();
    manager
        .create_queue(
            "lead-scoring",
            QueueOptions::default().with_job_options(JobOptions::default().with_max_attempts(5)),
        )
        .await
        .unwrap();

    let defaulted = manager
        .add_job("lead-scoring", payload(json!({ "leadId": "L-1" })), None)
        .await
        .unwrap();
    assert_eq!(defaulted.options.max_attempts, 5);

    let explicit = manager
        .add_job(
            "lead-scoring",
            payload(json!({ "leadId": "L-2" })),
            Some(JobOptions::default().with_max_attempts(1)),
        )
        .await
        .unwrap();
    assert_eq!(explicit.options.max_attempts, 1);

    let counts = broker.counts("lead-scoring").await.unwrap();
    assert_eq!(counts.waiting, 2);
}

#[tokio::test]
async fn metrics_snapshot_reflects_counters_and_depths() {
    let (manager, _broker) = manager();
    let handle = manager
        .create_queue("analytics-rollup", QueueOptions::default())
        .await
        .unwrap();

    manager
        .add_job("analytics-rollup", payload(json!({ "day": "2026-08-26" })), None)
        .await
        .unwrap();
    handle.counters().record_completed();
    handle.counters().record_completed();
    handle.counters().record_failed();

    let metrics = manager.queue_metrics("analytics-rollup").await.unwrap();
    assert_eq!(metrics.waiting_jobs, 1);
    assert_eq!(metrics.total_completed, 2);
    assert_eq!(metrics.total_failed, 1);
    assert!((metrics.completion_rate - 2.0 / 3.0).abs() < 1e-9);
    assert!((metrics.error_rate - 1.0 / 3.0).abs() < 1e-9);
}

#[tokio::test]
async fn close_all_drains_and_is_idempotent() {
    let (manager, broker) = manager();
    let manager = manager.with_drain_timeout(Duration::from_millis(200));
    manager
        .create_queue("cache-warmup", QueueOptions::default())
        .await
        .unwrap();

    let report = manager.close_all().await;
    assert!(report.is_clean());
    assert!(manager.is_closed());
    assert!(manager.registry().is_empty().await);
    assert!(*manager.subscribe_shutdown().borrow());

    // Enqueue is refused after shutdown
    let result = manager
        .add_job("cache-warmup", payload(json!({ "x": 1 })), None)
        .await;
    assert!(matches!(result, Err(QueueError::Closed)));

    // Second call is a clean no-op
    let again = manager.close_all().await;
    assert!(again.is_clean());

    // Broker refuses further work once closed
    assert!(broker.counts("cache-warmup").await.is_err());
}

#[tokio::test]
async fn monitor_cycle_marks_queue_unhealthy_on_broker_error() {
    let (manager, broker) = manager();
    manager
        .create_queue("data-enrichment", QueueOptions::default())
        .await
        .unwrap();

    let monitor = HealthMonitor::new(
        manager.registry(),
        manager.health_registry(),
        Arc::clone(&broker),
        HealthPolicy::default(),
        Duration::from_secs(30),
    );

    monitor.run_cycle().await;
    let health = manager.queue_health("data-enrichment").await.unwrap();
    assert_eq!(health.status, HealthStatus::Healthy);

    // Broker goes away between cycles
    broker.close().await.unwrap();
    monitor.run_cycle().await;

    let health = manager.queue_health("data-enrichment").await.unwrap();
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert!(health.last_error.is_some());
}

#[tokio::test]
async fn monitor_reports_broker_dead_letter_depth() {
    let (manager, broker) = manager();
    manager
        .create_queue("lead-scoring", QueueOptions::default())
        .await
        .unwrap();

    // A job dead-lettered by some other worker: local counters never
    // saw it, only the broker did
    manager
        .add_job("lead-scoring", payload(json!({ "leadId": "L-9" })), None)
        .await
        .unwrap();
    let deliveries = broker
        .dequeue("lead-scoring", "other-worker", 1, Duration::from_millis(100))
        .await
        .unwrap();
    broker
        .dead_letter("lead-scoring", &deliveries[0], "scoring model unavailable")
        .await
        .unwrap();

    let monitor = HealthMonitor::new(
        manager.registry(),
        manager.health_registry(),
        Arc::clone(&broker),
        HealthPolicy::default(),
        Duration::from_secs(30),
    );
    monitor.run_cycle().await;

    let health = manager.queue_health("lead-scoring").await.unwrap();
    assert_eq!(health.failed_count, 1);
    assert_eq!(health.completed_count, 0);
}

#[tokio::test]
async fn close_all_reports_stuck_queue() {
    let (manager, _broker) = manager();
    let manager = manager.with_drain_timeout(Duration::from_millis(50));
    let handle = manager
        .create_queue("email-sequence", QueueOptions::default())
        .await
        .unwrap();

    // Simulate a job that never finishes
    handle.counters().job_started();

    let report = manager.close_all().await;
    assert!(!report.is_clean());
    assert!(report.errors.iter().any(|e| e.contains("email-sequence")));
}
