//! Worker daemon.
//!
//! Connects to the broker, registers the standard queues, starts the
//! health monitor and queue processors, and shuts down gracefully on
//! SIGTERM/ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use leadflow_broker::{Broker, BrokerConfig, ConnectionManager, RedisBroker};
use leadflow_models::queues::STANDARD;
use leadflow_models::Job;
use leadflow_queue::{HealthPolicy, QueueManager, QueueOptions};
use leadflow_worker::runtime::JobContext;
use leadflow_worker::{JobError, WorkerConfig, WorkerRuntime};

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing();
    info!("Starting leadflow-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    let manager_conn = Arc::new(ConnectionManager::new(BrokerConfig::from_env()));
    if let Err(e) = manager_conn.connect().await {
        error!("Failed to connect to broker: {}", e);
        std::process::exit(1);
    }

    let broker: Arc<dyn Broker> = Arc::new(RedisBroker::new(manager_conn));
    let manager = Arc::new(
        QueueManager::new(broker).with_drain_timeout(config.shutdown_timeout),
    );

    for queue in STANDARD {
        if let Err(e) = manager.create_queue(queue, QueueOptions::default()).await {
            error!("Failed to register queue '{}': {}", queue, e);
            std::process::exit(1);
        }
    }

    manager
        .start_health_monitor(HealthPolicy::default(), Duration::from_secs(30))
        .await;

    let runtime = WorkerRuntime::new(Arc::clone(&manager), config.clone());
    if config.log_only {
        // log_and_complete acknowledges every job, so this mode must
        // never be reached by accident against live queues
        warn!("WORKER_LOG_ONLY set: jobs will be logged and completed without processing");
        for queue in STANDARD {
            let handle = match manager.get_queue(queue).await {
                Ok(handle) => handle,
                Err(e) => {
                    error!("Queue '{}' missing after registration: {}", queue, e);
                    std::process::exit(1);
                }
            };
            let concurrency = config.concurrency_for(queue, handle.options());
            if let Err(e) = runtime.process(queue, log_and_complete, concurrency).await {
                error!("Failed to start processor for '{}': {}", queue, e);
                std::process::exit(1);
            }
        }
    } else {
        // Processors are wired in by the embedding application; without
        // them the daemon runs the health monitor and leaves jobs queued
        info!("No processors registered; set WORKER_LOG_ONLY=1 for log-only smoke runs");
    }

    wait_for_shutdown_signal().await;
    info!("Received shutdown signal");

    let report = manager.close_all().await;
    runtime.join().await;

    if report.is_clean() {
        info!("Worker shutdown complete");
    } else {
        for err in &report.errors {
            error!("Shutdown error: {}", err);
        }
        std::process::exit(1);
    }
}

async fn log_and_complete(job: Job, ctx: JobContext) -> Result<(), JobError> {
    info!(
        queue = %job.queue,
        job_id = %job.id,
        payload_fields = job.payload.len(),
        "processing job"
    );
    ctx.report_progress(100);
    Ok(())
}

fn init_tracing() {
    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("leadflow=info".parse().expect("valid directive"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            tokio::signal::ctrl_c().await.ok();
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}
