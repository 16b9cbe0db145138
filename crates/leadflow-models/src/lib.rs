//! Shared data models for the Leadflow queue core.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs, job options, and backoff policies
//! - Per-queue health records
//! - Queue metrics snapshots
//! - Standard queue names

pub mod health;
pub mod job;
pub mod metrics;
pub mod queues;

// Re-export common types
pub use health::{HealthStatus, QueueHealth};
pub use job::{BackoffPolicy, Job, JobId, JobOptions, JobState};
pub use metrics::{QueueCounts, QueueMetrics};
