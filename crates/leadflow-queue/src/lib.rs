//! Queue registry, dispatch, health monitoring, and shutdown coordination.
//!
//! This crate provides:
//! - A registry of named queues bound to a shared broker
//! - A dispatcher that sanitizes and enqueues typed job payloads
//! - A periodic health monitor with pluggable status policy
//! - `QueueManager::close_all` for coordinated graceful shutdown

pub mod dispatcher;
pub mod error;
pub mod health;
pub mod manager;
pub mod metrics;
pub mod options;
pub mod registry;

pub use dispatcher::Dispatcher;
pub use error::{QueueError, QueueResult};
pub use health::{HealthMonitor, HealthPolicy, HealthRegistry};
pub use manager::{CloseReport, QueueManager};
pub use options::QueueOptions;
pub use registry::{QueueHandle, QueueRegistry};
