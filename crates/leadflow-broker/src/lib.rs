//! Broker connection management and queue transport.
//!
//! This crate provides:
//! - Supervised broker connections (standalone or clustered) with
//!   reconnect backoff and typed lifecycle events
//! - The `Broker` trait: enqueue/dequeue/ack/retry/dead-letter over a
//!   named queue
//! - A Redis Streams implementation and an in-memory implementation

pub mod broker;
pub mod config;
pub mod connection;
pub mod error;
pub mod memory;
pub mod redis_broker;
pub mod retry;

pub use broker::{Broker, Delivery};
pub use config::BrokerConfig;
pub use connection::{BrokerEvent, ConnectionManager};
pub use error::{BrokerError, BrokerErrorKind, BrokerResult};
pub use memory::MemoryBroker;
pub use redis_broker::RedisBroker;
pub use retry::{retry_async, RetryConfig};
