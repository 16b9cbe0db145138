//! Worker runtime for the job queue core.
//!
//! Registers one handler per queue, bounds concurrency with a semaphore,
//! retries failed attempts with the job's backoff policy, and wraps
//! volatile downstream calls in a circuit breaker.

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod runtime;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerBuilder, CircuitBreakerConfig, CircuitError, CircuitEvent,
    CircuitState,
};
pub use config::WorkerConfig;
pub use error::{JobError, WorkerError, WorkerResult};
pub use runtime::{JobContext, JobHandler, WorkerRuntime};
