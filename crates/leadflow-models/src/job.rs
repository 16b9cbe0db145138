//! Job definitions for queue processing.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job state in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Job is waiting in queue
    #[default]
    Waiting,
    /// Job is scheduled for later delivery
    Delayed,
    /// Job is being processed
    Active,
    /// Job completed successfully
    Completed,
    /// Job failed (may be retried)
    Failed,
    /// Job exhausted its attempts and is retained for inspection
    DeadLettered,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::DeadLettered => "dead_lettered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::DeadLettered)
    }
}

/// Delay strategy between retry attempts of a failed job.
///
/// Serialized into broker storage alongside the job, so durations are
/// stored as milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Same delay for every retry.
    Fixed { delay_ms: u64 },
    /// Delay doubles each attempt, capped at `max_ms`.
    Exponential { base_ms: u64, max_ms: u64 },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Exponential {
            base_ms: 5_000,
            max_ms: 300_000,
        }
    }
}

impl BackoffPolicy {
    /// Delay before re-delivering a job that has already made `attempts_made`
    /// attempts. The first retry (one attempt made) gets the base delay.
    pub fn delay_for_attempt(&self, attempts_made: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            BackoffPolicy::Exponential { base_ms, max_ms } => {
                let exp = attempts_made.saturating_sub(1).min(31);
                let delay = base_ms.saturating_mul(1u64 << exp);
                Duration::from_millis(delay.min(max_ms))
            }
        }
    }
}

/// Per-job options, merged over queue defaults at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Maximum number of processing attempts before the job is dead-lettered.
    pub max_attempts: u32,
    /// Backoff between retries.
    pub backoff: BackoffPolicy,
    /// Higher priority jobs are delivered first where the broker supports it.
    pub priority: i32,
    /// Initial delivery delay in milliseconds.
    pub delay_ms: u64,
    /// Retain the job record after successful completion.
    pub keep_completed: bool,
    /// Retain the job record after terminal failure (for inspection).
    pub keep_failed: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            priority: 0,
            delay_ms: 0,
            keep_completed: false,
            keep_failed: true,
        }
    }
}

impl JobOptions {
    /// Set the maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the delivery priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the initial delivery delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = delay.as_millis() as u64;
        self
    }
}

/// One unit of work, as stored in the broker.
///
/// The payload is an opaque structured map; the queue core inspects it
/// only to redact sensitive fields before persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Name of the queue this job belongs to (fixed for the job's life)
    pub queue: String,
    /// Caller-defined payload
    pub payload: Map<String, Value>,
    /// Effective options after merging per-call options over queue defaults
    pub options: JobOptions,
    /// Number of processing attempts made so far
    #[serde(default)]
    pub attempts_made: u32,
    /// Advisory progress percentage (0-100) reported by the processor
    #[serde(default)]
    pub progress: u8,
    /// When the job was created
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Create a new job bound to a queue.
    pub fn new(queue: impl Into<String>, payload: Map<String, Value>, options: JobOptions) -> Self {
        Self {
            id: JobId::new(),
            queue: queue.into(),
            payload,
            options,
            attempts_made: 0,
            progress: 0,
            created_at: Utc::now(),
        }
    }

    /// True once the attempt counter has reached the configured maximum.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts_made >= self.options.max_attempts
    }
}
