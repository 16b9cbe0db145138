//! Standard queue names.
//!
//! The fixed set of logical queues registered at process start. Business
//! services address queues by these names when enqueueing work.

/// Outbound sequence email sends.
pub const EMAIL_SEQUENCE: &str = "email-sequence";
/// Periodic analytics aggregation.
pub const ANALYTICS_ROLLUP: &str = "analytics-rollup";
/// Third-party lead enrichment.
pub const DATA_ENRICHMENT: &str = "data-enrichment";
/// Lead score recalculation.
pub const LEAD_SCORING: &str = "lead-scoring";
/// Cache pre-warming.
pub const CACHE_WARMUP: &str = "cache-warmup";

/// All standard queues, in registration order.
pub const STANDARD: [&str; 5] = [
    EMAIL_SEQUENCE,
    ANALYTICS_ROLLUP,
    DATA_ENRICHMENT,
    LEAD_SCORING,
    CACHE_WARMUP,
];
