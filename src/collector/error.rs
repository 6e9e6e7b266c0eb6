//! Raw failures reported by a [`Collector`](super::Collector).
//!
//! These are provider-shaped and never reach hub callers directly: the worker
//! pool classifies them with [`crate::retry::classify`] and stores a
//! normalized [`JobError`](crate::state_machine::JobError) instead.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollectorError {
    /// The provider asked us to slow down.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// The call did not finish before the job deadline.
    #[error("timed out")]
    Timeout,

    /// DNS, connection reset, truncated body and friends.
    #[error("network error: {0}")]
    Network(String),

    /// Any non-success status reported by the provider.
    #[error("provider error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// The provider reports the query cannot be satisfied.
    #[error("unfulfillable query: {0}")]
    Unfulfillable(String),

    /// Extraction produced output that does not fit the schema.
    #[error("invalid output: {0}")]
    InvalidOutput(String),
}
