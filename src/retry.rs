//! Error classification and retry/backoff policy.
//!
//! Collector failures are mapped to an [`ErrorKind`], which decides whether
//! the failure is transient (retried with exponential backoff and jitter) or
//! permanent (the job fails immediately).

use std::time::Duration;

use rand::Rng;

use crate::collector::CollectorError;
use crate::config::BackoffConfig;

/// Retry-relevant classification of a collector failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Call exceeded the job deadline.
    Timeout,
    /// Provider throttling (rate limit, 429, 503).
    Throttled,
    /// Network-level failure.
    Connection,
    /// Provider-side 5xx that is not throttling.
    Provider5xx(u16),
    /// Provider rejected the request (4xx other than 429).
    Rejected(u16),
    /// Provider says the query cannot be satisfied.
    Unfulfillable,
    /// Output failed schema validation.
    InvalidOutput,
}

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

impl ErrorKind {
    pub fn class(self) -> ErrorClass {
        match self {
            ErrorKind::Timeout
            | ErrorKind::Throttled
            | ErrorKind::Connection
            | ErrorKind::Provider5xx(_) => ErrorClass::Transient,
            ErrorKind::Rejected(_) | ErrorKind::Unfulfillable | ErrorKind::InvalidOutput => {
                ErrorClass::Permanent
            }
        }
    }
}

/// Classify a provider status code.
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        429 | 503 => ErrorKind::Throttled,
        500..=599 => ErrorKind::Provider5xx(status),
        _ => ErrorKind::Rejected(status),
    }
}

/// Classify a collector error.
pub fn classify(err: &CollectorError) -> ErrorKind {
    match err {
        CollectorError::RateLimited { .. } => ErrorKind::Throttled,
        CollectorError::Timeout => ErrorKind::Timeout,
        CollectorError::Network(_) => ErrorKind::Connection,
        CollectorError::Api { status, .. } => classify_status(*status),
        CollectorError::Unfulfillable(_) => ErrorKind::Unfulfillable,
        CollectorError::InvalidOutput(_) => ErrorKind::InvalidOutput,
    }
}

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Fail the job now.
    NoRetry,
    /// Requeue the job after the given delay.
    RetryAfter(Duration),
}

/// Exponential backoff with jitter and a cap.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: BackoffConfig,
}

impl RetryPolicy {
    pub fn new(backoff: BackoffConfig) -> Self {
        Self { backoff }
    }

    /// Decide what to do after attempt number `attempt` (1-based) failed.
    pub fn decide(&self, attempt: u32, max_attempts: u32, err: &CollectorError) -> RetryDecision {
        if classify(err).class() == ErrorClass::Permanent || attempt >= max_attempts {
            return RetryDecision::NoRetry;
        }

        let mut delay = self.jittered_delay(attempt);
        if let CollectorError::RateLimited { retry_after_ms } = err {
            delay = delay.max(Duration::from_millis(*retry_after_ms));
        }
        RetryDecision::RetryAfter(delay)
    }

    /// `min(max_delay, base * multiplier^(attempt-1))` before jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let raw_ms = self.backoff.base_delay_ms as f64 * self.backoff.multiplier.powi(exp);
        let capped_ms = raw_ms.min(self.backoff.max_delay_ms as f64);
        Duration::from_millis(capped_ms as u64)
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.backoff.jitter <= 0.0 {
            return nominal;
        }
        let j = self.backoff.jitter;
        let factor = 1.0 + rand::thread_rng().gen_range(-j..=j);
        nominal.mul_f64(factor.max(0.0))
    }
}
