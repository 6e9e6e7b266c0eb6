use thiserror::Error;

use crate::state_machine::{JobId, JobState};

#[derive(Debug, Error)]
pub enum HubError {
    #[error("Invalid submission: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("State conflict on job {job_id}: expected {expected}, found {actual}")]
    StateConflict {
        job_id: JobId,
        expected: JobState,
        actual: JobState,
    },

    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition { from: JobState, to: JobState },

    #[error("Unknown limiter: {0}")]
    UnknownLimiter(String),

    #[error("Limiter error: {0}")]
    Limiter(#[from] LimiterError),

    #[error("Hub is shut down")]
    Shutdown,

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Errors raised by a [`RateLimiter`](crate::limiter::RateLimiter).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimiterError {
    /// A lease was released twice or against the wrong limiter. This is an
    /// accounting bug and is always surfaced to operators.
    #[error("release of unknown lease {lease_id} on limiter {limiter}")]
    Release { limiter: String, lease_id: u64 },

    #[error("limiter {limiter} is shut down")]
    Shutdown { limiter: String },

    #[error("acquire requires at least one unit")]
    ZeroUnits,
}

pub type Result<T> = std::result::Result<T, HubError>;
