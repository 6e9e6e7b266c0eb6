use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::JobState;

/// Opaque, globally unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
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

/// One field the extraction stage should produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub example: Option<String>,
    /// Regex the extracted value must match.
    #[serde(default)]
    pub validator: Option<String>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            example: None,
            validator: None,
        }
    }

    pub fn with_example(mut self, example: impl Into<String>) -> Self {
        self.example = Some(example.into());
        self
    }

    pub fn with_validator(mut self, pattern: impl Into<String>) -> Self {
        self.validator = Some(pattern.into());
        self
    }
}

/// Per-job execution options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Maximum number of discovery targets carried into retrieval.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Upper bound on the accrued cost (USD) across all attempts.
    #[serde(default)]
    pub cost_threshold: Option<f64>,
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Per-attempt deadline for external collector calls.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_top_k() -> usize {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_timeout_ms() -> u64 {
    120_000
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            cost_threshold: None,
            max_attempts: default_max_attempts(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl JobOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// The three sequential pipeline phases of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovery,
    Retrieval,
    Extraction,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Discovery => write!(f, "discovery"),
            Stage::Retrieval => write!(f, "retrieval"),
            Stage::Extraction => write!(f, "extraction"),
        }
    }
}

/// Classified terminal error of a job, as seen by callers.
///
/// Provider-specific failures are normalized into these variants before they
/// leave the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobError {
    /// Malformed submission.
    Validation(String),
    /// Retryable failure that exhausted `max_attempts`.
    Transient(String),
    /// Failure that can never succeed on retry.
    Permanent(String),
    /// Cancelled on request.
    Cancelled,
    /// Hub torn down before the job finished.
    Shutdown,
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::Validation(msg) => write!(f, "Validation error: {msg}"),
            JobError::Transient(msg) => write!(f, "Transient error: {msg}"),
            JobError::Permanent(msg) => write!(f, "Permanent error: {msg}"),
            JobError::Cancelled => write!(f, "Cancelled"),
            JobError::Shutdown => write!(f, "Hub shut down"),
        }
    }
}

/// Authoritative record of one submitted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Submission order, unique per registry.
    pub seq: u64,
    pub query: String,
    pub schema: Vec<FieldSpec>,
    pub options: JobOptions,
    pub state: JobState,
    pub state_history: Vec<JobState>,
    pub attempt_count: u32,
    /// Stage currently executing, if any.
    pub stage: Option<Stage>,
    pub cost_usd: f64,
    pub output: Option<serde_json::Value>,
    pub error: Option<JobError>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(seq: u64, query: String, schema: Vec<FieldSpec>, options: JobOptions) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            seq,
            query,
            schema,
            options,
            state: JobState::Pending,
            state_history: Vec::new(),
            attempt_count: 0,
            stage: None,
            cost_usd: 0.0,
            output: None,
            error: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves the record to `next`, keeping the history. Edge legality is the
    /// registry's concern.
    pub(crate) fn set_state(&mut self, next: JobState) {
        self.state_history.push(self.state);
        self.state = next;
        self.updated_at = Utc::now();
        if next != JobState::Running {
            self.stage = None;
        }
    }
}

/// Final result of a job, delivered once it reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub job_id: JobId,
    pub status: JobState,
    pub result: Result<serde_json::Value, JobError>,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub attempts: u32,
    pub finished_at: DateTime<Utc>,
}

impl Outcome {
    /// Builds the outcome of a terminal record.
    pub fn from_record(record: &JobRecord) -> Self {
        let finished_at = record.updated_at;
        let latency = finished_at - record.created_at;
        let result = match &record.error {
            Some(err) => Err(err.clone()),
            None => Ok(record.output.clone().unwrap_or(serde_json::Value::Null)),
        };

        Self {
            job_id: record.id,
            status: record.state,
            result,
            cost_usd: record.cost_usd,
            latency_ms: latency.num_milliseconds().max(0) as u64,
            attempts: record.attempt_count,
            finished_at,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobState::Completed
    }
}
