//! Concurrent coordinator for discover → retrieve → extract collection jobs.
//!
//! A [`CollectHub`] runs many independent jobs through an external
//! [`Collector`] while two shared FIFO rate limiters bound how many
//! retrieval and extraction calls are in flight at once.

pub mod aggregator;
pub mod collector;
pub mod config;
pub mod control;
pub mod error;
pub mod hub;
pub mod limiter;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod state_machine;

pub use collector::{CollectRequest, Collector, CollectorError, Discovery, Document, Extraction, Retrieval};
pub use config::{BackoffConfig, HubConfig, StreamClose};
pub use control::{CancelOutcome, LimiterKind};
pub use error::{HubError, LimiterError, Result};
pub use hub::{CollectHub, HubStats};
pub use limiter::{Lease, LimiterStats, RateLimiter};
pub use metrics::{MemorySink, MetricsSink, NoopSink, StageEvent, StageStatus, TracingSink};
pub use registry::{FieldValidator, JobFilter, RegistryStats};
pub use state_machine::{FieldSpec, JobError, JobId, JobOptions, JobRecord, JobState, Outcome, Stage};
