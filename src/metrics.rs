//! Per-stage metric events.
//!
//! Workers emit one [`StageEvent`] each time a stage finishes, whether it
//! succeeded, failed or was cut short by cancellation. Sinks are
//! fire-and-forget: `record` must not block.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state_machine::{JobId, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// One finished stage of one attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageEvent {
    pub timestamp: DateTime<Utc>,
    pub job_id: JobId,
    pub stage: Stage,
    pub attempt: u32,
    /// Cost reported by the collector for this stage, 0 when it failed.
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub status: StageStatus,
}

pub trait MetricsSink: Send + Sync {
    fn record(&self, event: &StageEvent);
}

/// Logs every event at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&self, event: &StageEvent) {
        tracing::debug!(
            job_id = %event.job_id,
            stage = %event.stage,
            attempt = event.attempt,
            cost_usd = event.cost_usd,
            duration_ms = event.duration_ms,
            status = ?event.status,
            "Stage finished"
        );
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    #[inline]
    fn record(&self, _event: &StageEvent) {}
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<StageEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StageEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events of one job, in emission order.
    pub fn events_for(&self, job_id: JobId) -> Vec<StageEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.job_id == job_id)
            .collect()
    }
}

impl MetricsSink for MemorySink {
    fn record(&self, event: &StageEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
