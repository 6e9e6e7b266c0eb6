//! Runtime control: pause/resume, cancellation and live resizing.
//!
//! Pausing and cancelling are orthogonal. Pause stops dispatch from the
//! queue and leaves job states alone; cancel acts on one job's state and
//! leaves the queue running.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::aggregator::ResultAggregator;
use crate::error::{HubError, Result};
use crate::limiter::RateLimiter;
use crate::pool::WorkerPool;
use crate::queue::JobQueue;
use crate::registry::{JobFilter, JobRegistry};
use crate::state_machine::{JobError, JobId, JobState, Outcome};

/// What a cancel request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was pending and is now `Cancelled`.
    Cancelled,
    /// The job is running; its worker will stop at the next checkpoint.
    Requested,
    /// The job had already finished.
    AlreadyTerminal,
}

/// The two shared limiters, addressable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterKind {
    Retrieval,
    Extraction,
}

impl FromStr for LimiterKind {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retrieval" => Ok(LimiterKind::Retrieval),
            "extraction" => Ok(LimiterKind::Extraction),
            _ => Err(HubError::UnknownLimiter(s.to_string())),
        }
    }
}

pub struct ControlPlane {
    registry: Arc<JobRegistry>,
    queue: Arc<JobQueue>,
    aggregator: Arc<ResultAggregator>,
    pool: Arc<WorkerPool>,
    retrieval: RateLimiter,
    extraction: RateLimiter,
    /// Serialises pool and limiter reconfiguration.
    reconfigure: Mutex<()>,
}

impl ControlPlane {
    pub fn new(
        registry: Arc<JobRegistry>,
        queue: Arc<JobQueue>,
        aggregator: Arc<ResultAggregator>,
        pool: Arc<WorkerPool>,
        retrieval: RateLimiter,
        extraction: RateLimiter,
    ) -> Self {
        Self {
            registry,
            queue,
            aggregator,
            pool,
            retrieval,
            extraction,
            reconfigure: Mutex::new(()),
        }
    }

    pub fn pause(&self) {
        self.queue.pause();
    }

    pub fn resume(&self) {
        self.queue.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.queue.is_paused()
    }

    /// Requests cancellation of one job. A pending job is cancelled on the
    /// spot; a running job stops at its worker's next checkpoint.
    pub fn cancel(&self, job_id: JobId) -> Result<CancelOutcome> {
        let state = self.registry.request_cancel(job_id)?;
        let outcome = match state {
            JobState::Pending => self.cancel_pending(job_id, JobError::Cancelled)?,
            JobState::Running => CancelOutcome::Requested,
            _ => CancelOutcome::AlreadyTerminal,
        };
        tracing::info!(job_id = %job_id, ?outcome, "Cancel requested");
        Ok(outcome)
    }

    /// Cancels every queued job without dispatching it, then requests
    /// cancellation of every other unfinished job. Returns how many jobs
    /// were cancelled or flagged.
    pub fn cancel_all(&self) -> usize {
        let queued = self.queue.cancel_all();
        let mut seen: HashSet<JobId> = HashSet::with_capacity(queued.len());
        let rest = self.registry.list_jobs(JobFilter::Active).map(|r| r.id);

        let mut affected = 0;
        for job_id in queued.into_iter().chain(rest) {
            if !seen.insert(job_id) {
                continue;
            }
            if let Ok(CancelOutcome::Cancelled | CancelOutcome::Requested) = self.cancel(job_id) {
                affected += 1;
            }
        }
        tracing::info!(affected, "All jobs cancelled");
        affected
    }

    /// `Pending → Cancelled` with `error`, then records the outcome. Losing
    /// the CAS to a worker's claim leaves the job flagged for its worker.
    pub(crate) fn cancel_pending(&self, job_id: JobId, error: JobError) -> Result<CancelOutcome> {
        let cancelled = self
            .registry
            .transition_with(job_id, JobState::Pending, JobState::Cancelled, |r| {
                r.error = Some(error)
            });
        match cancelled {
            Ok(record) => {
                if let Err(err) = self.aggregator.record(Outcome::from_record(&record)) {
                    tracing::error!(job_id = %job_id, "Outcome not recorded: {err}");
                }
                Ok(CancelOutcome::Cancelled)
            }
            Err(HubError::StateConflict { actual, .. }) if actual.is_terminal() => {
                Ok(CancelOutcome::AlreadyTerminal)
            }
            Err(HubError::StateConflict {
                actual: JobState::Running,
                ..
            }) => Ok(CancelOutcome::Requested),
            Err(err) => Err(err),
        }
    }

    /// Grows or shrinks the worker pool. Jobs in flight are never touched.
    pub async fn resize_pool(&self, n: usize) {
        let _guard = self.reconfigure.lock().await;
        self.pool.resize(n);
    }

    /// Changes the capacity of the limiter called `name` (`"retrieval"` or
    /// `"extraction"`). Held leases are never revoked.
    pub async fn resize_limiter(&self, name: &str, capacity: usize) -> Result<()> {
        let kind: LimiterKind = name.parse()?;
        let _guard = self.reconfigure.lock().await;
        self.limiter(kind).resize(capacity);
        Ok(())
    }

    pub fn limiter(&self, kind: LimiterKind) -> &RateLimiter {
        match kind {
            LimiterKind::Retrieval => &self.retrieval,
            LimiterKind::Extraction => &self.extraction,
        }
    }
}
