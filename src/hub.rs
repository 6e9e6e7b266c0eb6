//! The public facade: one [`CollectHub`] owns the registry, the queue, both
//! limiters, the worker pool and the result store.
//!
//! ```ignore
//! let hub = CollectHub::new(HubConfig::load()?, Arc::new(MyCollector::new()))?;
//! let id = hub.submit_job("bav99 diode", schema, JobOptions::default())?;
//! let outcome = hub.get_result(id).await?;
//! hub.shutdown().await;
//! ```

use std::sync::Arc;

use chrono::Utc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::aggregator::ResultAggregator;
use crate::collector::Collector;
use crate::config::{HubConfig, StreamClose};
use crate::control::{CancelOutcome, ControlPlane, LimiterKind};
use crate::error::{HubError, Result};
use crate::limiter::{LimiterStats, RateLimiter};
use crate::metrics::{MetricsSink, TracingSink};
use crate::orchestrator::JobRunner;
use crate::pool::WorkerPool;
use crate::queue::JobQueue;
use crate::registry::{JobFilter, JobRegistry, RegistryStats};
use crate::retry::RetryPolicy;
use crate::state_machine::{FieldSpec, JobError, JobId, JobOptions, JobRecord, JobState, Outcome};

/// Operator snapshot of the whole hub.
#[derive(Debug, Clone)]
pub struct HubStats {
    pub jobs: RegistryStats,
    pub retrieval: LimiterStats,
    pub extraction: LimiterStats,
    pub workers: usize,
    pub busy_workers: usize,
    pub queued: usize,
    pub paused: bool,
}

pub struct CollectHub {
    config: HubConfig,
    registry: Arc<JobRegistry>,
    queue: Arc<JobQueue>,
    aggregator: Arc<ResultAggregator>,
    retrieval: RateLimiter,
    extraction: RateLimiter,
    pool: Arc<WorkerPool>,
    control: ControlPlane,
    shutdown: CancellationToken,
}

impl CollectHub {
    /// Builds the hub and starts `config.workers` workers. Stage metrics go
    /// to `tracing`. Must be called inside a tokio runtime.
    pub fn new(config: HubConfig, collector: Arc<dyn Collector>) -> Result<Self> {
        Self::with_metrics(config, collector, Arc::new(TracingSink))
    }

    pub fn with_metrics(
        config: HubConfig,
        collector: Arc<dyn Collector>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(JobRegistry::new());
        let queue = Arc::new(JobQueue::new());
        let aggregator = Arc::new(ResultAggregator::new());
        let retrieval = RateLimiter::new("retrieval", config.retrieval_capacity);
        let extraction = RateLimiter::new("extraction", config.extraction_capacity);
        let shutdown = CancellationToken::new();

        let runner = Arc::new(JobRunner::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&aggregator),
            retrieval.clone(),
            extraction.clone(),
            collector,
            metrics,
            RetryPolicy::new(config.backoff.clone()),
            shutdown.clone(),
        ));
        let pool = Arc::new(WorkerPool::new(runner, Arc::clone(&queue)));
        pool.resize(config.workers);

        let control = ControlPlane::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&aggregator),
            Arc::clone(&pool),
            retrieval.clone(),
            extraction.clone(),
        );

        tracing::info!(
            workers = config.workers,
            retrieval_capacity = config.retrieval_capacity,
            extraction_capacity = config.extraction_capacity,
            "Hub started"
        );

        Ok(Self {
            config,
            registry,
            queue,
            aggregator,
            retrieval,
            extraction,
            pool,
            control,
            shutdown,
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Validates and queues a job.
    pub fn submit_job(
        &self,
        query: impl Into<String>,
        schema: Vec<FieldSpec>,
        options: JobOptions,
    ) -> Result<JobId> {
        if self.shutdown.is_cancelled() {
            return Err(HubError::Shutdown);
        }
        let job_id = self.registry.submit(query, schema, options)?;
        self.aggregator.track(job_id, Utc::now());

        if !self.queue.enqueue(job_id) {
            // Lost the race with shutdown.
            self.control.cancel_pending(job_id, JobError::Shutdown)?;
            return Err(HubError::Shutdown);
        }
        Ok(job_id)
    }

    /// [`submit_job`](Self::submit_job) with the configured default options.
    pub fn submit(&self, query: impl Into<String>, schema: Vec<FieldSpec>) -> Result<JobId> {
        self.submit_job(query, schema, self.config.defaults.clone())
    }

    /// Waits for the job to finish and returns its outcome.
    pub async fn get_result(&self, job_id: JobId) -> Result<Outcome> {
        self.aggregator.get_result(job_id).await
    }

    /// Waits for every unfinished job and returns the outcomes in completion
    /// order.
    pub async fn run_all(&self) -> Vec<Outcome> {
        self.aggregator.run_all().await
    }

    /// Outcome stream, closing as configured by `stream_close`.
    pub fn stream_results(&self) -> UnboundedReceiverStream<Outcome> {
        self.aggregator.stream_results(self.config.stream_close)
    }

    pub fn stream_results_with(&self, close: StreamClose) -> UnboundedReceiverStream<Outcome> {
        self.aggregator.stream_results(close)
    }

    pub fn job(&self, job_id: JobId) -> Result<JobRecord> {
        self.registry.get(job_id)
    }

    pub fn get_state(&self, job_id: JobId) -> Result<JobState> {
        self.registry.get_state(job_id)
    }

    pub fn list_jobs(&self, filter: JobFilter) -> impl Iterator<Item = JobRecord> + use<> {
        self.registry.list_jobs(filter)
    }

    /// Drops a finished job's record together with its stored outcome.
    /// Unfinished jobs are refused with [`HubError::StateConflict`].
    pub fn archive(&self, job_id: JobId) -> Result<JobRecord> {
        let record = self.registry.archive(job_id)?;
        self.aggregator.forget(job_id);
        Ok(record)
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn cancel(&self, job_id: JobId) -> Result<CancelOutcome> {
        self.control.cancel(job_id)
    }

    pub fn cancel_all(&self) -> usize {
        self.control.cancel_all()
    }

    pub async fn resize_pool(&self, n: usize) {
        self.control.resize_pool(n).await;
    }

    pub async fn resize_limiter(&self, name: &str, capacity: usize) -> Result<()> {
        self.control.resize_limiter(name, capacity).await
    }

    pub fn limiter_stats(&self, kind: LimiterKind) -> LimiterStats {
        self.control.limiter(kind).stats()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            jobs: self.registry.stats(),
            retrieval: self.retrieval.stats(),
            extraction: self.extraction.stats(),
            workers: self.pool.size(),
            busy_workers: self.pool.busy(),
            queued: self.queue.len(),
            paused: self.queue.is_paused(),
        }
    }

    /// Tears the hub down. Queued jobs are cancelled with
    /// [`JobError::Shutdown`], running jobs stop at their next checkpoint,
    /// limiter waiters are released, and every worker is joined. Open
    /// streams and blocked readers end afterwards. Calling it twice is a
    /// no-op.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        tracing::info!("Hub shutting down");
        self.shutdown.cancel();

        self.queue.close();
        for job_id in self.queue.cancel_all() {
            if let Err(err) = self.control.cancel_pending(job_id, JobError::Shutdown) {
                tracing::debug!(job_id = %job_id, "Queued job not cancelled: {err}");
            }
        }
        self.retrieval.shutdown();
        self.extraction.shutdown();
        self.pool.shutdown().await;

        // Jobs that were pending but not queued (e.g. mid-requeue).
        for record in self.registry.list_jobs(JobFilter::State(JobState::Pending)) {
            if let Err(err) = self.control.cancel_pending(record.id, JobError::Shutdown) {
                tracing::debug!(job_id = %record.id, "Pending job not cancelled: {err}");
            }
        }

        self.aggregator.close();
        let stats = self.registry.stats();
        tracing::info!(
            completed = stats.completed,
            failed = stats.failed,
            cancelled = stats.cancelled,
            "Hub stopped"
        );
    }
}
