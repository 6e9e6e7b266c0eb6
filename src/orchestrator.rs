use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;

use crate::aggregator::ResultAggregator;
use crate::collector::{CollectRequest, Collector, CollectorError, Discovery, Extraction, Retrieval};
use crate::error::{HubError, LimiterError};
use crate::limiter::{Lease, RateLimiter};
use crate::metrics::{MetricsSink, StageEvent, StageStatus};
use crate::queue::JobQueue;
use crate::registry::{FieldValidator, JobRegistry};
use crate::retry::{ErrorClass, RetryDecision, RetryPolicy, classify};
use crate::state_machine::{JobError, JobId, JobRecord, JobState, Outcome, Stage};

/// Why one attempt stopped short of completion.
#[derive(Debug)]
enum AttemptError {
    /// Raw collector failure, classified by the retry policy.
    Collector(CollectorError),
    /// Local check failed (cost threshold, validator); never retried.
    Permanent(String),
    Cancelled,
    Shutdown,
}

trait StageCost {
    fn cost_usd(&self) -> f64;
}

impl StageCost for Discovery {
    fn cost_usd(&self) -> f64 {
        self.cost_usd
    }
}

impl StageCost for Retrieval {
    fn cost_usd(&self) -> f64 {
        self.cost_usd
    }
}

impl StageCost for Extraction {
    fn cost_usd(&self) -> f64 {
        self.cost_usd
    }
}

/// Per-attempt bookkeeping.
struct Attempt {
    job_id: JobId,
    number: u32,
    timeout: Duration,
    /// Bounds collector calls made under the lease currently held.
    deadline: Instant,
    token: CancellationToken,
    validators: Arc<[FieldValidator]>,
    cost_threshold: Option<f64>,
    /// Cost accrued by this job across all attempts so far.
    cost_usd: f64,
}

impl Attempt {
    /// Restarts the deadline once a lease is held, so limiter waits never
    /// eat into the collector's time budget.
    fn start_clock(&mut self) {
        self.deadline = Instant::now() + self.timeout;
    }
}

/// Drives one job attempt through discovery, retrieval and extraction.
///
/// Shared by every worker. Holds the hub-wide limiters and stores, so the
/// per-job state it needs lives in the registry.
pub struct JobRunner {
    registry: Arc<JobRegistry>,
    queue: Arc<JobQueue>,
    aggregator: Arc<ResultAggregator>,
    retrieval: RateLimiter,
    extraction: RateLimiter,
    collector: Arc<dyn Collector>,
    metrics: Arc<dyn MetricsSink>,
    retry: RetryPolicy,
    shutdown: CancellationToken,
}

impl JobRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<JobRegistry>,
        queue: Arc<JobQueue>,
        aggregator: Arc<ResultAggregator>,
        retrieval: RateLimiter,
        extraction: RateLimiter,
        collector: Arc<dyn Collector>,
        metrics: Arc<dyn MetricsSink>,
        retry: RetryPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            queue,
            aggregator,
            retrieval,
            extraction,
            collector,
            metrics,
            retry,
            shutdown,
        }
    }

    /// Runs one attempt of `job_id`. Returns the state the job was left in,
    /// or `None` if the job could not be claimed (already terminal or gone).
    pub async fn run_job(&self, job_id: JobId) -> Option<JobState> {
        let record = self.claim(job_id)?;
        let lookup = self
            .registry
            .cancel_token(job_id)
            .and_then(|token| Ok((token, self.registry.validators(job_id)?)));
        let (token, validators) = match lookup {
            Ok(found) => found,
            Err(err) => {
                tracing::error!(job_id = %job_id, "Claimed job vanished: {err}");
                return None;
            }
        };

        tracing::info!(
            job_id = %job_id,
            attempt = record.attempt_count,
            max_attempts = record.options.max_attempts,
            "Job started"
        );

        let mut attempt = Attempt {
            job_id,
            number: record.attempt_count,
            timeout: record.options.timeout(),
            deadline: Instant::now() + record.options.timeout(),
            token,
            validators,
            cost_threshold: record.options.cost_threshold,
            cost_usd: record.cost_usd,
        };
        let result = self.execute(&record, &mut attempt).await;
        Some(self.settle(&record, result))
    }

    /// `Pending → Running`, counting the attempt. A conflict is retried once;
    /// a job that turned terminal while queued is skipped.
    fn claim(&self, job_id: JobId) -> Option<JobRecord> {
        for _ in 0..2 {
            let claimed = self.registry.transition_with(
                job_id,
                JobState::Pending,
                JobState::Running,
                |r| r.attempt_count += 1,
            );
            match claimed {
                Ok(record) => return Some(record),
                Err(HubError::StateConflict { actual, .. }) if actual.is_terminal() => {
                    tracing::debug!(job_id = %job_id, state = %actual, "Skipping finished job");
                    return None;
                }
                Err(HubError::StateConflict { actual, .. }) => {
                    tracing::debug!(job_id = %job_id, state = %actual, "Claim conflicted, retrying");
                }
                Err(HubError::NotFound(_)) => {
                    tracing::debug!(job_id = %job_id, "Skipping archived job");
                    return None;
                }
                Err(err) => {
                    tracing::error!(job_id = %job_id, "Claim failed: {err}");
                    return None;
                }
            }
        }
        tracing::error!(job_id = %job_id, "Claim conflicted twice, dropping dispatch");
        None
    }

    async fn execute(&self, record: &JobRecord, attempt: &mut Attempt) -> Result<Value, AttemptError> {
        let req = CollectRequest {
            job_id: record.id,
            query: record.query.clone(),
            schema: record.schema.clone(),
            top_k: record.options.top_k,
            attempt: attempt.number,
        };

        // Discovery and retrieval share one retrieval lease.
        self.checkpoint(attempt)?;
        let lease = self.acquire(&self.retrieval, attempt, Stage::Discovery).await?;
        attempt.start_clock();
        let mut discovery = self
            .stage(attempt, Stage::Discovery, self.collector.discover(&req))
            .await?;
        let mut seen = HashSet::new();
        discovery.targets.retain(|target| seen.insert(target.clone()));
        discovery.targets.truncate(req.top_k);
        self.checkpoint(attempt)?;
        let retrieval = self
            .stage(attempt, Stage::Retrieval, self.collector.retrieve(&req, &discovery))
            .await?;
        self.release(&self.retrieval, lease, attempt.job_id);

        self.checkpoint(attempt)?;
        let lease = self.acquire(&self.extraction, attempt, Stage::Extraction).await?;
        attempt.start_clock();
        let extraction = self
            .stage(attempt, Stage::Extraction, self.collector.extract(&req, &retrieval))
            .await?;
        self.release(&self.extraction, lease, attempt.job_id);

        self.checkpoint(attempt)?;
        validate_output(&attempt.validators, &extraction.output).map_err(AttemptError::Permanent)?;
        Ok(extraction.output)
    }

    fn checkpoint(&self, attempt: &Attempt) -> Result<(), AttemptError> {
        if self.registry.is_cancel_requested(attempt.job_id) {
            return Err(AttemptError::Cancelled);
        }
        if self.shutdown.is_cancelled() {
            return Err(AttemptError::Shutdown);
        }
        Ok(())
    }

    /// Waits for one unit of `limiter`. The wait is abandoned as soon as the
    /// job is cancelled or the hub shuts down.
    async fn acquire(
        &self,
        limiter: &RateLimiter,
        attempt: &Attempt,
        stage: Stage,
    ) -> Result<Lease, AttemptError> {
        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = attempt.token.cancelled() => Err(AttemptError::Cancelled),
            _ = self.shutdown.cancelled() => Err(AttemptError::Shutdown),
            lease = limiter.acquire(1) => lease.map_err(|err| match err {
                LimiterError::Shutdown { .. } => AttemptError::Shutdown,
                other => AttemptError::Permanent(other.to_string()),
            }),
        };
        if outcome.is_err() {
            self.emit(attempt, stage, 0.0, started, StageStatus::Cancelled);
        }
        outcome
    }

    fn release(&self, limiter: &RateLimiter, lease: Lease, job_id: JobId) {
        if let Err(err) = limiter.release(lease) {
            tracing::error!(job_id = %job_id, limiter = limiter.name(), "Lease release failed: {err}");
        }
    }

    /// Runs one collector call under the lease deadline, accrues its cost
    /// and enforces the cost threshold.
    async fn stage<T, F>(&self, attempt: &mut Attempt, stage: Stage, call: F) -> Result<T, AttemptError>
    where
        T: StageCost,
        F: Future<Output = Result<T, CollectorError>>,
    {
        if let Err(err) = self.registry.update_running(attempt.job_id, |r| r.stage = Some(stage)) {
            tracing::warn!(job_id = %attempt.job_id, %stage, "Stage not recorded: {err}");
        }

        let started = Instant::now();
        let result = match timeout_at(attempt.deadline, call).await {
            Ok(result) => result,
            Err(_) => Err(CollectorError::Timeout),
        };

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                self.emit(attempt, stage, 0.0, started, StageStatus::Failed);
                tracing::debug!(job_id = %attempt.job_id, %stage, "Stage failed: {err}");
                return Err(AttemptError::Collector(err));
            }
        };

        let cost = output.cost_usd();
        attempt.cost_usd += cost;
        let total = attempt.cost_usd;
        if let Err(err) = self.registry.update_running(attempt.job_id, |r| r.cost_usd = total) {
            tracing::warn!(job_id = %attempt.job_id, %stage, "Cost not recorded: {err}");
        }
        self.emit(attempt, stage, cost, started, StageStatus::Succeeded);

        if let Some(limit) = attempt.cost_threshold
            && total > limit
        {
            return Err(AttemptError::Permanent(format!(
                "cost threshold exceeded: {total:.4} > {limit:.4} USD"
            )));
        }
        Ok(output)
    }

    fn emit(&self, attempt: &Attempt, stage: Stage, cost_usd: f64, started: Instant, status: StageStatus) {
        self.metrics.record(&StageEvent {
            timestamp: chrono::Utc::now(),
            job_id: attempt.job_id,
            stage,
            attempt: attempt.number,
            cost_usd,
            duration_ms: started.elapsed().as_millis() as u64,
            status,
        });
    }

    /// Applies the attempt result to the job: terminal transition, or a
    /// delayed requeue for retryable failures.
    fn settle(&self, record: &JobRecord, result: Result<Value, AttemptError>) -> JobState {
        let job_id = record.id;
        let err = match result {
            Ok(output) => return self.finish(job_id, JobState::Completed, Ok(output)),
            Err(AttemptError::Cancelled) => {
                return self.finish(job_id, JobState::Cancelled, Err(JobError::Cancelled));
            }
            Err(AttemptError::Shutdown) => {
                return self.finish(job_id, JobState::Cancelled, Err(JobError::Shutdown));
            }
            Err(AttemptError::Permanent(msg)) => {
                return self.finish(job_id, JobState::Failed, Err(JobError::Permanent(msg)));
            }
            Err(AttemptError::Collector(err)) => err,
        };

        let attempt = record.attempt_count;
        let max = record.options.max_attempts;
        let delay = match self.retry.decide(attempt, max, &err) {
            RetryDecision::RetryAfter(delay) => delay,
            RetryDecision::NoRetry => {
                let error = match classify(&err).class() {
                    ErrorClass::Transient => JobError::Transient(err.to_string()),
                    ErrorClass::Permanent => JobError::Permanent(err.to_string()),
                };
                return self.finish(job_id, JobState::Failed, Err(error));
            }
        };

        // Last checkpoint before the job goes back to the queue.
        if self.registry.is_cancel_requested(job_id) {
            return self.finish(job_id, JobState::Cancelled, Err(JobError::Cancelled));
        }
        if self.shutdown.is_cancelled() {
            return self.finish(job_id, JobState::Cancelled, Err(JobError::Shutdown));
        }

        if let Err(e) = self.registry.transition(job_id, JobState::Running, JobState::Pending) {
            tracing::error!(job_id = %job_id, "Retry requeue failed: {e}");
            return self
                .registry
                .get_state(job_id)
                .unwrap_or(JobState::Running);
        }
        log_retry(job_id, attempt, max, &err, delay.as_millis() as u64);

        if !self.queue.enqueue_delayed(job_id, Instant::now() + delay) {
            // Queue closed by shutdown after the job left Running.
            return self.abandon_pending(job_id);
        }
        JobState::Pending
    }

    /// `Running → to`, then records the outcome. A conflict here means the
    /// state machine was bypassed and is logged as a bug.
    fn finish(&self, job_id: JobId, to: JobState, result: Result<Value, JobError>) -> JobState {
        let finished = self
            .registry
            .transition_with(job_id, JobState::Running, to, |r| match result {
                Ok(output) => {
                    r.output = Some(output);
                    r.error = None;
                }
                Err(error) => r.error = Some(error),
            });

        match finished {
            Ok(record) => {
                match &record.error {
                    None => tracing::info!(
                        job_id = %job_id,
                        attempts = record.attempt_count,
                        cost_usd = record.cost_usd,
                        "Job completed"
                    ),
                    Some(error) => tracing::warn!(
                        job_id = %job_id,
                        state = %to,
                        attempts = record.attempt_count,
                        "Job finished: {error}"
                    ),
                }
                if let Err(err) = self.aggregator.record(Outcome::from_record(&record)) {
                    tracing::error!(job_id = %job_id, "Outcome not recorded: {err}");
                }
                to
            }
            Err(err) => {
                tracing::error!(job_id = %job_id, state = %to, "Terminal transition failed: {err}");
                self.registry.get_state(job_id).unwrap_or(to)
            }
        }
    }

    fn abandon_pending(&self, job_id: JobId) -> JobState {
        let cancelled = self
            .registry
            .transition_with(job_id, JobState::Pending, JobState::Cancelled, |r| {
                r.error = Some(JobError::Shutdown)
            });
        match cancelled {
            Ok(record) => {
                if let Err(err) = self.aggregator.record(Outcome::from_record(&record)) {
                    tracing::error!(job_id = %job_id, "Outcome not recorded: {err}");
                }
                JobState::Cancelled
            }
            Err(err) => {
                tracing::debug!(job_id = %job_id, "Requeue abandoned: {err}");
                self.registry
                    .get_state(job_id)
                    .unwrap_or(JobState::Cancelled)
            }
        }
    }
}

/// Checks every present field that carries a validator. Missing and null
/// fields are not checked.
fn validate_output(validators: &[FieldValidator], output: &Value) -> Result<(), String> {
    if validators.is_empty() {
        return Ok(());
    }
    let Some(fields) = output.as_object() else {
        return Err("extraction output is not an object".into());
    };

    for v in validators {
        let text = match fields.get(&v.field) {
            None | Some(Value::Null) => continue,
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        if !v.pattern.is_match(&text) {
            return Err(format!(
                "field {:?} value {text:?} does not match validator {:?}",
                v.field,
                v.pattern.as_str()
            ));
        }
    }
    Ok(())
}

fn log_retry(job_id: JobId, attempt: u32, max: u32, err: &CollectorError, delay_ms: u64) {
    tracing::warn!(
        job_id = %job_id,
        attempt,
        max_attempts = max,
        delay_ms,
        "Retrying after transient error: {err}"
    );
}
