//! Store of job outcomes with blocking and streaming readers.
//!
//! Every submitted job is tracked from submission. Once the worker (or the
//! control plane) wins the CAS into a terminal state it records the job's
//! [`Outcome`] here exactly once; later writes for the same job are rejected.
//! Outcomes are kept until the consumer releases them with
//! [`ResultAggregator::forget`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::config::StreamClose;
use crate::error::{HubError, Result};
use crate::state_machine::{JobError, JobId, JobState, Outcome};

struct Subscriber {
    tx: mpsc::UnboundedSender<Outcome>,
    close_when_idle: bool,
}

#[derive(Default)]
struct AggState {
    /// Tracked jobs without an outcome yet, with their submission time.
    pending: HashMap<JobId, DateTime<Utc>>,
    /// Recorded outcomes keyed by completion sequence.
    log: BTreeMap<u64, Outcome>,
    /// Completion sequence of each recorded job.
    index: HashMap<JobId, u64>,
    next_seq: u64,
    subscribers: Vec<Subscriber>,
    closed: bool,
}

impl AggState {
    fn get(&self, job_id: JobId) -> Option<&Outcome> {
        self.index.get(&job_id).and_then(|seq| self.log.get(seq))
    }
}

#[derive(Default)]
pub struct ResultAggregator {
    state: Mutex<AggState>,
    notify: Notify,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, AggState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts tracking a freshly submitted job.
    pub fn track(&self, job_id: JobId, submitted_at: DateTime<Utc>) {
        let mut st = self.state();
        if !st.index.contains_key(&job_id) {
            st.pending.insert(job_id, submitted_at);
        }
    }

    /// Records a terminal outcome. A second outcome for the same job is
    /// rejected with [`HubError::StateConflict`].
    pub fn record(&self, outcome: Outcome) -> Result<()> {
        let job_id = outcome.job_id;
        {
            let mut st = self.state();
            if let Some(existing) = st.get(job_id) {
                let err = HubError::StateConflict {
                    job_id,
                    expected: JobState::Running,
                    actual: existing.status,
                };
                tracing::error!(job_id = %job_id, "Duplicate outcome rejected: {err}");
                return Err(err);
            }

            st.pending.remove(&job_id);
            st.subscribers
                .retain(|sub| sub.tx.send(outcome.clone()).is_ok());
            if st.pending.is_empty() {
                st.subscribers.retain(|sub| !sub.close_when_idle);
            }
            let seq = st.next_seq;
            st.next_seq += 1;
            st.index.insert(job_id, seq);
            st.log.insert(seq, outcome);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    pub fn record_success(
        &self,
        job_id: JobId,
        output: Value,
        cost_usd: f64,
        attempts: u32,
    ) -> Result<()> {
        let outcome = self.outcome_now(job_id, JobState::Completed, Ok(output), cost_usd, attempts);
        self.record(outcome)
    }

    pub fn record_failure(
        &self,
        job_id: JobId,
        error: JobError,
        cost_usd: f64,
        attempts: u32,
    ) -> Result<()> {
        let status = match error {
            JobError::Cancelled | JobError::Shutdown => JobState::Cancelled,
            _ => JobState::Failed,
        };
        let outcome = self.outcome_now(job_id, status, Err(error), cost_usd, attempts);
        self.record(outcome)
    }

    fn outcome_now(
        &self,
        job_id: JobId,
        status: JobState,
        result: std::result::Result<Value, JobError>,
        cost_usd: f64,
        attempts: u32,
    ) -> Outcome {
        let finished_at = Utc::now();
        let latency_ms = self
            .state()
            .pending
            .get(&job_id)
            .map(|submitted| (finished_at - *submitted).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        Outcome {
            job_id,
            status,
            result,
            cost_usd,
            latency_ms,
            attempts,
            finished_at,
        }
    }

    /// Outcome of `job_id` if it is already terminal.
    pub fn try_result(&self, job_id: JobId) -> Option<Outcome> {
        self.state().get(job_id).cloned()
    }

    /// Releases the stored outcome of a finished job. Later reads treat the
    /// job as unknown and new streams no longer replay it.
    pub fn forget(&self, job_id: JobId) -> Option<Outcome> {
        let mut st = self.state();
        let seq = st.index.remove(&job_id)?;
        st.log.remove(&seq)
    }

    /// Waits until `job_id` is terminal and returns its outcome.
    pub async fn get_result(&self, job_id: JobId) -> Result<Outcome> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let st = self.state();
                if let Some(outcome) = st.get(job_id) {
                    return Ok(outcome.clone());
                }
                if !st.pending.contains_key(&job_id) {
                    return Err(HubError::NotFound(job_id));
                }
                if st.closed {
                    return Err(HubError::Shutdown);
                }
            }

            notified.await;
        }
    }

    /// Stream of outcomes: every outcome recorded so far, then each new one
    /// as it is recorded.
    ///
    /// With [`StreamClose::WhenIdle`] the stream ends once no tracked job is
    /// pending. With [`StreamClose::KeepOpen`] it ends at [`close`](Self::close).
    pub fn stream_results(&self, close: StreamClose) -> UnboundedReceiverStream<Outcome> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut st = self.state();
        for outcome in st.log.values() {
            let _ = tx.send(outcome.clone());
        }

        let close_when_idle = close == StreamClose::WhenIdle;
        let idle = close_when_idle && st.pending.is_empty();
        if !st.closed && !idle {
            st.subscribers.push(Subscriber {
                tx,
                close_when_idle,
            });
        }
        UnboundedReceiverStream::new(rx)
    }

    /// Waits for every job pending at call time and returns their outcomes
    /// in completion order. Jobs submitted later are not awaited.
    ///
    /// Returns early with whatever was collected if the aggregator closes.
    pub async fn run_all(&self) -> Vec<Outcome> {
        let (mut waiting, mut rx): (HashSet<JobId>, _) = {
            let mut st = self.state();
            let waiting: HashSet<JobId> = st.pending.keys().copied().collect();
            if waiting.is_empty() || st.closed {
                return Vec::new();
            }
            let (tx, rx) = mpsc::unbounded_channel();
            st.subscribers.push(Subscriber {
                tx,
                close_when_idle: false,
            });
            (waiting, rx)
        };

        let mut collected = Vec::with_capacity(waiting.len());
        while !waiting.is_empty() {
            let Some(outcome) = rx.recv().await else {
                break;
            };
            if waiting.remove(&outcome.job_id) {
                collected.push(outcome);
            }
        }
        collected
    }

    /// Ends every open stream and wakes every blocked reader.
    pub fn close(&self) {
        {
            let mut st = self.state();
            st.closed = true;
            st.subscribers.clear();
        }
        self.notify.notify_waiters();
    }

    /// Tracked jobs still without an outcome.
    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Every recorded outcome, in completion order.
    pub fn outcomes(&self) -> Vec<Outcome> {
        self.state().log.values().cloned().collect()
    }
}
