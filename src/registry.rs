//! Authoritative job records and state-machine transitions.
//!
//! Every state change goes through [`JobRegistry::transition_with`], an atomic
//! compare-and-set on the job's current state. Whoever wins the CAS into a
//! terminal state is the single writer of that job's terminal fields.
//!
//! Records live in a sharded map so that snapshots taken by
//! [`JobRegistry::list_jobs`] never block workers for longer than one shard
//! read.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::error::{HubError, Result};
use crate::state_machine::{FieldSpec, JobId, JobOptions, JobRecord, JobState};

/// Selects which records [`JobRegistry::list_jobs`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobFilter {
    #[default]
    All,
    State(JobState),
    /// Pending or running.
    Active,
    Terminal,
}

impl JobFilter {
    pub fn matches(&self, state: JobState) -> bool {
        match self {
            JobFilter::All => true,
            JobFilter::State(s) => *s == state,
            JobFilter::Active => !state.is_terminal(),
            JobFilter::Terminal => state.is_terminal(),
        }
    }
}

/// Job counts by state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Lifetime submissions, including archived jobs.
    pub total_submitted: u64,
}

/// A field validator, compiled once at submission.
#[derive(Debug, Clone)]
pub struct FieldValidator {
    pub field: String,
    pub pattern: Regex,
}

struct JobEntry {
    record: JobRecord,
    cancel: CancellationToken,
    validators: Arc<[FieldValidator]>,
}

pub struct JobRegistry {
    jobs: DashMap<JobId, JobEntry>,
    next_seq: AtomicU64,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Validates a submission and creates its `Pending` record.
    pub fn submit(
        &self,
        query: impl Into<String>,
        schema: Vec<FieldSpec>,
        options: JobOptions,
    ) -> Result<JobId> {
        let query = query.into();
        let validators = validate_submission(&query, &schema, &options)?;

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let record = JobRecord::new(seq, query, schema, options);
        let id = record.id;
        self.jobs.insert(
            id,
            JobEntry {
                record,
                cancel: CancellationToken::new(),
                validators: validators.into(),
            },
        );

        tracing::debug!(job_id = %id, seq, "Job submitted");
        Ok(id)
    }

    pub fn get(&self, id: JobId) -> Result<JobRecord> {
        self.jobs
            .get(&id)
            .map(|e| e.record.clone())
            .ok_or(HubError::NotFound(id))
    }

    pub fn get_state(&self, id: JobId) -> Result<JobState> {
        self.jobs
            .get(&id)
            .map(|e| e.record.state)
            .ok_or(HubError::NotFound(id))
    }

    pub fn transition(&self, id: JobId, from: JobState, to: JobState) -> Result<()> {
        self.transition_with(id, from, to, |_| {}).map(|_| ())
    }

    /// Atomically moves `id` from `from` to `to`, applying `update` to the
    /// record in the same critical section. Returns the updated record.
    ///
    /// Fails with [`HubError::StateConflict`] if the job is not currently in
    /// `from` or is already terminal, and with [`HubError::IllegalTransition`]
    /// if `from → to` is not an edge of the state machine.
    pub fn transition_with(
        &self,
        id: JobId,
        from: JobState,
        to: JobState,
        update: impl FnOnce(&mut JobRecord),
    ) -> Result<JobRecord> {
        let mut entry = self.jobs.get_mut(&id).ok_or(HubError::NotFound(id))?;
        let current = entry.record.state;
        if current != from || current.is_terminal() {
            return Err(HubError::StateConflict {
                job_id: id,
                expected: from,
                actual: current,
            });
        }
        if !from.can_transition_to(to) {
            return Err(HubError::IllegalTransition { from, to });
        }

        update(&mut entry.record);
        entry.record.set_state(to);

        tracing::debug!(job_id = %id, %from, %to, "Job transitioned");
        Ok(entry.record.clone())
    }

    /// Mutates non-state fields of a running job (current stage, accrued
    /// cost). Only the worker holding the job calls this.
    pub fn update_running(&self, id: JobId, update: impl FnOnce(&mut JobRecord)) -> Result<()> {
        let mut entry = self.jobs.get_mut(&id).ok_or(HubError::NotFound(id))?;
        if entry.record.state != JobState::Running {
            return Err(HubError::StateConflict {
                job_id: id,
                expected: JobState::Running,
                actual: entry.record.state,
            });
        }
        update(&mut entry.record);
        entry.record.updated_at = chrono::Utc::now();
        Ok(())
    }

    /// Flags the job for cancellation and fires its token. Returns the state
    /// the job was in; terminal jobs are left untouched.
    pub fn request_cancel(&self, id: JobId) -> Result<JobState> {
        let mut entry = self.jobs.get_mut(&id).ok_or(HubError::NotFound(id))?;
        let state = entry.record.state;
        if !state.is_terminal() {
            entry.record.cancel_requested = true;
            entry.cancel.cancel();
        }
        Ok(state)
    }

    pub fn is_cancel_requested(&self, id: JobId) -> bool {
        self.jobs
            .get(&id)
            .is_some_and(|e| e.record.cancel_requested)
    }

    /// Token fired when cancellation of `id` is requested.
    pub fn cancel_token(&self, id: JobId) -> Result<CancellationToken> {
        self.jobs
            .get(&id)
            .map(|e| e.cancel.clone())
            .ok_or(HubError::NotFound(id))
    }

    /// Compiled validators of `id`, in schema order.
    pub fn validators(&self, id: JobId) -> Result<Arc<[FieldValidator]>> {
        self.jobs
            .get(&id)
            .map(|e| Arc::clone(&e.validators))
            .ok_or(HubError::NotFound(id))
    }

    /// Snapshot of matching records in submission order.
    pub fn list_jobs(&self, filter: JobFilter) -> impl Iterator<Item = JobRecord> + use<> {
        let mut snapshot: Vec<JobRecord> = self
            .jobs
            .iter()
            .filter(|e| filter.matches(e.record.state))
            .map(|e| e.record.clone())
            .collect();
        snapshot.sort_by_key(|r| r.seq);
        snapshot.into_iter()
    }

    /// Ids of jobs that are not yet terminal.
    pub fn active_ids(&self) -> HashSet<JobId> {
        self.jobs
            .iter()
            .filter(|e| !e.record.state.is_terminal())
            .map(|e| *e.key())
            .collect()
    }

    /// Removes a terminal record from the registry.
    pub fn archive(&self, id: JobId) -> Result<JobRecord> {
        let removed = self
            .jobs
            .remove_if(&id, |_, e| e.record.state.is_terminal());
        match removed {
            Some((_, entry)) => {
                tracing::debug!(job_id = %id, "Job archived");
                Ok(entry.record)
            }
            None => {
                let actual = self.get_state(id)?;
                Err(HubError::StateConflict {
                    job_id: id,
                    expected: JobState::Completed,
                    actual,
                })
            }
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total_submitted: self.next_seq.load(Ordering::Relaxed),
            ..Default::default()
        };
        for entry in self.jobs.iter() {
            match entry.record.state {
                JobState::Pending => stats.pending += 1,
                JobState::Running => stats.running += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }
}

/// Rejects empty queries, empty or malformed schemas and nonsensical options.
/// Returns the schema's compiled validators.
pub fn validate_submission(
    query: &str,
    schema: &[FieldSpec],
    options: &JobOptions,
) -> Result<Vec<FieldValidator>> {
    if query.trim().is_empty() {
        return Err(HubError::Validation("query must not be empty".into()));
    }
    if schema.is_empty() {
        return Err(HubError::Validation("schema must contain at least one field".into()));
    }

    let mut seen = HashSet::new();
    let mut validators = Vec::new();
    for (i, field) in schema.iter().enumerate() {
        if field.name.trim().is_empty() {
            return Err(HubError::Validation(format!("field #{i} has an empty name")));
        }
        if field.description.trim().is_empty() {
            return Err(HubError::Validation(format!(
                "field {:?} has an empty description",
                field.name
            )));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(HubError::Validation(format!(
                "duplicate field name {:?}",
                field.name
            )));
        }
        if let Some(pattern) = &field.validator {
            let pattern = Regex::new(pattern).map_err(|e| {
                HubError::Validation(format!("field {:?} has an invalid validator: {e}", field.name))
            })?;
            validators.push(FieldValidator {
                field: field.name.clone(),
                pattern,
            });
        }
    }

    validate_options(options)?;
    Ok(validators)
}

/// Checks per-job options on their own. Also used for the configured
/// submission defaults.
pub fn validate_options(options: &JobOptions) -> Result<()> {
    if options.max_attempts == 0 {
        return Err(HubError::Validation("max_attempts must be at least 1".into()));
    }
    if options.top_k == 0 {
        return Err(HubError::Validation("top_k must be at least 1".into()));
    }
    if options.timeout_ms == 0 {
        return Err(HubError::Validation("timeout must be positive".into()));
    }
    if let Some(threshold) = options.cost_threshold
        && !(threshold.is_finite() && threshold >= 0.0)
    {
        return Err(HubError::Validation(format!(
            "cost_threshold must be a non-negative number, got {threshold}"
        )));
    }
    Ok(())
}
