use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle states of a collection job.
///
/// Each job flows through: PENDING → RUNNING → {COMPLETED, FAILED, CANCELLED},
/// with RUNNING → PENDING as the only loop-back (delayed retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "PENDING"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::Completed => write!(f, "COMPLETED"),
            JobState::Failed => write!(f, "FAILED"),
            JobState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl JobState {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether `self → next` is an edge of the job state machine.
    ///
    /// - `Pending` may start running or be cancelled.
    /// - `Running` may finish (any terminal state) or loop back to `Pending`
    ///   for a delayed retry.
    /// - Terminal states have no outgoing edges.
    pub fn can_transition_to(self, next: JobState) -> bool {
        match self {
            JobState::Pending => matches!(next, JobState::Running | JobState::Cancelled),
            JobState::Running => matches!(
                next,
                JobState::Pending | JobState::Completed | JobState::Failed | JobState::Cancelled
            ),
            JobState::Completed | JobState::Failed | JobState::Cancelled => false,
        }
    }
}
