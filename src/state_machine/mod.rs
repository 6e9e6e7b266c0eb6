mod job;
mod state;

pub use job::{FieldSpec, JobError, JobId, JobOptions, JobRecord, Outcome, Stage};
pub use state::JobState;
