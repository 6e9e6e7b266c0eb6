//! Payloads passed between collector stages.
//!
//! Every stage reports the cost it incurred so the hub can accrue it on the
//! job record and enforce the job's cost threshold.

use serde::{Deserialize, Serialize};

use crate::state_machine::{FieldSpec, JobId};

/// Input shared by all three stages of one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectRequest {
    pub job_id: JobId,
    pub query: String,
    pub schema: Vec<FieldSpec>,
    /// Maximum number of discovery targets the hub will carry forward.
    pub top_k: usize,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Output of the discovery stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Discovery {
    /// Candidate sources, best first.
    pub targets: Vec<String>,
    #[serde(default)]
    pub cost_usd: f64,
}

/// Raw content fetched for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub source: String,
    pub content: String,
}

/// Output of the retrieval stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Retrieval {
    pub documents: Vec<Document>,
    #[serde(default)]
    pub cost_usd: f64,
}

/// Output of the extraction stage: one JSON object keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub output: serde_json::Value,
    #[serde(default)]
    pub cost_usd: f64,
}
