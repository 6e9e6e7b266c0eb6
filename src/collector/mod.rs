//! The external three-stage collection capability.
//!
//! The hub never discovers, fetches or extracts anything itself. It drives a
//! [`Collector`] supplied at construction through its stages, holding the
//! matching rate-limiter lease around each call.

pub mod error;
pub mod types;

pub use error::CollectorError;
pub use types::{CollectRequest, Discovery, Document, Extraction, Retrieval};

use async_trait::async_trait;

/// Discovery → retrieval → extraction pipeline invoked once per job attempt.
///
/// Implementations must be cheap to share: a single instance is called
/// concurrently by every worker.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Finds candidate sources for the query.
    async fn discover(&self, req: &CollectRequest) -> Result<Discovery, CollectorError>;

    /// Fetches raw content for the discovered targets.
    async fn retrieve(
        &self,
        req: &CollectRequest,
        discovery: &Discovery,
    ) -> Result<Retrieval, CollectorError>;

    /// Extracts the schema fields from the retrieved content.
    async fn extract(
        &self,
        req: &CollectRequest,
        retrieval: &Retrieval,
    ) -> Result<Extraction, CollectorError>;
}
