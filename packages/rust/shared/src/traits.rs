//! Capabilities the orchestrator consumes.
//!
//! Every external collaborator sits behind one of these traits so the core can
//! run against HTTP/libSQL backends in production and in-memory doubles in tests.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    FetchOptions, FieldSchema, Item, JobState, JobSummary, Pattern, PatternId, RawPage, Record,
};

/// Retrieves documents.
///
/// Implementations classify failures as
/// [`AdaptError::TransientFetch`](crate::AdaptError::TransientFetch) or
/// [`AdaptError::PermanentFetch`](crate::AdaptError::PermanentFetch); the
/// executor only retries the former.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<RawPage>;
}

/// Output of a semantic extraction call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SemanticOutput {
    /// One entry per item found; a single-record page yields one item.
    pub items: Vec<Item>,
    /// The backend's own estimate. Logged, never used for acceptance.
    pub self_reported_confidence: f64,
}

/// Opaque text + schema → structured guess.
#[async_trait]
pub trait SemanticExtractor: Send + Sync {
    async fn extract(&self, text: &str, schema: &FieldSchema) -> Result<SemanticOutput>;
}

/// Vector similarity over pattern fingerprints.
#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    async fn embed(&self, fingerprint_text: &str) -> Result<Vec<f32>>;

    /// Insert or replace the vector stored for `id`.
    async fn index(&self, id: PatternId, vector: Vec<f32>) -> Result<()>;

    /// Up to `k` ids, most similar first, with their similarity scores.
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<(PatternId, f32)>>;
}

/// Persistent, deduplicating record store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn exists(&self, content_hash: &str) -> Result<bool>;

    /// Insert records whose hash is not yet stored. Returns how many were new.
    async fn batch_upsert(&self, records: &[Record]) -> Result<usize>;
}

/// Durable storage for learned patterns.
#[async_trait]
pub trait PatternRepository: Send + Sync {
    async fn save_pattern(&self, pattern: &Pattern) -> Result<()>;
    async fn load_patterns(&self) -> Result<Vec<Pattern>>;
}

/// Receives terminal job states.
#[async_trait]
pub trait JobArchive: Send + Sync {
    async fn archive_job(&self, state: &JobState) -> Result<()>;
}

/// Best-effort delivery of job summaries.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, summary: &JobSummary) -> Result<()>;
}
