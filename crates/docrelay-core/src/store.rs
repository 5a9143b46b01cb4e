//! Update log persistence seam
//!
//! The registry persists every applied delta through this trait and replays
//! the log to hydrate rooms on first access. Backends live in
//! `docrelay-storage`; the trait lives here so the registry owns the seam.

use crate::name::DocName;
use async_trait::async_trait;

/// Append-only persistent log of update deltas, keyed by document name.
///
/// Backends must support concurrent independent append/load per document
/// name without cross-contamination. Re-appending an already-durable delta
/// is harmless: application is idempotent, so replay only costs space until
/// the next compaction.
#[async_trait]
pub trait UpdateStore: Send + Sync {
    /// Every persisted delta for a document, in append order.
    ///
    /// An empty vec means the document has never been seen.
    async fn load(&self, doc: &DocName) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Durably record one update delta.
    async fn append(&self, doc: &DocName, update: &[u8]) -> Result<(), StoreError>;

    /// Fold a document's log into a single merged delta, in place.
    ///
    /// Returns the number of log entries removed. The merge input and the
    /// deletion must cover exactly the same rows, atomically per document:
    /// a delta whose `append` races the compaction either lands after it and
    /// survives, or lands before it and is part of the merge - it is never
    /// deleted without being represented.
    async fn compact(&self, doc: &DocName) -> Result<usize, StoreError>;

    /// Storage statistics across all documents.
    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupt log: {0}")]
    Corrupt(String),
}

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub document_count: usize,
    pub update_count: usize,
    pub total_size_bytes: usize,
}
