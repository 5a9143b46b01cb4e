//! In-memory update log
//!
//! Keeps every document's log in a concurrent map. State is lost on process
//! exit; intended for tests and ephemeral deployments.

use async_trait::async_trait;
use dashmap::DashMap;
use docrelay_core::{DocName, StoreError, StoreStats, UpdateStore};

/// Volatile store backed by a `DashMap` of per-document logs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    logs: DashMap<String, Vec<Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UpdateStore for MemoryStore {
    async fn load(&self, doc: &DocName) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(self
            .logs
            .get(doc.as_str())
            .map(|log| log.clone())
            .unwrap_or_default())
    }

    async fn append(&self, doc: &DocName, update: &[u8]) -> Result<(), StoreError> {
        self.logs
            .entry(doc.as_str().to_string())
            .or_default()
            .push(update.to_vec());
        Ok(())
    }

    async fn compact(&self, doc: &DocName) -> Result<usize, StoreError> {
        // The entry guard is exclusive per key, so appends to this document
        // wait until the merged log is back in place.
        let mut log = self.logs.entry(doc.as_str().to_string()).or_default();
        if log.len() <= 1 {
            return Ok(0);
        }
        let merged = crate::merge_log(&log)?;
        let removed = log.len() - 1;
        log.clear();
        log.push(merged);
        Ok(removed)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut update_count = 0;
        let mut total_size_bytes = 0;
        for entry in self.logs.iter() {
            update_count += entry.value().len();
            total_size_bytes += entry.value().iter().map(|u| u.len()).sum::<usize>();
        }
        Ok(StoreStats {
            document_count: self.logs.len(),
            update_count,
            total_size_bytes,
        })
    }
}
