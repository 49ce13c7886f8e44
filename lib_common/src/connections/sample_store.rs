//! # Sample Store Interface
//!
//! The persisted sample store is an external collaborator: all this engine
//! requires is append and bounded newest-first range reads, with timestamp
//! sortability. Appends are at-least-once with idempotent overwrite
//! semantics: re-appending the same observation must not duplicate it.

use std::future::Future;
use std::sync::Mutex;

use thiserror::Error;

use crate::core::model::{Provenance, TelemetrySample};

/// Errors raised by sample-store drivers.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection error: {0}")]
    Connection(String),
    #[error("Store serialization error: {0}")]
    Serialization(String),
}

/// Durable storage for telemetry samples.
pub trait SampleStore: Send + Sync {
    /// Persists one sample. Idempotent for an identical re-append.
    fn append(
        &self,
        sample: &TelemetrySample,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Reads up to `limit` samples, newest first, marked `Persisted`.
    fn range_read(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<TelemetrySample>, StoreError>> + Send;

    /// Updates the endpoint status record (last upload time, record count).
    fn write_status(&self, record_count: u64)
    -> impl Future<Output = Result<(), StoreError>> + Send;
}

// Shared handles delegate, so one store can serve the bridge task and
// direct callers at the same time.
impl<S: SampleStore> SampleStore for std::sync::Arc<S> {
    async fn append(&self, sample: &TelemetrySample) -> Result<(), StoreError> {
        (**self).append(sample).await
    }

    async fn range_read(&self, limit: usize) -> Result<Vec<TelemetrySample>, StoreError> {
        (**self).range_read(limit).await
    }

    async fn write_status(&self, record_count: u64) -> Result<(), StoreError> {
        (**self).write_status(record_count).await
    }
}

/// In-memory store used by tests and by deployments without a cache tier.
pub struct MemorySampleStore {
    entries: Mutex<Vec<TelemetrySample>>,
    last_record_count: Mutex<Option<u64>>,
}

impl MemorySampleStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            last_record_count: Mutex::new(None),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_record_count(&self) -> Option<u64> {
        *self
            .last_record_count
            .lock()
            .expect("store lock poisoned")
    }
}

impl Default for MemorySampleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleStore for MemorySampleStore {
    async fn append(&self, sample: &TelemetrySample) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        // Overwrite semantics: same (timestamp, register) replaces.
        entries.retain(|s| s.key() != sample.key());
        entries.push(sample.clone());
        entries.sort_by(|a, b| b.key().cmp(&a.key()));
        Ok(())
    }

    async fn range_read(&self, limit: usize) -> Result<Vec<TelemetrySample>, StoreError> {
        let entries = self.entries.lock().expect("store lock poisoned");
        Ok(entries
            .iter()
            .take(limit)
            .cloned()
            .map(|mut s| {
                s.provenance = Provenance::Persisted;
                s
            })
            .collect())
    }

    async fn write_status(&self, record_count: u64) -> Result<(), StoreError> {
        *self
            .last_record_count
            .lock()
            .expect("store lock poisoned") = Some(record_count);
        Ok(())
    }
}
