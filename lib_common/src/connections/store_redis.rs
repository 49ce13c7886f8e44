//! # Redis Sample Store
//!
//! Redis-backed driver for the [`SampleStore`] interface. History lives in
//! a sorted set scored by millisecond timestamp, so range reads come back
//! already timestamp-ordered; the current value and the endpoint status
//! record are plain keys, mirroring the original cloud layout
//! (`plc/history`, `plc/currentData`, `status`).

use redis::AsyncCommands;

use crate::connections::sample_store::{SampleStore, StoreError};
use crate::core::model::{Provenance, TelemetrySample};

/// A handler for Redis-backed sample persistence.
pub struct RedisSampleStore {
    manager: redis::aio::ConnectionManager,
    key_prefix: String,
}

impl RedisSampleStore {
    /// Connects to the Redis instance behind `url` (e.g.
    /// "redis://127.0.0.1/"). Keys are namespaced under `key_prefix`.
    pub async fn new(url: &str, key_prefix: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self {
            manager,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn history_key(&self) -> String {
        format!("{}:history", self.key_prefix)
    }

    fn current_key(&self) -> String {
        format!("{}:current", self.key_prefix)
    }

    fn status_key(&self) -> String {
        format!("{}:status", self.key_prefix)
    }
}

impl SampleStore for RedisSampleStore {
    async fn append(&self, sample: &TelemetrySample) -> Result<(), StoreError> {
        let member =
            serde_json::to_string(sample).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let score = sample.timestamp.timestamp_millis();

        let mut conn = self.manager.clone();
        // Same member re-added just refreshes its score: idempotent.
        let _: () = conn
            .zadd(self.history_key(), &member, score)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let _: () = conn
            .set(self.current_key(), &member)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn range_read(&self, limit: usize) -> Result<Vec<TelemetrySample>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.manager.clone();
        let members: Vec<String> = conn
            .zrevrange(self.history_key(), 0, limit as isize - 1)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let mut samples = Vec::with_capacity(members.len());
        for member in members {
            match serde_json::from_str::<TelemetrySample>(&member) {
                Ok(mut sample) => {
                    sample.provenance = Provenance::Persisted;
                    samples.push(sample);
                }
                // One unreadable entry must not poison the whole batch.
                Err(e) => log::warn!("Skipping unreadable history entry: {}", e),
            }
        }
        Ok(samples)
    }

    async fn write_status(&self, record_count: u64) -> Result<(), StoreError> {
        let status = serde_json::json!({
            "lastUpload": chrono::Utc::now().to_rfc3339(),
            "recordCount": record_count,
        });
        let mut conn = self.manager.clone();
        let _: () = conn
            .set(self.status_key(), status.to_string())
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(())
    }
}
