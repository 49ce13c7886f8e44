//! # Connections Module
//!
//! Drivers for the external sample store collaborator.

/// The store interface plus the in-memory driver.
pub mod sample_store;

/// Redis-backed sample persistence.
pub mod store_redis;

pub use sample_store::{MemorySampleStore, SampleStore, StoreError};
pub use store_redis::RedisSampleStore;
