// Declare the modules to re-export
#[cfg(feature = "core")]
pub mod core;

#[cfg(feature = "connections")]
pub mod connections;

// Re-export the engine's primary types
#[cfg(feature = "core")]
pub use crate::core::{
    ConnectionState, HistoryReconciler, Notice, PlcConfig, PlcConnection, PlcError, Provenance,
    RequestCorrelator, RequestKind, SampleValue, TelemetryDispatcher, TelemetrySample,
    DEFAULT_HISTORY_CAP,
};

#[cfg(feature = "connections")]
pub use crate::connections::{MemorySampleStore, RedisSampleStore, SampleStore, StoreError};
