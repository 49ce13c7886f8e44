//! # Core Engine Module
//!
//! This module forms the heart of the telemetry synchronization engine: one
//! long-lived connection to the acquisition endpoint, one classification
//! point for everything that arrives on it, and one bounded view of recent
//! history.
//!
//! ## Core Components:
//!
//! - **`connection`**: The connection state machine. Owns the WebSocket
//!   transport, reconnects with a fixed delay after failures, and is the
//!   only component allowed to touch the socket.
//!
//! - **`correlator`**: Matches command responses to in-flight requests via
//!   `messageId`, with per-request deadlines and exactly-once settlement.
//!
//! - **`dispatcher`**: Classifies every inbound frame as a correlated
//!   response, an error notice, or live telemetry, and routes it.
//!
//! - **`reconciler`**: Merges live samples with persisted history batches
//!   into one deduplicated, capped, newest-first window.
//!
//! - **`model`** / **`error`**: The JSON wire shapes shared with the
//!   endpoint and the error taxonomy surfaced to callers.

#![doc(html_logo_url = "https://example.com/logo.png")] // Placeholder
#![forbid(unsafe_code)]

/// The connection state machine owning the transport lifecycle.
pub mod connection;
/// Request/response matching with deadlines and exactly-once settlement.
pub mod correlator;
/// Inbound frame classification and fan-out.
pub mod dispatcher;
/// The error taxonomy of the engine.
pub mod error;
/// Wire message shapes and telemetry types.
pub mod model;
/// Live/persisted history merging into one bounded window.
pub mod reconciler;

// --- Public API Re-exports ---
// Make the primary types from the core modules directly accessible.
pub use connection::{ConnectionState, PlcConnection};
pub use correlator::{RequestCorrelator, RequestResult};
pub use dispatcher::TelemetryDispatcher;
pub use error::PlcError;
pub use model::{
    CommandAction, InboundFrame, Notice, OutboundCommand, PlcConfig, Provenance, RequestKind,
    SampleValue, TelemetrySample,
};
pub use reconciler::{HistoryReconciler, DEFAULT_HISTORY_CAP};
