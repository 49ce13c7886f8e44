//! Error taxonomy for the telemetry engine.

use thiserror::Error;

/// Errors surfaced by the connection and request layers.
///
/// `DecodeError` and unsolicited `RemoteError` frames are recovered locally
/// by the dispatcher; the rest are returned to the caller of the specific
/// request that failed. Nothing here is fatal to the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlcError {
    #[error("Not connected to the acquisition endpoint")]
    NotConnected,

    #[error("Request timed out waiting for a response")]
    Timeout,

    #[error("Connection lost before the request settled")]
    ConnectionLost,

    #[error("Endpoint reported an error: {0}")]
    RemoteError(String),

    #[error("Malformed inbound frame: {0}")]
    DecodeError(String),
}
