//! # Request Correlator
//!
//! Matches asynchronous command responses back to the requests that caused
//! them. Every issued command carries a `messageId` unique among the
//! currently outstanding requests; the correlator tracks them in one
//! mutex-guarded pending table and settles each request exactly once with
//! success, failure, `Timeout`, or `ConnectionLost`.
//!
//! Removal from the pending table is the settlement linearization point:
//! whichever path removes the entry (matching response, deadline task, or
//! `fail_all` on connection loss) performs the settlement, and every later
//! frame carrying the same identifier is discarded as stale.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::core::connection::PlcConnection;
use crate::core::error::PlcError;
use crate::core::model::{CommandAction, InboundFrame, OutboundCommand, RequestKind};

/// Settlement payload: the data words carried by a successful response
/// (empty for writes that echo nothing back).
pub type RequestResult = Result<Vec<f64>, PlcError>;

struct PendingRequest {
    kind: RequestKind,
    register: u16,
    issued_at: Instant,
    responder: oneshot::Sender<RequestResult>,
}

/// Tracks in-flight read/write requests against the acquisition endpoint.
pub struct RequestCorrelator {
    pending: Arc<Mutex<HashMap<String, PendingRequest>>>,
    next_id: AtomicU64,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Issues a command and waits for its settlement.
    ///
    /// Fails immediately with `NotConnected` when the connection is not
    /// open. Otherwise settles exactly once: with the response carried by a
    /// matching frame, with `Timeout` when the deadline elapses first, or
    /// with `ConnectionLost` when the connection drops first.
    pub async fn issue(
        &self,
        conn: &PlcConnection,
        kind: RequestKind,
        register: u16,
        value: Option<f64>,
        count: Option<u16>,
        timeout: Duration,
    ) -> RequestResult {
        if !conn.is_open() {
            return Err(PlcError::NotConnected);
        }

        let (id, rx) = self.register_pending(kind, register, timeout);

        let command = OutboundCommand {
            action: match kind {
                RequestKind::Read => CommandAction::ReadPlc,
                RequestKind::Write => CommandAction::WritePlc,
            },
            register: Some(register),
            value,
            count,
            message_id: Some(id.clone()),
            config: None,
        };

        if let Err(e) = conn.send(&command) {
            // Never reached the wire; retract the entry ourselves.
            self.pending
                .lock()
                .expect("pending table lock poisoned")
                .remove(&id);
            return Err(e);
        }

        // The sender is never dropped unsettled, but map a lost sender to
        // the nearest truthful outcome anyway.
        rx.await.unwrap_or(Err(PlcError::ConnectionLost))
    }

    /// Registers a pending entry and arms its deadline task. The returned
    /// receiver settles exactly once.
    pub(crate) fn register_pending(
        &self,
        kind: RequestKind,
        register: u16,
        timeout: Duration,
    ) -> (String, oneshot::Receiver<RequestResult>) {
        let id = (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        let (tx, rx) = oneshot::channel();

        self.pending
            .lock()
            .expect("pending table lock poisoned")
            .insert(
                id.clone(),
                PendingRequest {
                    kind,
                    register,
                    issued_at: Instant::now(),
                    responder: tx,
                },
            );

        let pending = Arc::clone(&self.pending);
        let deadline_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = pending
                .lock()
                .expect("pending table lock poisoned")
                .remove(&deadline_id);
            if let Some(entry) = expired {
                log::warn!(
                    "Request {} ({:?} register 0x{:04X}) timed out after {} ms",
                    deadline_id,
                    entry.kind,
                    entry.register,
                    timeout.as_millis()
                );
                let _ = entry.responder.send(Err(PlcError::Timeout));
            }
        });

        (id, rx)
    }

    /// Settles the request matching the frame's `messageId`, if any.
    /// Returns false for stale or unknown identifiers; such frames must be
    /// dropped by the caller without further effect.
    pub fn resolve(&self, frame: &InboundFrame) -> bool {
        let Some(id) = frame.message_id.as_deref() else {
            return false;
        };
        let entry = self
            .pending
            .lock()
            .expect("pending table lock poisoned")
            .remove(id);
        let Some(entry) = entry else {
            return false;
        };

        let outcome = if let Some(err) = &frame.error {
            Err(PlcError::RemoteError(err.clone()))
        } else if frame.success == Some(false) {
            Err(PlcError::RemoteError("request rejected by endpoint".to_string()))
        } else {
            Ok(frame.data.clone().unwrap_or_default())
        };

        log::debug!(
            "Request {} ({:?} register 0x{:04X}) settled {} in {} ms",
            id,
            entry.kind,
            entry.register,
            if outcome.is_ok() { "ok" } else { "err" },
            entry.issued_at.elapsed().as_millis()
        );
        let _ = entry.responder.send(outcome);
        true
    }

    /// Settles every outstanding request with the given error. Used when
    /// the connection leaves the open state.
    pub fn fail_all(&self, error: PlcError) {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock().expect("pending table lock poisoned");
            pending.drain().map(|(_, entry)| entry).collect()
        };
        if !drained.is_empty() {
            log::warn!("Failing {} outstanding request(s): {}", drained.len(), error);
        }
        for entry in drained {
            let _ = entry.responder.send(Err(error.clone()));
        }
    }

    /// Number of requests currently awaiting settlement.
    pub fn outstanding(&self) -> usize {
        self.pending
            .lock()
            .expect("pending table lock poisoned")
            .len()
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}
