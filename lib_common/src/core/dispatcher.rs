//! # Telemetry Dispatcher
//!
//! The single classification point for every inbound frame. Frames carrying
//! a `messageId` belong to the Request Correlator; correlation takes
//! precedence over any data payload, so a command response is never
//! double-counted as telemetry. Frames with an `error` field become
//! non-fatal notices. Everything else with a data payload becomes a live
//! [`TelemetrySample`] recorded in the History Reconciler and broadcast to
//! data observers.
//!
//! One dispatch loop consumes the connection's frame channel, so no two
//! frames are ever classified concurrently and pending-table settlement
//! never races classification.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{broadcast, mpsc};

use crate::core::correlator::RequestCorrelator;
use crate::core::model::{InboundFrame, Notice, SampleValue, TelemetrySample};
use crate::core::reconciler::HistoryReconciler;

pub struct TelemetryDispatcher {
    correlator: Arc<RequestCorrelator>,
    reconciler: Arc<Mutex<HistoryReconciler>>,
    data_tx: broadcast::Sender<Arc<TelemetrySample>>,
    notice_tx: broadcast::Sender<Notice>,
    /// Register assumed when a telemetry frame does not name one.
    base_register: u16,
    last_data: Mutex<Option<Instant>>,
    record_count: AtomicU64,
}

impl TelemetryDispatcher {
    pub fn new(
        correlator: Arc<RequestCorrelator>,
        reconciler: Arc<Mutex<HistoryReconciler>>,
        base_register: u16,
    ) -> Self {
        let (data_tx, _) = broadcast::channel(256);
        let (notice_tx, _) = broadcast::channel(64);
        Self {
            correlator,
            reconciler,
            data_tx,
            notice_tx,
            base_register,
            last_data: Mutex::new(None),
            record_count: AtomicU64::new(0),
        }
    }

    /// Live telemetry fan-out.
    pub fn subscribe_data(&self) -> broadcast::Receiver<Arc<TelemetrySample>> {
        self.data_tx.subscribe()
    }

    /// Non-fatal notices (endpoint errors, dataflow stalls).
    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notice_tx.subscribe()
    }

    pub fn publish_notice(&self, notice: Notice) {
        let _ = self.notice_tx.send(notice);
    }

    /// When the last telemetry sample arrived, if any.
    pub fn last_data_at(&self) -> Option<Instant> {
        *self.last_data.lock().expect("dispatcher lock poisoned")
    }

    /// The endpoint's most recently reported record count.
    pub fn record_count(&self) -> u64 {
        self.record_count.load(Ordering::Relaxed)
    }

    /// Classifies and routes one raw frame. Decode failures are logged and
    /// dropped; nothing here is fatal.
    pub fn dispatch(&self, raw: &str) {
        let frame: InboundFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping malformed inbound frame: {}", e);
                return;
            }
        };

        if let Some(count) = frame.record_count {
            self.record_count.store(count, Ordering::Relaxed);
        }

        // Correlated response. A frame whose identifier matches nothing
        // outstanding is stale and dropped outright.
        if frame.message_id.is_some() {
            if !self.correlator.resolve(&frame) {
                log::debug!(
                    "Dropping frame with unknown messageId {:?}",
                    frame.message_id
                );
            }
            return;
        }

        // Unsolicited endpoint error: surface, never crash, never sample.
        if let Some(error) = frame.error {
            log::warn!("Endpoint reported error: {}", error);
            let _ = self.notice_tx.send(Notice::RemoteError(error));
            return;
        }

        let Some(data) = frame.data else {
            log::debug!("Ignoring frame without payload");
            return;
        };
        let Some(first) = data.first() else {
            log::debug!("Ignoring telemetry frame with empty data array");
            return;
        };

        let register = frame.register.unwrap_or(self.base_register);
        let sample = TelemetrySample::live(register, SampleValue::Number(*first));

        *self.last_data.lock().expect("dispatcher lock poisoned") = Some(Instant::now());
        self.reconciler
            .lock()
            .expect("reconciler lock poisoned")
            .record_live(sample.clone());
        let _ = self.data_tx.send(Arc::new(sample));
    }

    /// The dispatch loop: consumes the connection's frame channel until the
    /// channel closes or shutdown is signalled.
    pub async fn run(
        self: Arc<Self>,
        mut frames: mpsc::UnboundedReceiver<String>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    log::info!("Dispatch loop shutting down");
                    break;
                }
                frame = frames.recv() => {
                    match frame {
                        Some(raw) => self.dispatch(&raw),
                        None => break,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::PlcError;
    use crate::core::model::{Provenance, RequestKind};
    use std::time::Duration;

    fn build(
        base_register: u16,
    ) -> (
        Arc<RequestCorrelator>,
        Arc<Mutex<HistoryReconciler>>,
        TelemetryDispatcher,
    ) {
        let correlator = Arc::new(RequestCorrelator::new());
        let reconciler = Arc::new(Mutex::new(HistoryReconciler::new(100)));
        let dispatcher = TelemetryDispatcher::new(
            Arc::clone(&correlator),
            Arc::clone(&reconciler),
            base_register,
        );
        (correlator, reconciler, dispatcher)
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped_without_panic() {
        let (_, reconciler, dispatcher) = build(0x6304);
        dispatcher.dispatch("not json at all");
        dispatcher.dispatch(r#"{"data": "wrong type"}"#);
        assert!(reconciler.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn telemetry_frame_becomes_live_sample() {
        let (_, reconciler, dispatcher) = build(0x6304);
        let mut data_rx = dispatcher.subscribe_data();

        dispatcher.dispatch(r#"{"data":[1],"register":25349,"recordCount":7}"#);

        let sample = data_rx.try_recv().unwrap();
        assert_eq!(sample.register, 0x6305);
        assert!(sample.value.as_bool());
        assert_eq!(sample.provenance, Provenance::Live);
        assert_eq!(reconciler.lock().unwrap().len(), 1);
        assert_eq!(dispatcher.record_count(), 7);
        assert!(dispatcher.last_data_at().is_some());
    }

    #[tokio::test]
    async fn register_defaults_to_base_when_absent() {
        let (_, reconciler, dispatcher) = build(0x6304);
        dispatcher.dispatch(r#"{"data":[0]}"#);
        let window = reconciler.lock().unwrap().snapshot();
        assert_eq!(window[0].register, 0x6304);
        assert!(!window[0].value.as_bool());
    }

    #[tokio::test]
    async fn correlated_response_is_never_telemetry() {
        let (correlator, reconciler, dispatcher) = build(0x6304);
        let (id, rx) =
            correlator.register_pending(RequestKind::Read, 0x6304, Duration::from_millis(500));

        // Carries both a messageId and a data payload: correlation takes
        // precedence, so the window must stay empty.
        dispatcher.dispatch(&format!(
            r#"{{"messageId":"{}","success":true,"data":[1]}}"#,
            id
        ));

        assert_eq!(rx.await.unwrap(), Ok(vec![1.0]));
        assert!(reconciler.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_message_id_is_dropped_entirely() {
        let (_, reconciler, dispatcher) = build(0x6304);
        let mut data_rx = dispatcher.subscribe_data();

        dispatcher.dispatch(r#"{"messageId":"404","data":[1]}"#);

        assert!(reconciler.lock().unwrap().is_empty());
        assert!(data_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsolicited_error_becomes_notice() {
        let (_, reconciler, dispatcher) = build(0x6304);
        let mut notices = dispatcher.subscribe_notices();

        dispatcher.dispatch(r#"{"error":"PLC unreachable"}"#);

        assert_eq!(
            notices.try_recv().unwrap(),
            Notice::RemoteError("PLC unreachable".to_string())
        );
        assert!(reconciler.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn error_frame_with_message_id_settles_the_request() {
        let (correlator, _, dispatcher) = build(0x6304);
        let mut notices = dispatcher.subscribe_notices();
        let (id, rx) =
            correlator.register_pending(RequestKind::Write, 0x6304, Duration::from_millis(500));

        dispatcher.dispatch(&format!(
            r#"{{"messageId":"{}","success":false,"error":"write refused"}}"#,
            id
        ));

        assert_eq!(
            rx.await.unwrap(),
            Err(PlcError::RemoteError("write refused".to_string()))
        );
        // Correlated failures go to the caller, not to the notice stream.
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn payloadless_frame_is_ignored() {
        let (_, reconciler, dispatcher) = build(0x6304);
        dispatcher.dispatch(r#"{}"#);
        dispatcher.dispatch(r#"{"data":[]}"#);
        assert!(reconciler.lock().unwrap().is_empty());
    }
}
