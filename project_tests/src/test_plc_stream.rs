//! # PlcStream End-to-End Scenario Runner
//!
//! Drives the full engine (connection state machine, dispatcher, request
//! correlator, history reconciler) against an in-process mock acquisition
//! endpoint, covering the connect / telemetry / read / write / timeout /
//! reconnect scenarios end to end. Self-contained: no external services.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;

use lib_common::{
    HistoryReconciler, Notice, PlcConnection, PlcError, Provenance, RequestCorrelator,
    RequestKind, SampleValue, TelemetryDispatcher, TelemetrySample,
};

const TICK: Duration = Duration::from_millis(2000);

/// Registers with scripted behavior on the mock endpoint.
const REG_COIL: u16 = 0x6304;
const REG_LOCKED: u16 = 0x9999;
const REG_SILENT: u16 = 0x7777;

/// Mock acquisition endpoint: answers read/write commands per register and
/// lets the runner push unsolicited frames to the connected client. Exits
/// when the push channel closes or the client goes away.
async fn serve_one(
    listener: &TcpListener,
    mut push_rx: tokio::sync::mpsc::UnboundedReceiver<String>,
) {
    let (stream, _) = listener.accept().await.expect("accept failed");
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .expect("handshake failed");
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            pushed = push_rx.recv() => {
                match pushed {
                    Some(text) => {
                        if write.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            msg = read.next() => {
                let Some(Ok(Message::Text(text))) = msg else { break };
                let frame: serde_json::Value = serde_json::from_str(&text).expect("bad command");
                let action = frame["action"].as_str().unwrap_or_default();
                let register = frame["register"].as_u64().unwrap_or(0) as u16;
                let message_id = frame["messageId"].as_str().map(str::to_string);

                let reply = match (action, register) {
                    // connect_plc / disconnect_plc carry no messageId
                    ("connect_plc", _) | ("disconnect_plc", _) => None,
                    (_, REG_SILENT) => None, // scripted: never answer
                    ("read_plc", _) => Some(serde_json::json!({
                        "messageId": message_id,
                        "success": true,
                        "data": [7],
                        "register": register,
                    })),
                    ("write_plc", REG_LOCKED) => Some(serde_json::json!({
                        "messageId": message_id,
                        "success": false,
                        "error": "register is read-only",
                    })),
                    ("write_plc", _) => Some(serde_json::json!({
                        "messageId": message_id,
                        "success": true,
                    })),
                    _ => None,
                };

                if let Some(reply) = reply {
                    if write.send(Message::Text(reply.to_string().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}", listener.local_addr()?);

    // Channel for pushing unsolicited frames through the mock endpoint.
    let (push_tx, push_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    println!("--- Starting PlcStream End-to-End Tests ---");

    // Assemble the engine exactly as the service binary does.
    let (connection, frame_rx) = PlcConnection::new(Duration::from_millis(200));
    let connection = Arc::new(connection);
    let correlator = Arc::new(RequestCorrelator::new());
    let reconciler = Arc::new(Mutex::new(HistoryReconciler::new(100)));
    let dispatcher = Arc::new(TelemetryDispatcher::new(
        Arc::clone(&correlator),
        Arc::clone(&reconciler),
        REG_COIL,
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    tokio::spawn(Arc::clone(&dispatcher).run(frame_rx, shutdown_tx.subscribe()));

    // Status watcher: connection loss settles every outstanding request.
    {
        let correlator = Arc::clone(&correlator);
        let mut status_rx = connection.subscribe_status();
        tokio::spawn(async move {
            while let Ok(connected) = status_rx.recv().await {
                if !connected {
                    correlator.fail_all(PlcError::ConnectionLost);
                }
            }
        });
    }

    let mut status_rx = connection.subscribe_status();
    let mut data_rx = dispatcher.subscribe_data();
    let mut notice_rx = dispatcher.subscribe_notices();

    // --- TEST 1: Connect ---
    println!("\n[Test 1] Connecting to mock endpoint...");
    let server = tokio::spawn(async move {
        serve_one(&listener, push_rx).await;
        listener
    });
    connection.connect(&url, None);
    assert!(timeout(TICK, status_rx.recv()).await??);
    println!("✅ Status changed to connected");

    // --- TEST 2: Unsolicited telemetry becomes a live sample ---
    println!("\n[Test 2] Pushing unsolicited telemetry...");
    push_tx.send(r#"{"data":[1],"register":25348,"recordCount":3}"#.to_string())?;
    let sample = timeout(TICK, data_rx.recv()).await??;
    assert_eq!(sample.register, REG_COIL);
    assert!(sample.value.as_bool());
    assert_eq!(sample.provenance, Provenance::Live);
    assert_eq!(reconciler.lock().unwrap().len(), 1);
    assert_eq!(dispatcher.record_count(), 3);
    println!("✅ Telemetry recorded in the history window");

    // --- TEST 3: Stale messageId frames are dropped without effect ---
    println!("\n[Test 3] Pushing a frame with an unknown messageId...");
    push_tx.send(r#"{"messageId":"404","data":[1]}"#.to_string())?;
    assert!(timeout(Duration::from_millis(300), data_rx.recv()).await.is_err());
    assert_eq!(reconciler.lock().unwrap().len(), 1);
    println!("✅ Stale frame dropped (no sample, no crash)");

    // --- TEST 4: Unsolicited error frames surface as notices ---
    println!("\n[Test 4] Pushing an unsolicited error frame...");
    push_tx.send(r#"{"error":"plc fault"}"#.to_string())?;
    let notice = timeout(TICK, notice_rx.recv()).await??;
    assert_eq!(notice, Notice::RemoteError("plc fault".to_string()));
    println!("✅ Error surfaced as a non-fatal notice");

    // --- TEST 5: Correlated read settles with the carried value ---
    println!("\n[Test 5] Issuing a read request...");
    let outcome = correlator
        .issue(
            &connection,
            RequestKind::Read,
            REG_COIL,
            None,
            Some(1),
            Duration::from_millis(1000),
        )
        .await;
    assert_eq!(outcome, Ok(vec![7.0]));
    assert_eq!(correlator.outstanding(), 0);
    println!("✅ Read settled with value 7");

    // --- TEST 6: Correlated write settles success ---
    println!("\n[Test 6] Issuing a write request...");
    let outcome = correlator
        .issue(
            &connection,
            RequestKind::Write,
            REG_COIL,
            Some(1.0),
            None,
            Duration::from_millis(1000),
        )
        .await;
    assert_eq!(outcome, Ok(vec![]));
    println!("✅ Write acknowledged");

    // --- TEST 7: Rejected write settles as a remote error ---
    println!("\n[Test 7] Writing to a locked register...");
    let outcome = correlator
        .issue(
            &connection,
            RequestKind::Write,
            REG_LOCKED,
            Some(1.0),
            None,
            Duration::from_millis(1000),
        )
        .await;
    assert_eq!(
        outcome,
        Err(PlcError::RemoteError("register is read-only".to_string()))
    );
    println!("✅ Rejection surfaced to the caller");

    // --- TEST 8: Unanswered request times out ---
    println!("\n[Test 8] Reading a register the endpoint never answers...");
    let outcome = correlator
        .issue(
            &connection,
            RequestKind::Read,
            REG_SILENT,
            None,
            Some(1),
            Duration::from_millis(400),
        )
        .await;
    assert_eq!(outcome, Err(PlcError::Timeout));
    assert_eq!(correlator.outstanding(), 0);
    println!("✅ Timeout fired and cleaned the pending table");

    // --- TEST 9: Drop and automatic reconnect ---
    println!("\n[Test 9] Dropping the endpoint...");
    drop(push_tx); // serve_one exits, closing the socket
    let listener = server.await?;
    assert!(!timeout(TICK, status_rx.recv()).await??);
    println!("✅ Status changed to disconnected");

    let (push_tx, push_rx2) = tokio::sync::mpsc::unbounded_channel::<String>();
    tokio::spawn(async move { serve_one(&listener, push_rx2).await });
    assert!(timeout(TICK, status_rx.recv()).await??);
    assert!(connection.retries() >= 1);
    println!("✅ Reconnected automatically after the fixed delay");

    // --- TEST 10: Persisted merge is idempotent and live wins ties ---
    println!("\n[Test 10] Merging persisted history...");
    let live_stamp = reconciler.lock().unwrap().snapshot()[0].timestamp;
    let batch = vec![TelemetrySample {
        timestamp: live_stamp,
        register: REG_COIL,
        value: SampleValue::Bool(false),
        provenance: Provenance::Persisted,
    }];
    reconciler.lock().unwrap().merge_persisted(batch.clone());
    reconciler.lock().unwrap().merge_persisted(batch);
    let window = reconciler.lock().unwrap().snapshot();
    assert_eq!(window.iter().filter(|s| s.register == REG_COIL).count(), 1);
    assert!(window[0].value.as_bool(), "live sample must win the tie");
    println!("✅ Merge idempotent, live sample retained");

    // --- TEST 11: Explicit disconnect suppresses reconnection ---
    println!("\n[Test 11] Disconnecting...");
    connection.disconnect();
    assert!(!timeout(TICK, status_rx.recv()).await??);
    let _ = push_tx; // endpoint side kept alive until here
    println!("✅ Disconnected; automatic reconnection disabled");

    println!("\n--- All PlcStream End-to-End Tests Passed ---");
    Ok(())
}
