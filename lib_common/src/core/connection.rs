//! # Acquisition Endpoint Connection
//!
//! Owns the physical WebSocket connection to the data-acquisition endpoint:
//! lifecycle (disconnected → connecting → open → closing), fixed-delay
//! automatic reconnection, and the single send path every other component
//! must go through. The socket itself never leaves the IO task, so a
//! close/reconnect can never race an in-flight write from another task.
//!
//! Inbound text frames are funneled, in arrival order, into the unbounded
//! channel handed out by [`PlcConnection::new`]; one consumer (the dispatch
//! loop) reads them so no two frames are ever processed concurrently.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::error::PlcError;
use crate::core::model::{CommandAction, OutboundCommand, PlcConfig};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Messages queued towards the IO task. `Shutdown` travels through the same
/// FIFO as frames so a goodbye written just before it is flushed first.
enum Outbound {
    Frame(String),
    Shutdown,
}

struct ConnInner {
    state: Mutex<ConnectionState>,
    target: Mutex<Option<String>>,
    /// Sender into the current IO task's outbound queue; present only while
    /// a socket is open.
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    status_tx: broadcast::Sender<bool>,
    frame_tx: mpsc::UnboundedSender<String>,
    io_token: Mutex<Option<CancellationToken>>,
    /// Bumped on every connect()/disconnect(); an IO task whose epoch is
    /// stale may no longer touch shared state, so a superseded task cannot
    /// clobber its successor.
    epoch: AtomicU64,
    auto_reconnect: AtomicBool,
    reconnect_delay: Duration,
    retries: AtomicU32,
    last_error: Mutex<Option<String>>,
}

impl ConnInner {
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.lock().expect("connection state lock poisoned") = next;
    }

    fn set_state_if(&self, epoch: u64, next: ConnectionState) {
        let mut guard = self.state.lock().expect("connection state lock poisoned");
        if self.is_current(epoch) {
            *guard = next;
        }
    }

    fn notify_status(&self, connected: bool) {
        // No receivers is fine; broadcast just drops the value.
        let _ = self.status_tx.send(connected);
    }

    fn notify_status_if(&self, epoch: u64, connected: bool) {
        if self.is_current(epoch) {
            self.notify_status(connected);
        }
    }

    fn install_outbound(&self, epoch: u64, tx: mpsc::UnboundedSender<Outbound>) -> bool {
        let mut guard = self.outbound.lock().expect("connection state lock poisoned");
        if self.is_current(epoch) {
            *guard = Some(tx);
            true
        } else {
            false
        }
    }

    fn clear_outbound(&self, epoch: u64) {
        let mut guard = self.outbound.lock().expect("connection state lock poisoned");
        if self.is_current(epoch) {
            guard.take();
        }
    }

    fn record_error(&self, message: String) {
        *self.last_error.lock().expect("connection state lock poisoned") = Some(message);
    }
}

/// Handle to one acquisition-endpoint connection.
///
/// Constructible and independent: tests can run several side by side
/// without global interference. Subscribe to status changes before calling
/// [`connect`](Self::connect), or the initial transition may be missed.
pub struct PlcConnection {
    inner: Arc<ConnInner>,
}

impl PlcConnection {
    /// Creates a connection handle plus the inbound-frame receiver that the
    /// dispatch loop consumes.
    pub fn new(reconnect_delay: Duration) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = broadcast::channel(64);
        let inner = Arc::new(ConnInner {
            state: Mutex::new(ConnectionState::Disconnected),
            target: Mutex::new(None),
            outbound: Mutex::new(None),
            status_tx,
            frame_tx,
            io_token: Mutex::new(None),
            epoch: AtomicU64::new(0),
            auto_reconnect: AtomicBool::new(false),
            reconnect_delay,
            retries: AtomicU32::new(0),
            last_error: Mutex::new(None),
        });
        (Self { inner }, frame_rx)
    }

    /// Opens (or re-targets) the connection. No-op when already connecting
    /// or open against the same address. Must be called from within a tokio
    /// runtime. An unparseable address is logged and ignored.
    pub fn connect(&self, address: &str, config: Option<PlcConfig>) {
        if let Err(e) = Url::parse(address) {
            log::error!("Invalid endpoint address '{}': {}", address, e);
            self.inner.record_error(format!("invalid address: {}", e));
            return;
        }

        {
            let state = *self.inner.state.lock().expect("connection state lock poisoned");
            let same_target = self
                .inner
                .target
                .lock()
                .expect("connection state lock poisoned")
                .as_deref()
                == Some(address);
            if same_target
                && matches!(state, ConnectionState::Connecting | ConnectionState::Open)
            {
                log::debug!("connect() ignored; already {:?} against {}", state, address);
                return;
            }
        }

        // Supersede and tear down any previous IO task before starting a
        // new cycle.
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(token) = self
            .inner
            .io_token
            .lock()
            .expect("connection state lock poisoned")
            .take()
        {
            token.cancel();
        }

        *self
            .inner
            .target
            .lock()
            .expect("connection state lock poisoned") = Some(address.to_string());
        self.inner.auto_reconnect.store(true, Ordering::SeqCst);
        self.inner.retries.store(0, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Connecting);

        let token = CancellationToken::new();
        *self
            .inner
            .io_token
            .lock()
            .expect("connection state lock poisoned") = Some(token.clone());

        tokio::spawn(io_loop(
            Arc::clone(&self.inner),
            epoch,
            address.to_string(),
            config,
            token,
        ));
    }

    /// Gracefully closes the connection and disables automatic reconnection
    /// until the next explicit [`connect`](Self::connect). If the socket is
    /// open, the endpoint is told to release the PLC first (best effort,
    /// failures ignored).
    pub fn disconnect(&self) {
        self.inner.auto_reconnect.store(false, Ordering::SeqCst);
        let previous = self.state();

        // Supersede the running task; its own state/status writes become
        // no-ops and this call settles them instead.
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);

        let mut wound_down = false;
        if previous == ConnectionState::Open {
            self.inner.set_state(ConnectionState::Closing);
            let guard = self
                .inner
                .outbound
                .lock()
                .expect("connection state lock poisoned");
            if let Some(tx) = &*guard {
                if let Ok(text) =
                    serde_json::to_string(&OutboundCommand::bare(CommandAction::DisconnectPlc))
                {
                    let _ = tx.send(Outbound::Frame(text));
                }
                // Queued behind the goodbye, so the goodbye flushes first.
                wound_down = tx.send(Outbound::Shutdown).is_ok();
            }
        }

        let token = self
            .inner
            .io_token
            .lock()
            .expect("connection state lock poisoned")
            .take();
        if !wound_down {
            if let Some(token) = token {
                token.cancel();
            }
        }

        self.inner
            .outbound
            .lock()
            .expect("connection state lock poisoned")
            .take();
        self.inner.set_state(ConnectionState::Disconnected);
        if matches!(previous, ConnectionState::Open | ConnectionState::Connecting) {
            self.inner.notify_status(false);
        }
    }

    /// Sends a command frame through the open socket. This is the only way
    /// any component reaches the transport.
    pub fn send(&self, command: &OutboundCommand) -> Result<(), PlcError> {
        if self.state() != ConnectionState::Open {
            return Err(PlcError::NotConnected);
        }
        let text = serde_json::to_string(command)
            .map_err(|e| PlcError::DecodeError(e.to_string()))?;
        let guard = self
            .inner
            .outbound
            .lock()
            .expect("connection state lock poisoned");
        match &*guard {
            Some(tx) => tx
                .send(Outbound::Frame(text))
                .map_err(|_| PlcError::ConnectionLost),
            None => Err(PlcError::NotConnected),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().expect("connection state lock poisoned")
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Status-change notifications: `true` on open, `false` on loss. Fired
    /// from the IO task's own execution context, no queuing.
    pub fn subscribe_status(&self) -> broadcast::Receiver<bool> {
        self.inner.status_tx.subscribe()
    }

    /// Number of reconnect cycles since the last explicit connect.
    pub fn retries(&self) -> u32 {
        self.inner.retries.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner
            .last_error
            .lock()
            .expect("connection state lock poisoned")
            .clone()
    }
}

/// The IO task: one connect/read/write cycle per iteration, with the fixed
/// reconnect delay between cycles, until superseded, cancelled, or
/// reconnection is disabled.
async fn io_loop(
    inner: Arc<ConnInner>,
    epoch: u64,
    address: String,
    config: Option<PlcConfig>,
    token: CancellationToken,
) {
    loop {
        if token.is_cancelled() || !inner.is_current(epoch) {
            break;
        }
        inner.set_state_if(epoch, ConnectionState::Connecting);
        log::info!("Connecting to acquisition endpoint: {}", address);

        let attempt = tokio::select! {
            _ = token.cancelled() => break,
            res = connect_async(address.as_str()) => res,
        };

        match attempt {
            Ok((ws_stream, _)) => {
                log::info!("Connected to acquisition endpoint");
                let (mut write, mut read) = ws_stream.split();
                let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
                if !inner.install_outbound(epoch, out_tx) {
                    // Superseded between connect() calls; drop the socket.
                    let _ = write.close().await;
                    break;
                }
                inner.set_state_if(epoch, ConnectionState::Open);
                inner.notify_status_if(epoch, true);

                // Forward the PLC addressing configuration so the endpoint
                // can bring up its side of the link.
                if let Some(cfg) = &config {
                    let cmd = OutboundCommand {
                        config: Some(cfg.clone()),
                        ..OutboundCommand::bare(CommandAction::ConnectPlc)
                    };
                    match serde_json::to_string(&cmd) {
                        Ok(text) => {
                            if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                                log::error!("Failed to send connect_plc config: {}", e);
                            }
                        }
                        Err(e) => log::error!("Failed to encode connect_plc config: {}", e),
                    }
                }

                let mut wound_down = false;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => {
                            wound_down = true;
                            let _ = write.close().await;
                            break;
                        }
                        Some(out) = out_rx.recv() => {
                            match out {
                                Outbound::Frame(text) => {
                                    if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                                        log::error!("Failed to send command frame: {}", e);
                                        inner.record_error(e.to_string());
                                        break;
                                    }
                                }
                                Outbound::Shutdown => {
                                    wound_down = true;
                                    let _ = write.close().await;
                                    break;
                                }
                            }
                        }
                        msg = read.next() => {
                            match msg {
                                Some(Ok(WsMessage::Text(text))) => {
                                    let _ = inner.frame_tx.send(text.to_string());
                                }
                                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {}
                                Some(Ok(WsMessage::Close(_))) => {
                                    log::warn!("Endpoint closed the connection");
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    log::error!("Transport error: {}", e);
                                    inner.record_error(e.to_string());
                                    break;
                                }
                                None => {
                                    log::warn!("Stream closed by remote host");
                                    break;
                                }
                            }
                        }
                    }
                }

                inner.clear_outbound(epoch);
                inner.set_state_if(epoch, ConnectionState::Disconnected);
                inner.notify_status_if(epoch, false);
                if wound_down {
                    break;
                }
            }
            Err(e) => {
                log::error!("Failed to connect to {}: {}", address, e);
                inner.record_error(e.to_string());
                inner.set_state_if(epoch, ConnectionState::Disconnected);
                inner.notify_status_if(epoch, false);
            }
        }

        if !inner.auto_reconnect.load(Ordering::SeqCst) || !inner.is_current(epoch) {
            break;
        }
        log::info!("Reconnecting in {} ms", inner.reconnect_delay.as_millis());
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(inner.reconnect_delay) => {}
        }
        inner.retries.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_millis(2000);

    /// Accepts one WebSocket client and returns the accepted stream.
    async fn accept_one(
        listener: &TcpListener,
    ) -> tokio_tungstenite::WebSocketStream<tokio::net::TcpStream> {
        let (stream, _) = listener.accept().await.expect("accept failed");
        tokio_tungstenite::accept_async(stream)
            .await
            .expect("ws handshake failed")
    }

    #[tokio::test]
    async fn send_while_disconnected_fails() {
        let (conn, _frames) = PlcConnection::new(Duration::from_millis(100));
        let cmd = OutboundCommand::bare(CommandAction::ReadPlc);
        assert_eq!(conn.send(&cmd), Err(PlcError::NotConnected));
    }

    #[tokio::test]
    async fn invalid_address_is_rejected_without_state_change() {
        let (conn, _frames) = PlcConnection::new(Duration::from_millis(100));
        conn.connect("not a url", None);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.last_error().is_some());
    }

    #[tokio::test]
    async fn opens_receives_frames_and_reconnects_after_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("ws://{}", addr);

        let (conn, mut frames) = PlcConnection::new(Duration::from_millis(100));
        let mut status = conn.subscribe_status();
        conn.connect(&url, None);

        // First cycle: open, push one telemetry frame, then drop the socket.
        let mut server = accept_one(&listener).await;
        assert!(timeout(TICK, status.recv()).await.unwrap().unwrap());
        assert_eq!(conn.state(), ConnectionState::Open);

        server
            .send(WsMessage::Text(r#"{"data":[1]}"#.into()))
            .await
            .unwrap();
        let raw = timeout(TICK, frames.recv()).await.unwrap().unwrap();
        assert_eq!(raw, r#"{"data":[1]}"#);

        drop(server);
        assert!(!timeout(TICK, status.recv()).await.unwrap().unwrap());

        // Second cycle: the fixed-delay reconnect lands on its own.
        let mut server = accept_one(&listener).await;
        assert!(timeout(TICK, status.recv()).await.unwrap().unwrap());
        assert!(conn.retries() >= 1);

        server
            .send(WsMessage::Text(r#"{"data":[0]}"#.into()))
            .await
            .unwrap();
        let raw = timeout(TICK, frames.recv()).await.unwrap().unwrap();
        assert_eq!(raw, r#"{"data":[0]}"#);

        conn.disconnect();
        assert!(!timeout(TICK, status.recv()).await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn connect_forwards_plc_config_payload() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("ws://{}", addr);

        let (conn, _frames) = PlcConnection::new(Duration::from_millis(100));
        let config = PlcConfig {
            mode: "tcp".to_string(),
            ip: Some("10.0.0.7".to_string()),
            port: Some(502),
            slave: Some(1),
            ..Default::default()
        };
        conn.connect(&url, Some(config));

        let mut server = accept_one(&listener).await;
        let msg = timeout(TICK, server.next()).await.unwrap().unwrap().unwrap();
        let frame: serde_json::Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        assert_eq!(frame["action"], "connect_plc");
        assert_eq!(frame["config"]["type"], "tcp");
        assert_eq!(frame["config"]["ip"], "10.0.0.7");

        conn.disconnect();
    }

    #[tokio::test]
    async fn disconnect_sends_goodbye_and_stops_reconnecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("ws://{}", addr);

        let (conn, _frames) = PlcConnection::new(Duration::from_millis(50));
        let mut status = conn.subscribe_status();
        conn.connect(&url, None);

        let mut server = accept_one(&listener).await;
        assert!(timeout(TICK, status.recv()).await.unwrap().unwrap());

        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!timeout(TICK, status.recv()).await.unwrap().unwrap());

        // The goodbye frame flushed before the socket closed.
        let msg = timeout(TICK, server.next()).await.unwrap().unwrap().unwrap();
        let frame: serde_json::Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        assert_eq!(frame["action"], "disconnect_plc");

        // No new attempt lands after disconnect: the listener stays silent
        // past several reconnect delays.
        let quiet = timeout(Duration::from_millis(300), listener.accept()).await;
        assert!(quiet.is_err(), "unexpected reconnect after disconnect()");
    }

    #[tokio::test]
    async fn connect_is_noop_while_open_on_same_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("ws://{}", addr);

        let (conn, _frames) = PlcConnection::new(Duration::from_millis(100));
        let mut status = conn.subscribe_status();
        conn.connect(&url, None);

        let _server = accept_one(&listener).await;
        assert!(timeout(TICK, status.recv()).await.unwrap().unwrap());

        conn.connect(&url, None);
        assert_eq!(conn.state(), ConnectionState::Open);
        // A redundant connect must not open a second socket.
        let quiet = timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(quiet.is_err(), "unexpected second connection");

        conn.disconnect();
    }
}
