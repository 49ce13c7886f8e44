use crate::plc_logic::config::Config;
use lib_common::{
    HistoryReconciler, Notice, PlcConnection, PlcError, RequestCorrelator, RequestKind,
    TelemetryDispatcher, TelemetrySample,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Composition root for the gateway: owns the connection, the correlator,
/// the dispatcher, and the history window, and exposes the interface the UI
/// layer consumes (data/status/notice subscriptions plus read and write
/// requests).
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    connection: Arc<PlcConnection>,
    correlator: Arc<RequestCorrelator>,
    dispatcher: Arc<TelemetryDispatcher>,
    reconciler: Arc<Mutex<HistoryReconciler>>,
}

impl AppState {
    /// Builds the component graph. The returned receiver carries raw
    /// inbound frames and must be handed to
    /// [`spawn_core_tasks`](Self::spawn_core_tasks) before
    /// [`connect`](Self::connect) is called.
    pub fn new(config: Config) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (connection, frame_rx) =
            PlcConnection::new(Duration::from_millis(config.reconnect_delay_ms));
        let correlator = Arc::new(RequestCorrelator::new());
        let reconciler = Arc::new(Mutex::new(HistoryReconciler::new(config.history_cap)));
        let dispatcher = Arc::new(TelemetryDispatcher::new(
            Arc::clone(&correlator),
            Arc::clone(&reconciler),
            config.base_register,
        ));

        (
            Self {
                config,
                connection: Arc::new(connection),
                correlator,
                dispatcher,
                reconciler,
            },
            frame_rx,
        )
    }

    /// Spawns the dispatch loop and the status watcher. The watcher settles
    /// every outstanding request with `ConnectionLost` the moment the
    /// connection leaves the open state.
    pub fn spawn_core_tasks(
        &self,
        frame_rx: mpsc::UnboundedReceiver<String>,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> Vec<JoinHandle<()>> {
        let dispatch = tokio::spawn(
            Arc::clone(&self.dispatcher).run(frame_rx, shutdown_tx.subscribe()),
        );

        let correlator = Arc::clone(&self.correlator);
        let mut status_rx = self.connection.subscribe_status();
        let mut shutdown_rx = shutdown_tx.subscribe();
        let status_watch = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    status = status_rx.recv() => {
                        match status {
                            Ok(false) => correlator.fail_all(PlcError::ConnectionLost),
                            Ok(true) => {}
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Status watcher lagged by {} notifications", n);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });

        vec![dispatch, status_watch]
    }

    /// Opens the connection against the configured endpoint, forwarding the
    /// PLC addressing when one is configured.
    pub fn connect(&self) {
        self.connection
            .connect(&self.config.endpoint_url, self.config.plc.clone());
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    /// Reads `count` words starting at `register`.
    pub async fn read_request(
        &self,
        register: u16,
        count: Option<u16>,
    ) -> Result<Vec<f64>, PlcError> {
        self.correlator
            .issue(
                &self.connection,
                RequestKind::Read,
                register,
                None,
                count,
                Duration::from_millis(self.config.request_timeout_ms),
            )
            .await
    }

    /// Writes one value to `register`.
    pub async fn write_request(&self, register: u16, value: f64) -> Result<(), PlcError> {
        self.correlator
            .issue(
                &self.connection,
                RequestKind::Write,
                register,
                Some(value),
                None,
                Duration::from_millis(self.config.request_timeout_ms),
            )
            .await
            .map(|_| ())
    }

    /// Current history window, newest first.
    pub fn history(&self) -> Vec<TelemetrySample> {
        self.reconciler
            .lock()
            .expect("reconciler lock poisoned")
            .snapshot()
    }

    /// Feeds a persisted batch into the window.
    pub fn merge_persisted(&self, batch: Vec<TelemetrySample>) {
        self.reconciler
            .lock()
            .expect("reconciler lock poisoned")
            .merge_persisted(batch);
    }

    pub fn subscribe_data(&self) -> broadcast::Receiver<Arc<TelemetrySample>> {
        self.dispatcher.subscribe_data()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<bool> {
        self.connection.subscribe_status()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.dispatcher.subscribe_notices()
    }

    pub fn dispatcher(&self) -> &TelemetryDispatcher {
        &self.dispatcher
    }
}
