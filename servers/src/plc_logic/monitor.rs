use crate::plc_logic::state::AppState;
use lib_common::Notice;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;

/// Dataflow watchdog: while the connection is open, telemetry should keep
/// arriving; when it goes quiet past the configured threshold, observers
/// get a stall notice. The connection's own watchdog handles the actual
/// reconnect; this task only surfaces the condition.
pub async fn run(app_state: AppState, mut shutdown: broadcast::Receiver<()>) {
    let check_interval = app_state.config.dataflow_check_interval_seconds;
    let threshold = Duration::from_secs(app_state.config.dataflow_inactivity_threshold_seconds);
    let mut check = interval(Duration::from_secs(check_interval));

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Monitor service received shutdown signal.");
                break;
            }
            _ = check.tick() => {
                if !app_state.is_connected() {
                    continue;
                }
                let Some(last) = app_state.dispatcher().last_data_at() else {
                    continue;
                };
                let quiet = last.elapsed();
                if quiet > threshold {
                    log::warn!(
                        "No telemetry for {} seconds while connected.",
                        quiet.as_secs()
                    );
                    app_state
                        .dispatcher()
                        .publish_notice(Notice::DataflowStalled(quiet.as_secs()));
                }
            }
        }
    }
}
