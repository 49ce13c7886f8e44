use anyhow::Result;
use tokio::signal;

mod plc_logic;
use plc_logic::{config, downstream, history, logger, monitor, state};

use lib_common::RedisSampleStore;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config();
    logger::setup_logging(&config.log_dir, &config.log_level)?;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let (app_state, frame_rx) = state::AppState::new(config.clone());

    // Core tasks must be running (and subscribed) before the first connect.
    let mut handles = app_state.spawn_core_tasks(frame_rx, &shutdown_tx);

    match RedisSampleStore::new(&config.redis_url, &config.redis_key_prefix).await {
        Ok(store) => {
            handles.push(tokio::spawn(history::run(
                store,
                app_state.clone(),
                shutdown_tx.subscribe(),
            )));
        }
        Err(e) => {
            log::warn!(
                "Sample store unavailable ({}); running without persistence.",
                e
            );
        }
    }

    handles.push(tokio::spawn(monitor::run(
        app_state.clone(),
        shutdown_tx.subscribe(),
    )));
    handles.push(tokio::spawn(downstream::run(
        config.clone(),
        app_state.clone(),
        shutdown_tx.subscribe(),
    )));

    app_state.connect();

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate()).unwrap();
                term_signal.recv().await;
                log::info!("SIGTERM received, initiating shutdown.");
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());
    app_state.disconnect();

    // Wait for components to shut down
    for handle in handles {
        let _ = handle.await;
    }

    log::info!("Shutdown complete.");
    Ok(())
}
