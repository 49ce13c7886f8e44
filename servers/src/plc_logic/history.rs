use crate::plc_logic::state::AppState;
use lib_common::SampleStore;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;

/// Store bridge: persists every live sample (plus the endpoint status
/// record) and periodically pulls persisted history back into the window.
/// The first refresh fires immediately, covering the initial load.
pub async fn run<S: SampleStore + 'static>(
    store: S,
    app_state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut data_rx = app_state.subscribe_data();
    let mut refresh = interval(Duration::from_secs(app_state.config.history_refresh_seconds));
    let limit = app_state.config.history_cap;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("History bridge received shutdown signal.");
                break;
            }
            _ = refresh.tick() => {
                match store.range_read(limit).await {
                    Ok(batch) => {
                        if !batch.is_empty() {
                            log::debug!("Merging {} persisted sample(s) into the window", batch.len());
                            app_state.merge_persisted(batch);
                        }
                    }
                    Err(e) => log::warn!("Persisted history refresh failed: {}", e),
                }
            }
            sample = data_rx.recv() => {
                match sample {
                    Ok(sample) => {
                        if let Err(e) = store.append(&sample).await {
                            log::warn!("Failed to persist sample: {}", e);
                        }
                        let count = app_state.dispatcher().record_count();
                        if let Err(e) = store.write_status(count).await {
                            log::warn!("Failed to update status record: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("History bridge lagged; {} sample(s) not persisted", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plc_logic::config::{resolve, ConfigOverlay};
    use lib_common::MemorySampleStore;
    use std::sync::Arc;
    use tokio::time::{sleep, timeout};

    fn fast_config() -> crate::plc_logic::config::Config {
        resolve(ConfigOverlay {
            history_refresh_seconds: Some(1),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn live_samples_are_persisted_and_history_is_merged_back() {
        let (app_state, _frames) = AppState::new(fast_config());
        let store = Arc::new(MemorySampleStore::new());

        // Pre-seed the store so the initial refresh has something to merge.
        let seeded = lib_common::TelemetrySample::live(0x6304, lib_common::SampleValue::Bool(true));
        store.append(&seeded).await.unwrap();

        let (shutdown_tx, _) = broadcast::channel(1);
        let bridge = tokio::spawn(run(
            Arc::clone(&store),
            app_state.clone(),
            shutdown_tx.subscribe(),
        ));

        // The immediate first tick merges the seeded sample as persisted.
        timeout(Duration::from_secs(2), async {
            loop {
                if !app_state.history().is_empty() {
                    break;
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("initial merge never happened");

        // A live sample flowing through the dispatcher lands in the store.
        app_state.dispatcher().dispatch(r#"{"data":[1],"recordCount":5}"#);
        timeout(Duration::from_secs(2), async {
            loop {
                if store.len() == 2 {
                    break;
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("live sample never persisted");
        assert_eq!(store.last_record_count(), Some(5));

        let _ = shutdown_tx.send(());
        let _ = bridge.await;
    }
}
