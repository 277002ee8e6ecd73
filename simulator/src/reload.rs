//! Polls the configuration file and forwards every changed, valid
//! configuration to the driver.

use crate::config::RunConfiguration;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub async fn watch_config(
    path: PathBuf,
    every: Duration,
    mut current: RunConfiguration,
    tx: mpsc::Sender<RunConfiguration>,
    scope: CancellationToken,
) {
    info!(
        "Watching {} for changes every {:?}",
        path.display(),
        every
    );

    let mut last_modified = modified(&path).await;
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = scope.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let stamp = modified(&path).await;
        if stamp == last_modified {
            continue;
        }
        last_modified = stamp;

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                error!("Failed to read {}: {}", path.display(), e);
                continue;
            }
        };

        match RunConfiguration::from_toml_str(&content) {
            Ok(config) if config == current => {
                debug!("{} touched but unchanged", path.display());
            }
            Ok(config) => {
                info!("====================================");
                info!("{} changed", path.display());
                info!("====================================");
                current = config.clone();
                if tx.send(config).await.is_err() {
                    debug!("Reload receiver gone, stopping watcher");
                    break;
                }
            }
            Err(e) => {
                error!(
                    "Ignoring invalid configuration in {}: {}",
                    path.display(),
                    e
                );
            }
        }
    }
}

async fn modified(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .ok()
}
