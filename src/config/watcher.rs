//! Configuration file watcher for hot-reload support

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::AppConfig;

/// Debounce between the filesystem event and the reload attempt, giving the
/// editor time to finish flushing the new contents to disk.
const RELOAD_SETTLE: Duration = Duration::from_millis(100);

/// Config watcher that monitors file changes and fans reloaded snapshots out
/// to every subscribed component.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    tx: broadcast::Sender<Arc<AppConfig>>,
}

impl ConfigWatcher {
    /// Create a new config watcher for the specified file
    pub async fn new(config_path: String) -> Result<(Self, Arc<AppConfig>)> {
        let (tx, _) = broadcast::channel(16);

        // Load initial config
        let initial_config = AppConfig::load(&config_path)
            .await
            .context("Failed to load initial config")?;
        let initial_config = Arc::new(initial_config);

        let config_path_clone = config_path.clone();
        let reload_tx = tx.clone();

        // Capture the Tokio runtime handle BEFORE creating the watcher
        // (notify callbacks run on their own OS thread, not in Tokio context)
        let runtime_handle = tokio::runtime::Handle::current();

        // Create file watcher
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    // Only reload on modify events
                    if matches!(event.kind, EventKind::Modify(_)) {
                        debug!("Config file modified: {:?}", event.paths);

                        let config_path = config_path_clone.clone();
                        let tx = reload_tx.clone();

                        // Use the captured runtime handle to spawn async task
                        runtime_handle.spawn(async move {
                            tokio::time::sleep(RELOAD_SETTLE).await;

                            match AppConfig::load(&config_path).await {
                                Ok(new_config) => {
                                    info!("Configuration reloaded successfully");
                                    // Fails only when nobody is subscribed.
                                    let _ = tx.send(Arc::new(new_config));
                                }
                                Err(e) => {
                                    warn!("Failed to reload config (keeping old config): {}", e);
                                }
                            }
                        });
                    }
                }
                Err(e) => {
                    error!("Watch error: {}", e);
                }
            }
        })?;

        // Watch the config file
        watcher
            .watch(Path::new(&config_path), RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch config file: {}", config_path))?;

        info!("Config file watcher started for: {}", config_path);

        Ok((
            Self {
                _watcher: watcher,
                tx,
            },
            initial_config,
        ))
    }

    /// A new receiver for reloaded config snapshots.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<AppConfig>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_config_watcher_basic() -> Result<()> {
        // Create a temporary config file
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("test-config.yaml");

        let initial_config = r#"
com_port: "/dev/ttyACM0"
baud_rate: 9600
"#;

        fs::write(&config_path, initial_config)?;

        // Create watcher
        let (watcher, config) =
            ConfigWatcher::new(config_path.to_string_lossy().to_string()).await?;
        let mut reloads = watcher.subscribe();

        assert_eq!(config.com_port, "/dev/ttyACM0");
        assert_eq!(config.baud_rate, 9600);

        // Modify the config file
        let modified_config = r#"
com_port: "/dev/ttyACM1"
baud_rate: 115200
"#;

        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(&config_path, modified_config)?;

        // Wait for reload (with timeout)
        let new_config = tokio::time::timeout(Duration::from_secs(2), reloads.recv()).await;

        if let Ok(Ok(new_config)) = new_config {
            assert_eq!(new_config.com_port, "/dev/ttyACM1");
            assert_eq!(new_config.baud_rate, 115200);
        }

        Ok(())
    }
}
