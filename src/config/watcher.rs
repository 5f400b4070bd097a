//! Configuration File Watcher
//!
//! Hot-reloads the dispatcher's own policy knobs — `relay_timeout`,
//! `cleanup_timeout`, and `accounting` — while leaving TLS material and
//! listen addresses fixed at startup (see `monitoring.config_reload`).

use super::{Config, ConfigManager};
use crate::Result;
use anyhow::{bail, Context};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{debug, error, info, warn};

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChangeEvent {
    pub config: Arc<Config>,
    pub timestamp: std::time::SystemTime,
    pub file_path: PathBuf,
}

/// Configuration file watcher
pub struct ConfigWatcher {
    config_path: PathBuf,
    current_config: Arc<RwLock<Config>>,
    change_sender: broadcast::Sender<ConfigChangeEvent>,
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Create a new configuration watcher
    pub fn new(config_path: PathBuf) -> Result<Self> {
        let (change_sender, _) = broadcast::channel(100);

        let initial_config = ConfigManager::load_from_file(&config_path)?;
        let current_config = Arc::new(RwLock::new(initial_config));

        let sender_clone = change_sender.clone();
        let config_clone = current_config.clone();
        let path_clone = config_path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if let Err(e) =
                        Self::handle_file_event(event, &path_clone, &config_clone, &sender_clone)
                    {
                        error!("Error handling file event: {}", e);
                    }
                }
                Err(e) => error!("File watcher error: {}", e),
            },
            NotifyConfig::default(),
        )
        .context("Failed to create file watcher")?;

        // Watch the config file's directory rather than the file itself
        // (watching the file directly misses editors that write via rename).
        if let Some(parent_dir) = config_path.parent() {
            watcher
                .watch(parent_dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("Failed to watch directory: {}", parent_dir.display()))?;

            info!(
                "Started watching configuration directory: {}",
                parent_dir.display()
            );
        } else {
            bail!(
                "Configuration file has no parent directory: {}",
                config_path.display()
            );
        }

        Ok(Self {
            config_path,
            current_config,
            change_sender,
            _watcher: watcher,
        })
    }

    /// Get the current configuration
    pub async fn get_config(&self) -> Arc<Config> {
        let config = self.current_config.read().await;
        Arc::new(config.clone())
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> BroadcastStream<ConfigChangeEvent> {
        BroadcastStream::new(self.change_sender.subscribe())
    }

    /// Force reload the configuration
    pub async fn reload(&self) -> Result<()> {
        info!(
            "Force reloading configuration from: {}",
            self.config_path.display()
        );

        let new_config = ConfigManager::load_from_file(&self.config_path)?;
        let config_arc = Arc::new(new_config);

        {
            let mut current = self.current_config.write().await;
            *current = (*config_arc).clone();
        }

        let event = ConfigChangeEvent {
            config: config_arc,
            timestamp: std::time::SystemTime::now(),
            file_path: self.config_path.clone(),
        };

        if let Err(e) = self.change_sender.send(event) {
            warn!("No subscribers for config change event: {}", e);
        }

        info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Handle file system events
    fn handle_file_event(
        event: Event,
        config_path: &Path,
        current_config: &Arc<RwLock<Config>>,
        sender: &broadcast::Sender<ConfigChangeEvent>,
    ) -> Result<()> {
        debug!("File event: {:?}", event);

        let affects_config = event
            .paths
            .iter()
            .any(|path| path.file_name() == config_path.file_name());

        if !affects_config {
            return Ok(());
        }

        match event.kind {
            EventKind::Modify(_) | EventKind::Create(_) => {
                info!("Configuration file changed, reloading...");

                // Give the writer a moment to finish before we read.
                std::thread::sleep(std::time::Duration::from_millis(100));

                match ConfigManager::load_from_file(config_path) {
                    Ok(new_config) => {
                        let config_arc = Arc::new(new_config);

                        tokio::task::block_in_place(|| {
                            tokio::runtime::Handle::current().block_on(async {
                                let mut current = current_config.write().await;
                                *current = (*config_arc).clone();
                            })
                        });

                        let event = ConfigChangeEvent {
                            config: config_arc,
                            timestamp: std::time::SystemTime::now(),
                            file_path: config_path.to_path_buf(),
                        };

                        if let Err(e) = sender.send(event) {
                            warn!("No subscribers for config change event: {}", e);
                        }

                        info!("Configuration reloaded successfully");
                    }
                    Err(e) => {
                        error!(
                            "Failed to reload configuration, keeping current config: {}",
                            e
                        );
                    }
                }
            }
            EventKind::Remove(_) => {
                warn!("Configuration file was removed: {}", config_path.display());
            }
            _ => {
                debug!("Ignoring file event type: {:?}", event.kind);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use tokio::time::{sleep, Duration};

    fn sample_config(relay_timeout: &str, cert_dir: &Path) -> String {
        format!(
            r#"
[server]
listen_addr = "0.0.0.0:25060"
control_socket_path = "/tmp/dispatcher.sock"
relay_timeout = "{relay_timeout}"
cleanup_timeout = "1h"
shutdown_timeout = "30s"

[tls]
cert = "{cert}"
key = "{key}"
ca = "{ca}"

[accounting]
backends = ["log"]

[monitoring]
log_level = "info"
config_reload = true
"#,
            relay_timeout = relay_timeout,
            cert = cert_dir.join("cert.pem").display(),
            key = cert_dir.join("key.pem").display(),
            ca = cert_dir.join("ca.pem").display(),
        )
    }

    fn touch_fake_pem(dir: &Path) {
        fs::write(dir.join("cert.pem"), "x").unwrap();
        fs::write(dir.join("key.pem"), "x").unwrap();
        fs::write(dir.join("ca.pem"), "x").unwrap();
    }

    #[tokio::test]
    async fn test_config_watcher_creation() {
        let temp_dir = TempDir::new().unwrap();
        touch_fake_pem(temp_dir.path());
        let config_path = temp_dir.path().join("test_config.toml");
        fs::write(&config_path, sample_config("5s", temp_dir.path())).unwrap();

        let watcher = ConfigWatcher::new(config_path.clone()).unwrap();

        let config = watcher.get_config().await;
        assert_eq!(config.server.listen_addr.port(), 25060);
        assert_eq!(config.server.relay_timeout.as_secs(), 5);
    }

    #[tokio::test]
    async fn test_config_hot_reload() {
        let temp_dir = TempDir::new().unwrap();
        touch_fake_pem(temp_dir.path());
        let config_path = temp_dir.path().join("test_config.toml");
        let initial = sample_config("5s", temp_dir.path());
        fs::write(&config_path, &initial).unwrap();

        let watcher = ConfigWatcher::new(config_path.clone()).unwrap();
        let mut change_stream = watcher.subscribe();

        let config = watcher.get_config().await;
        assert_eq!(config.server.relay_timeout.as_secs(), 5);

        let updated = initial.replace("relay_timeout = \"5s\"", "relay_timeout = \"10s\"");
        fs::write(&config_path, updated).unwrap();

        tokio::select! {
            change_event = change_stream.next() => {
                let event = change_event.unwrap().unwrap();
                assert_eq!(event.config.server.relay_timeout.as_secs(), 10);
            }
            _ = sleep(Duration::from_secs(5)) => {
                panic!("Config change event not received within timeout");
            }
        }

        let updated_config = watcher.get_config().await;
        assert_eq!(updated_config.server.relay_timeout.as_secs(), 10);
    }

    #[tokio::test]
    async fn test_invalid_config_handling() {
        let temp_dir = TempDir::new().unwrap();
        touch_fake_pem(temp_dir.path());
        let config_path = temp_dir.path().join("test_config.toml");
        fs::write(&config_path, sample_config("5s", temp_dir.path())).unwrap();

        let watcher = ConfigWatcher::new(config_path.clone()).unwrap();
        let mut change_stream = watcher.subscribe();

        let config = watcher.get_config().await;
        assert_eq!(config.server.relay_timeout.as_secs(), 5);

        fs::write(&config_path, "invalid toml content [[[").unwrap();
        sleep(Duration::from_millis(500)).await;

        let config_after_invalid = watcher.get_config().await;
        assert_eq!(config_after_invalid.server.relay_timeout.as_secs(), 5);

        tokio::select! {
            _ = change_stream.next() => {
                panic!("Change event should not be emitted for invalid config");
            }
            _ = sleep(Duration::from_millis(200)) => {}
        }
    }
}
