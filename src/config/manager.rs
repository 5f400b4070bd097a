//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::Path;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file, falling back to defaults if it does not exist.
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables, overlaid on defaults.
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(listen_addr) = std::env::var("DISPATCHER_LISTEN_ADDR") {
            config.server.listen_addr = listen_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid DISPATCHER_LISTEN_ADDR: {}", listen_addr))?;
        }

        if let Ok(socket_path) = std::env::var("DISPATCHER_CONTROL_SOCKET") {
            config.server.control_socket_path = socket_path.into();
        }

        if let Ok(relay_timeout) = std::env::var("DISPATCHER_RELAY_TIMEOUT") {
            config.server.relay_timeout = humantime::parse_duration(&relay_timeout)
                .with_context(|| format!("Invalid DISPATCHER_RELAY_TIMEOUT: {}", relay_timeout))?;
        }

        if let Ok(cleanup_timeout) = std::env::var("DISPATCHER_CLEANUP_TIMEOUT") {
            config.server.cleanup_timeout = humantime::parse_duration(&cleanup_timeout)
                .with_context(|| {
                    format!("Invalid DISPATCHER_CLEANUP_TIMEOUT: {}", cleanup_timeout)
                })?;
        }

        if let Ok(log_level) = std::env::var("DISPATCHER_LOG_LEVEL") {
            config.monitoring.log_level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration, failing fast on anything that would
    /// make the dispatcher unable to start.
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_tls_config()
            .with_context(|| "TLS configuration validation failed")?;

        self.validate_accounting_config()
            .with_context(|| "Accounting configuration validation failed")?;

        self.validate_monitoring_config()
            .with_context(|| "Monitoring configuration validation failed")?;

        Ok(())
    }

    /// Validate server configuration
    fn validate_server_config(&self) -> Result<()> {
        if self.server.relay_timeout.as_millis() == 0 {
            bail!("server.relay_timeout must be greater than 0");
        }

        if self.server.cleanup_timeout.as_millis() == 0 {
            bail!("server.cleanup_timeout must be greater than 0");
        }

        if self.server.shutdown_timeout.as_millis() == 0 {
            bail!("server.shutdown_timeout must be greater than 0");
        }

        if self.server.control_socket_path.as_os_str().is_empty() {
            bail!("server.control_socket_path must not be empty");
        }

        Ok(())
    }

    /// Validate TLS configuration. Mutual TLS is mandatory for the relay
    /// listener, so missing credentials are fatal at startup.
    fn validate_tls_config(&self) -> Result<()> {
        if self.tls.cert.is_none() || self.tls.key.is_none() || self.tls.ca.is_none() {
            bail!(
                "tls.cert, tls.key, and tls.ca must all be set: mutual TLS is mandatory for the relay listener"
            );
        }

        for (name, path) in [
            ("tls.cert", &self.tls.cert),
            ("tls.key", &self.tls.key),
            ("tls.ca", &self.tls.ca),
        ] {
            if let Some(path) = path {
                if !path.exists() {
                    bail!("{} points to a nonexistent file: {}", name, path.display());
                }
            }
        }

        Ok(())
    }

    /// Validate accounting configuration
    fn validate_accounting_config(&self) -> Result<()> {
        const KNOWN: &[&str] = &["log", "file"];

        if self.accounting.backends.is_empty() {
            bail!("accounting.backends must name at least one backend");
        }

        for name in &self.accounting.backends {
            if !KNOWN.contains(&name.as_str()) {
                bail!(
                    "unknown accounting backend '{}' (known backends: {:?})",
                    name,
                    KNOWN
                );
            }

            if name == "file" && self.accounting.file_path.is_none() {
                bail!("accounting backend 'file' requires accounting.file_path to be set");
            }
        }

        Ok(())
    }

    /// Validate monitoring configuration
    fn validate_monitoring_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.monitoring.log_level.as_str()) {
            bail!(
                "monitoring.log_level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments, which take the highest priority.
    pub fn merge_with_cli_args(
        &mut self,
        listen_addr: Option<&str>,
        control_socket: Option<&str>,
        relay_timeout_secs: Option<u64>,
        cleanup_timeout_secs: Option<u64>,
        log_level: Option<&str>,
    ) {
        if let Some(addr_str) = listen_addr {
            match addr_str.parse::<SocketAddr>() {
                Ok(addr) => {
                    self.server.listen_addr = addr;
                    tracing::info!("CLI override: listen address set to {}", addr);
                }
                Err(e) => tracing::warn!("Invalid --listen-addr {}: {}", addr_str, e),
            }
        }

        if let Some(path) = control_socket {
            self.server.control_socket_path = path.into();
            tracing::info!("CLI override: control socket set to {}", path);
        }

        if let Some(secs) = relay_timeout_secs {
            self.server.relay_timeout = std::time::Duration::from_secs(secs);
            tracing::info!("CLI override: relay timeout set to {}s", secs);
        }

        if let Some(secs) = cleanup_timeout_secs {
            self.server.cleanup_timeout = std::time::Duration::from_secs(secs);
            tracing::info!("CLI override: cleanup timeout set to {}s", secs);
        }

        if let Some(level) = log_level {
            self.monitoring.log_level = level.to_string();
            tracing::info!("CLI override: log level set to {}", level);
        }
    }
}
