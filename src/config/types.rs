//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub tls: TlsConfig,
    pub accounting: AccountingConfig,
    pub monitoring: MonitoringConfig,
}

/// Server-level configuration: the two listeners and the timing knobs
/// from spec.md §3 ("Configuration").
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// TLS endpoint relays connect to.
    pub listen_addr: SocketAddr,
    /// UNIX domain socket the SIP proxy connects to.
    pub control_socket_path: PathBuf,
    /// Per-command reply deadline.
    #[serde(with = "humantime_serde")]
    pub relay_timeout: Duration,
    /// Grace period sessions of a disconnected relay are preserved.
    #[serde(with = "humantime_serde")]
    pub cleanup_timeout: Duration,
    /// Upper bound the dispatcher waits on each shutdown phase.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Mutual-TLS credential paths (spec.md §3: `tls_cert`, `tls_key`, `tls_ca`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
}

/// Accounting backend selection (spec.md §3: `accounting`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountingConfig {
    /// Names of backends to instantiate, in configured order.
    pub backends: Vec<String>,
    /// Output path for the `file` backend, if configured.
    pub file_path: Option<PathBuf>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub metrics_addr: Option<SocketAddr>,
    /// Whether to hot-watch the config file for `relay_timeout`,
    /// `cleanup_timeout`, and `accounting` changes.
    pub config_reload: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "0.0.0.0:25060".parse().unwrap(),
                control_socket_path: PathBuf::from("/var/run/mediaproxy/dispatcher.sock"),
                relay_timeout: Duration::from_secs(5),
                cleanup_timeout: Duration::from_secs(3600),
                shutdown_timeout: Duration::from_secs(30),
            },
            tls: TlsConfig {
                cert: None,
                key: None,
                ca: None,
            },
            accounting: AccountingConfig {
                backends: vec!["log".to_string()],
                file_path: None,
            },
            monitoring: MonitoringConfig {
                log_level: "info".to_string(),
                metrics_addr: Some("127.0.0.1:9100".parse().unwrap()),
                config_reload: true,
            },
        }
    }
}
