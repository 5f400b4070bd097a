//! Top-level process: binds both listeners, owns the long-lived
//! components, and drives the shutdown sequence.

use crate::accounting::{build_sinks, AccountingFanout};
use crate::config::{Config, ConfigWatcher};
use crate::metrics::{Metrics, MetricsServer};
use crate::relay::{run_relay_read_loop, RelayConnection, RelayPool, SharedTimeout};
use crate::shutdown::{ShutdownAwareTask, ShutdownCoordinator};
use crate::{tls, Result};
use anyhow::Context;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

/// Owns every long-lived component: the two listeners, the relay pool,
/// accounting, metrics, and the shutdown coordinator.
pub struct Dispatcher {
    config: Config,
    pool: Arc<RelayPool>,
    accounting: Arc<AccountingFanout>,
    metrics: Arc<Metrics>,
    shutdown: ShutdownCoordinator,
    config_watcher: Option<ConfigWatcher>,
}

impl Dispatcher {
    pub fn new(config: Config) -> Result<Self> {
        let metrics = Arc::new(Metrics::new());
        let sinks = build_sinks(&config.accounting)?;
        let accounting = Arc::new(AccountingFanout::new(sinks));
        let pool = RelayPool::new(
            config.server.cleanup_timeout,
            config.server.relay_timeout,
            metrics.clone(),
            accounting.clone(),
        );
        let shutdown = ShutdownCoordinator::new(config.server.shutdown_timeout);

        Ok(Self {
            config,
            pool,
            accounting,
            metrics,
            shutdown,
            config_watcher: None,
        })
    }

    /// Attach a config watcher so `relay_timeout`/`cleanup_timeout`/
    /// `accounting` changes apply without a restart. No-op unless
    /// `monitoring.config_reload` is set.
    pub fn with_config_watcher(mut self, watcher: ConfigWatcher) -> Self {
        self.config_watcher = Some(watcher);
        self
    }

    /// Run until a shutdown signal arrives, then drain in the order
    /// described in the module doc: stop listeners, drain control
    /// connections, drain relays, stop accounting, exit.
    pub async fn run(mut self) -> Result<()> {
        self.accounting.start().await?;

        let acceptor = tls::build_acceptor(&self.config.tls)?;
        let relay_listener = TcpListener::bind(self.config.server.listen_addr)
            .await
            .with_context(|| format!("failed to bind relay listener on {}", self.config.server.listen_addr))?;
        info!(addr = %self.config.server.listen_addr, "relay listener bound");

        let control_path = self.config.server.control_socket_path.clone();
        if control_path.exists() {
            std::fs::remove_file(&control_path)
                .with_context(|| format!("failed to remove stale control socket {}", control_path.display()))?;
        }
        let control_listener = UnixListener::bind(&control_path)
            .with_context(|| format!("failed to bind control socket {}", control_path.display()))?;
        info!(path = %control_path.display(), "control socket bound");

        if let Some(metrics_addr) = self.config.monitoring.metrics_addr {
            let metrics_server = MetricsServer::new(self.metrics.clone(), metrics_addr.to_string());
            tokio::spawn(async move {
                if let Err(e) = metrics_server.start().await {
                    error!(error = %e, "metrics server exited");
                }
            });
        }

        if let Some(watcher) = self.config_watcher.take() {
            tokio::spawn(watch_config(watcher, self.pool.clone()));
        }

        let active_control_conns = Arc::new(AtomicUsize::new(0));

        let pool_for_relay = self.pool.clone();
        let relay_timeout = self.pool.relay_timeout_handle();
        let relay_task = ShutdownAwareTask::spawn(&self.shutdown, "relay_listener", move |shutdown_rx| {
            accept_relays(relay_listener, acceptor, pool_for_relay, relay_timeout, shutdown_rx)
        });

        let pool_for_control = self.pool.clone();
        let shutdown_tx = self.shutdown.sender();
        let active_for_control = active_control_conns.clone();
        let control_task = ShutdownAwareTask::spawn(&self.shutdown, "control_listener", move |_shutdown_rx| {
            accept_control(control_listener, pool_for_control, shutdown_tx, active_for_control)
        });

        self.shutdown.listen_for_signals().await?;

        info!("shutdown initiated: stopping listeners");
        relay_task.wait_for_completion_or_shutdown().await?;
        control_task.wait_for_completion_or_shutdown().await?;

        info!("shutdown: draining control connections");
        let drain_deadline = tokio::time::Instant::now() + self.config.server.shutdown_timeout;
        while active_control_conns.load(Ordering::Acquire) > 0 && tokio::time::Instant::now() < drain_deadline {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        if active_control_conns.load(Ordering::Acquire) > 0 {
            warn!("control connections still open after shutdown_timeout, proceeding anyway");
        }

        info!("shutdown: draining relay connections");
        self.pool.shutdown(self.config.server.shutdown_timeout).await;

        info!("shutdown: stopping accounting sinks");
        self.accounting.stop().await;

        self.shutdown.mark_complete();
        info!("shutdown complete");
        Ok(())
    }
}

/// Apply config changes this process can adopt live, per
/// `monitoring.config_reload`: relay/cleanup timeouts and the accounting
/// backend set. TLS material and listen addresses stay fixed until
/// restart.
async fn watch_config(watcher: ConfigWatcher, pool: Arc<RelayPool>) {
    let mut changes = watcher.subscribe();
    while let Some(result) = changes.next().await {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "config change stream lagged or errored");
                continue;
            }
        };

        pool.set_cleanup_timeout(event.config.server.cleanup_timeout).await;
        pool.set_relay_timeout(event.config.server.relay_timeout);

        match build_sinks(&event.config.accounting) {
            Ok(sinks) => {
                let fanout = Arc::new(AccountingFanout::new(sinks));
                if let Err(e) = fanout.start().await {
                    error!(error = %e, "failed to start reloaded accounting backends, keeping previous set");
                    continue;
                }
                pool.set_accounting(fanout).await;
            }
            Err(e) => {
                error!(error = %e, "reloaded accounting config is invalid, keeping previous set");
            }
        }

        info!(file = %event.file_path.display(), "configuration reloaded");
    }
}

/// Accept loop for relay nodes: complete the mTLS handshake, register
/// with the pool, and spawn its read loop.
async fn accept_relays(
    listener: TcpListener,
    acceptor: tokio_rustls::TlsAcceptor,
    pool: Arc<RelayPool>,
    relay_timeout: SharedTimeout,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "failed to accept relay connection");
                        continue;
                    }
                };

                let acceptor = acceptor.clone();
                let pool = pool.clone();
                let relay_timeout = relay_timeout.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!(relay_ip = %peer_addr.ip(), error = %e, "TLS handshake failed");
                            return;
                        }
                    };

                    let ip = peer_addr.ip().to_string();
                    let (read_half, write_half) = tokio::io::split(tls_stream);
                    let relay = Arc::new(RelayConnection::new(ip.clone(), Box::new(write_half), relay_timeout));

                    if let Err(e) = pool.relay_connected(ip.clone(), relay.clone()).await {
                        warn!(relay_ip = %ip, error = %e, "rejected relay connection");
                        return;
                    }

                    let reader = tokio::io::BufReader::new(read_half);
                    run_relay_read_loop(pool, ip, relay, reader).await;
                });
            }
            _ = shutdown_rx.recv() => {
                debug!("relay listener stopping");
                break;
            }
        }
    }
}

/// Accept loop for the control socket: one task per proxy connection.
async fn accept_control(
    listener: UnixListener,
    pool: Arc<RelayPool>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
    active: Arc<AtomicUsize>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "failed to accept control connection");
                        continue;
                    }
                };

                let pool = pool.clone();
                let conn_shutdown_rx = shutdown_tx.subscribe();
                let active = active.clone();
                active.fetch_add(1, Ordering::AcqRel);
                tokio::spawn(async move {
                    crate::control::run(pool, stream, conn_shutdown_rx).await;
                    active.fetch_sub(1, Ordering::AcqRel);
                });
            }
            _ = shutdown_rx.recv() => {
                debug!("control listener stopping");
                break;
            }
        }
    }
}
