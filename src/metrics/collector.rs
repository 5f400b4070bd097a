//! Metrics Collector

use prometheus::{Counter, Gauge, IntCounter, Registry, TextEncoder};
use tracing::debug;

/// Collects and exports Prometheus metrics for the dispatcher.
pub struct Metrics {
    registry: Registry,

    relays_connected: Gauge,
    sessions_active: Gauge,
    commands_total: Counter,
    command_timeouts_total: Counter,
    command_errors_total: IntCounter,
}

impl Metrics {
    /// Create a new metrics collector with all gauges/counters registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let relays_connected = Gauge::new(
            "dispatcher_relays_connected",
            "Number of relay nodes currently connected",
        )
        .expect("Failed to create dispatcher_relays_connected gauge");

        let sessions_active = Gauge::new(
            "dispatcher_sessions_active",
            "Number of call sessions with an active relay binding",
        )
        .expect("Failed to create dispatcher_sessions_active gauge");

        let commands_total = Counter::new(
            "dispatcher_commands_total",
            "Total number of commands dispatched to relays",
        )
        .expect("Failed to create dispatcher_commands_total counter");

        let command_timeouts_total = Counter::new(
            "dispatcher_command_timeouts_total",
            "Total number of commands that timed out waiting for a relay reply",
        )
        .expect("Failed to create dispatcher_command_timeouts_total counter");

        let command_errors_total = IntCounter::new(
            "dispatcher_command_errors_total",
            "Total number of commands that failed for any reason",
        )
        .expect("Failed to create dispatcher_command_errors_total counter");

        registry
            .register(Box::new(relays_connected.clone()))
            .expect("Failed to register dispatcher_relays_connected");
        registry
            .register(Box::new(sessions_active.clone()))
            .expect("Failed to register dispatcher_sessions_active");
        registry
            .register(Box::new(commands_total.clone()))
            .expect("Failed to register dispatcher_commands_total");
        registry
            .register(Box::new(command_timeouts_total.clone()))
            .expect("Failed to register dispatcher_command_timeouts_total");
        registry
            .register(Box::new(command_errors_total.clone()))
            .expect("Failed to register dispatcher_command_errors_total");

        Self {
            registry,
            relays_connected,
            sessions_active,
            commands_total,
            command_timeouts_total,
            command_errors_total,
        }
    }

    pub fn relay_connected(&self) {
        self.relays_connected.inc();
    }

    pub fn relay_disconnected(&self) {
        self.relays_connected.dec();
    }

    pub fn session_bound(&self) {
        self.sessions_active.inc();
    }

    pub fn session_released(&self) {
        self.sessions_active.dec();
    }

    pub fn command_issued(&self) {
        self.commands_total.inc();
    }

    pub fn command_timed_out(&self) {
        self.command_timeouts_total.inc();
    }

    pub fn command_failed(&self) {
        self.command_errors_total.inc();
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = String::new();
        if let Err(e) = encoder.encode_utf8(&metric_families, &mut buffer) {
            debug!(error = %e, "Failed to encode Prometheus metrics");
        }
        buffer
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_includes_registered_metrics() {
        let metrics = Metrics::new();
        metrics.relay_connected();
        metrics.command_issued();
        let exported = metrics.export_prometheus();
        assert!(exported.contains("dispatcher_relays_connected"));
        assert!(exported.contains("dispatcher_commands_total"));
    }
}
