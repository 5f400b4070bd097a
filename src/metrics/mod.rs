//! Metrics Module
//!
//! Prometheus counters/gauges for relay and session activity, exported
//! over a small hand-rolled HTTP scrape endpoint.

pub mod collector;
pub mod server;

pub use collector::Metrics;
pub use server::MetricsServer;
