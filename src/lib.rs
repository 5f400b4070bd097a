//! Mediaproxy Dispatcher Library
//!
//! Dispatching engine for a media-relay cluster: multiplexes SIP proxy
//! control requests over a pool of mutually-authenticated relay
//! connections, maintains call-id affinity, and fans session-termination
//! statistics out to accounting backends.

pub mod accounting;
pub mod config;
pub mod control;
pub mod dispatcher;
pub mod metrics;
pub mod protocol;
pub mod relay;
pub mod shutdown;
pub mod tls;

pub use config::Config;
pub use dispatcher::Dispatcher;
pub use shutdown::ShutdownCoordinator;

/// Common error type for the dispatcher
pub type Result<T> = anyhow::Result<T>;
