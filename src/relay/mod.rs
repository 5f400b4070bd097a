//! Relay-facing connection management
//!
//! One `RelayConnection` per connected relay node, and a `RelayPool` that
//! maintains the relay set and the call-id→relay affinity table, selects
//! relays for new sessions with preference and randomized failover, and
//! schedules cleanup of sessions whose relay disconnected.

pub mod connection;
pub mod error;
pub mod pool;

pub use connection::{RelayConnection, SharedTimeout};
pub use error::RelayError;
pub use pool::{run_relay_read_loop, RelayPool};
