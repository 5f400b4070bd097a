//! Relay-facing error taxonomy
//!
//! Every variant corresponds to one row of the error table: each is
//! either retried against the next candidate relay during initial
//! selection, or surfaced straight to the proxy as the literal `error`
//! token. See `RelayPool::dispatch_update` and `RelayPool::dispatch`.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("timeout")]
    Timeout,
    #[error("error from relay")]
    ErrorReply,
    #[error("relay halting")]
    Halting,
    #[error("disconnected")]
    Disconnected,
    #[error("relay gone")]
    RelayGone,
    #[error("missing call_id")]
    MissingCallId,
    #[error("no relay available")]
    NoRelayAvailable,
    #[error("unknown session")]
    UnknownSession,
}

impl RelayError {
    /// The single token every proxy-facing error collapses to on the wire.
    pub const WIRE_TOKEN: &'static str = "error";
}
