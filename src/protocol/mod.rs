//! Line Protocol
//!
//! CRLF-delimited text framing shared by the proxy control socket and the
//! relay TLS channel. Both sides are decoded by hand over a buffered
//! reader rather than through a generic line codec, so that a line ending
//! in `": "` can be recognised and dropped instead of treated as a header.

pub mod frame;
pub mod io;

pub use frame::RequestFrame;
pub use io::{read_request_frame, relay_command_frame, parse_relay_line, RelayLine};
