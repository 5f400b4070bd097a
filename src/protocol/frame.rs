//! Frame types for the proxy control protocol.

/// A parsed request frame: a command name followed by `name: value` headers.
#[derive(Debug, Clone)]
pub struct RequestFrame {
    pub command: String,
    pub headers: Vec<String>,
}

impl RequestFrame {
    /// Find the value of a `name: value` header, scanning in order.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        let prefix = format!("{}: ", name);
        self.headers
            .iter()
            .find_map(|h| h.strip_prefix(prefix.as_str()))
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header_value("call_id")
    }

    pub fn media_relay(&self) -> Option<&str> {
        self.header_value("media_relay")
    }
}
