//! Accounting sink interface
//!
//! Each configured backend is started at process startup and receives
//! every session-termination statistics object, in configured order. A
//! sink that fails must not prevent the others from receiving the event.

pub mod fanout;
pub mod sink;

pub use fanout::AccountingFanout;
pub use sink::{AccountingSink, FileSink, LogSink};

use crate::config::AccountingConfig;
use crate::Result;
use anyhow::bail;

/// Instantiate the configured backends, in the order listed.
///
/// Unknown names are a fatal configuration error at startup — the Rust
/// analogue of the dynamic `__import__`-by-name lookup this replaces.
pub fn build_sinks(config: &AccountingConfig) -> Result<Vec<Box<dyn AccountingSink>>> {
    let mut sinks: Vec<Box<dyn AccountingSink>> = Vec::new();
    for name in &config.backends {
        let sink: Box<dyn AccountingSink> = match name.as_str() {
            "log" => Box::new(LogSink::new()),
            "file" => {
                let path = config
                    .file_path
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("accounting backend 'file' requires accounting.file_path"))?;
                Box::new(FileSink::new(path))
            }
            other => bail!("unknown accounting backend '{}'", other),
        };
        sinks.push(sink);
    }
    Ok(sinks)
}
