//! Accounting sink trait and the two backends shipped in-tree.

use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// A consumer of session-termination statistics.
///
/// `stats` is the parsed JSON payload carried by an `expired` notification
/// or a `remove` reply; it is guaranteed to contain `call_id` but is
/// otherwise opaque to the dispatcher.
#[async_trait]
pub trait AccountingSink: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn do_accounting(&self, stats: &Value) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

/// Always-available sink that logs every statistics event.
pub struct LogSink;

impl LogSink {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccountingSink for LogSink {
    async fn start(&self) -> Result<()> {
        tracing::info!("log accounting sink started");
        Ok(())
    }

    async fn do_accounting(&self, stats: &Value) -> Result<()> {
        tracing::info!(stats = %stats, "session statistics");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        tracing::info!("log accounting sink stopped");
        Ok(())
    }
}

/// Appends each statistics event as a newline-delimited JSON object.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: Mutex::new(None),
        }
    }
}

#[async_trait]
impl AccountingSink for FileSink {
    async fn start(&self) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        *self.file.lock().await = Some(file);
        tracing::info!(path = %self.path.display(), "file accounting sink started");
        Ok(())
    }

    async fn do_accounting(&self, stats: &Value) -> Result<()> {
        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("file accounting sink used before start()"))?;
        let mut line = serde_json::to_string(stats)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush().await?;
        }
        tracing::info!(path = %self.path.display(), "file accounting sink stopped");
        Ok(())
    }
}

/// Helper for tests/tools that want an `Arc`-shared sink handle.
pub type SharedSink = Arc<dyn AccountingSink>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn log_sink_accepts_events() {
        let sink = LogSink::new();
        sink.start().await.unwrap();
        sink.do_accounting(&json!({"call_id": "abc"}))
            .await
            .unwrap();
        sink.stop().await.unwrap();
    }

    #[tokio::test]
    async fn file_sink_appends_json_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("accounting.jsonl");
        let sink = FileSink::new(path.clone());
        sink.start().await.unwrap();
        sink.do_accounting(&json!({"call_id": "abc", "duration": 42}))
            .await
            .unwrap();
        sink.do_accounting(&json!({"call_id": "def", "duration": 7}))
            .await
            .unwrap();
        sink.stop().await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["call_id"], "abc");
    }
}
