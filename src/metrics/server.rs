//! Metrics HTTP Server
//!
//! Provides HTTP endpoint for Prometheus metrics scraping

use crate::metrics::Metrics;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// HTTP server for serving Prometheus metrics
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    bind_addr: String,
}

impl MetricsServer {
    /// Create a new metrics server
    pub fn new(metrics: Arc<Metrics>, bind_addr: String) -> Self {
        Self { metrics, bind_addr }
    }

    /// Start the metrics server. Runs until the listener fails.
    pub async fn start(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        info!(bind_addr = %self.bind_addr, "Metrics server started");

        loop {
            match listener.accept().await {
                Ok((mut stream, addr)) => {
                    debug!(client_addr = %addr, "Metrics request received");

                    let metrics = self.metrics.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_request(&mut stream, metrics).await {
                            error!(error = %e, client_addr = %addr, "Failed to handle metrics request");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept metrics connection");
                }
            }
        }
    }
}

/// Handle a single HTTP request for metrics
async fn handle_request(
    stream: &mut tokio::net::TcpStream,
    metrics: Arc<Metrics>,
) -> anyhow::Result<()> {
    let mut buffer = [0; 1024];
    let bytes_read = stream.read(&mut buffer).await?;

    if bytes_read == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..bytes_read]);
    debug!(request = %request, "Received HTTP request");

    if request.starts_with("GET /metrics") {
        let metrics_data = metrics.export_prometheus();

        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
            metrics_data.len(),
            metrics_data
        );

        stream.write_all(response.as_bytes()).await?;
        debug!("Sent Prometheus metrics response");
    } else if request.starts_with("GET /health") {
        let response = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nOK";
        stream.write_all(response.as_bytes()).await?;
        debug!("Sent health check response");
    } else {
        let response =
            "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 9\r\n\r\nNot Found";
        stream.write_all(response.as_bytes()).await?;
        debug!("Sent 404 response");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt as _;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn serves_metrics_and_health() -> anyhow::Result<()> {
        let metrics = Arc::new(Metrics::new());
        metrics.relay_connected();
        let server = MetricsServer::new(metrics, "127.0.0.1:0".to_string());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);
        let server_metrics = server.metrics.clone();

        let listener = TcpListener::bind(addr).await?;
        tokio::spawn(async move {
            loop {
                if let Ok((mut stream, _)) = listener.accept().await {
                    let metrics = server_metrics.clone();
                    tokio::spawn(async move {
                        let _ = handle_request(&mut stream, metrics).await;
                    });
                }
            }
        });

        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(b"GET /metrics HTTP/1.1\r\n\r\n").await?;
        let mut response = String::new();
        stream.read_to_string(&mut response).await.ok();
        assert!(response.contains("200 OK"));
        assert!(response.contains("dispatcher_relays_connected"));

        Ok(())
    }
}
