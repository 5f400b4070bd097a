//! One connection from the SIP proxy over the control socket.
//!
//! Requests may be pipelined, so dispatch runs concurrently per request
//! but replies are written back in submission order: every request's
//! eventual reply is threaded through an mpsc channel in the order it was
//! read, and a single writer task awaits them one at a time.

use crate::protocol::read_request_frame;
use crate::relay::{RelayError, RelayPool};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc, oneshot};

/// Serve one control-socket connection until the peer disconnects, a
/// frame fails to parse, or `shutdown_rx` fires.
pub async fn run<S>(pool: Arc<RelayPool>, stream: S, mut shutdown_rx: broadcast::Receiver<()>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let (tx, mut rx) = mpsc::unbounded_channel::<oneshot::Receiver<Result<String, RelayError>>>();

    let writer_task = tokio::spawn(async move {
        let mut write_half = write_half;
        while let Some(receiver) = rx.recv().await {
            let reply = match receiver.await {
                Ok(Ok(payload)) => payload,
                Ok(Err(relay_err)) => {
                    tracing::warn!(error = %relay_err, "request failed");
                    RelayError::WIRE_TOKEN.to_string()
                }
                Err(_) => {
                    tracing::error!("dispatch task vanished without replying");
                    RelayError::WIRE_TOKEN.to_string()
                }
            };

            if write_half
                .write_all(format!("{}\r\n", reply).as_bytes())
                .await
                .is_err()
            {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = read_request_frame(&mut reader) => {
                match frame {
                    Ok(Some(frame)) => {
                        let (reply_tx, reply_rx) = oneshot::channel();
                        let pool = pool.clone();
                        tokio::spawn(async move {
                            let result = pool.dispatch(&frame).await;
                            let _ = reply_tx.send(result);
                        });
                        if tx.send(reply_rx).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "control connection read error");
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                // Stop accepting new requests; already-queued ones still
                // get their replies written before this connection closes.
                break;
            }
        }
    }

    drop(tx);
    let _ = writer_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::{AccountingFanout, LogSink};
    use crate::metrics::Metrics;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};

    #[tokio::test]
    async fn unknown_call_id_yields_error_line() {
        let accounting = Arc::new(AccountingFanout::new(vec![Box::new(LogSink::new())]));
        let metrics = Arc::new(Metrics::new());
        let pool = RelayPool::new(Duration::from_secs(3600), Duration::from_secs(5), metrics, accounting);

        let (mut client, server) = tokio::io::duplex(4096);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        tokio::spawn(run(pool, server, shutdown_rx));

        client
            .write_all(b"remove\r\ncall_id: nonexistent\r\n\r\n")
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"error\r\n");
    }
}
