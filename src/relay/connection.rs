//! One connected relay node.
//!
//! `RelayConnection` owns the write half of the relay's TLS stream, its
//! sequence counter, and its outstanding-command table. The table is
//! mutated only through the methods here, from two callers: `send_command`
//! (insert) and the connection's own read loop, driven by `RelayPool`
//! (remove, on reply/timeout/disconnect) — matching the "per-relay
//! `commands` map is owned by its owning relay connection" resource
//! policy.

use crate::relay::error::RelayError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, Mutex};

type ReplyResult = Result<String, RelayError>;

/// A `relay_timeout` shared between every connected relay and whatever
/// holds the setter, so a config reload (spec.md §3/SPEC_FULL §3) takes
/// effect for already-connected relays, not just ones accepted afterward.
#[derive(Clone)]
pub struct SharedTimeout(Arc<AtomicU64>);

impl SharedTimeout {
    pub fn new(initial: Duration) -> Self {
        Self(Arc::new(AtomicU64::new(initial.as_millis() as u64)))
    }

    pub fn get(&self) -> Duration {
        Duration::from_millis(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, timeout: Duration) {
        self.0.store(timeout.as_millis() as u64, Ordering::Relaxed);
    }
}

struct PendingCommand {
    command: String,
    reply_tx: oneshot::Sender<ReplyResult>,
}

/// A single connected relay node, identified by its peer IP.
pub struct RelayConnection {
    pub ip: String,
    ready: AtomicBool,
    next_seq: AtomicU32,
    commands: Mutex<HashMap<u32, PendingCommand>>,
    writer: Mutex<Box<dyn tokio::io::AsyncWrite + Send + Unpin>>,
    relay_timeout: SharedTimeout,
}

impl RelayConnection {
    pub fn new(
        ip: String,
        writer: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
        relay_timeout: SharedTimeout,
    ) -> Self {
        Self {
            ip,
            ready: AtomicBool::new(true),
            next_seq: AtomicU32::new(0),
            commands: Mutex::new(HashMap::new()),
            writer: Mutex::new(writer),
            relay_timeout,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn mark_not_ready(&self) {
        self.ready.store(false, Ordering::Release);
    }

    /// Assign the next sequence number, write the command frame, and wait
    /// for either a matching reply or the per-command timeout.
    pub async fn send_command(
        &self,
        command: &str,
        headers: Vec<String>,
    ) -> Result<String, RelayError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            let mut commands = self.commands.lock().await;
            commands.insert(
                seq,
                PendingCommand {
                    command: command.to_string(),
                    reply_tx,
                },
            );
        }

        let frame = crate::protocol::relay_command_frame(command, seq, &headers);
        tracing::debug!(relay_ip = %self.ip, seq, command, "issuing command to relay");

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(frame.as_bytes()).await {
                self.commands.lock().await.remove(&seq);
                tracing::warn!(relay_ip = %self.ip, seq, error = %e, "failed to write command frame");
                return Err(RelayError::Disconnected);
            }
        }

        match tokio::time::timeout(self.relay_timeout.get(), reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RelayError::Disconnected),
            Err(_) => {
                self.commands.lock().await.remove(&seq);
                tracing::warn!(relay_ip = %self.ip, seq, command, "command timed out");
                Err(RelayError::Timeout)
            }
        }
    }

    /// Resolve the outstanding command matching `seq`, or log and drop if unknown.
    /// `mark_halting` only takes effect once a matching pending command is
    /// found — a `halting` reply for an unknown/expired sequence must not
    /// flip readiness (mirrors the original only marking `ready=False`
    /// after successfully popping the outstanding command).
    pub(super) async fn complete(&self, seq: u32, result: ReplyResult, mark_halting: bool) {
        let pending = self.commands.lock().await.remove(&seq);
        match pending {
            Some(pc) => {
                if mark_halting {
                    self.mark_not_ready();
                }
                let _ = pc.reply_tx.send(result);
            }
            None => {
                tracing::warn!(relay_ip = %self.ip, seq, "got reply for unknown or expired command");
            }
        }
    }

    /// Look up (without removing) which command name is outstanding for `seq`.
    pub(super) async fn pending_command_name(&self, seq: u32) -> Option<String> {
        self.commands
            .lock()
            .await
            .get(&seq)
            .map(|pc| pc.command.clone())
    }

    /// Fail every outstanding command, used on disconnect.
    pub(super) async fn fail_all(&self, error: RelayError) {
        let mut commands = self.commands.lock().await;
        for (_, pending) in commands.drain() {
            let _ = pending.reply_tx.send(Err(error.clone()));
        }
    }
}
