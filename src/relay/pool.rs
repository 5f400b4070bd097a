//! Relay pool / router
//!
//! Owns the relay set, the call-id→relay session table, and the
//! cleanup-timer bookkeeping for disconnected relays. All three are
//! confined to a single mutex, since the invariants linking them span
//! all three maps.

use crate::accounting::AccountingFanout;
use crate::metrics::Metrics;
use crate::protocol::{parse_relay_line, RelayLine, RequestFrame};
use crate::relay::connection::{RelayConnection, SharedTimeout};
use crate::relay::error::RelayError;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

struct PoolState {
    relays: HashMap<String, Arc<RelayConnection>>,
    sessions: HashMap<String, String>,
    cleanup_timers: HashMap<String, JoinHandle<()>>,
}

/// Maintains the relay set and call-id affinity table, and selects relays
/// for new sessions with preference and randomized failover.
pub struct RelayPool {
    state: Mutex<PoolState>,
    /// Per-call-id locks serializing concurrent `update`s for a call_id
    /// with no existing session, so two racing binds cannot both win.
    call_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Grace period for session cleanup after a relay disconnects. Behind
    /// a lock since `config_reload` can change it while relays are
    /// connected; only the in-flight `relay_disconnected` race reads a
    /// value snapshotted at the moment the timer was armed.
    cleanup_timeout: Mutex<Duration>,
    /// Per-command reply deadline, shared with every `RelayConnection` so
    /// a config reload (spec.md §3/SPEC_FULL §3) applies to relays already
    /// connected, not just ones accepted afterward.
    relay_timeout: SharedTimeout,
    metrics: Arc<Metrics>,
    /// Swappable so `config_reload` can add/remove accounting backends
    /// without restarting the dispatcher.
    accounting: Mutex<Arc<AccountingFanout>>,
    shutting_down: std::sync::atomic::AtomicBool,
    empty_notify: tokio::sync::Notify,
}

impl RelayPool {
    pub fn new(
        cleanup_timeout: Duration,
        relay_timeout: Duration,
        metrics: Arc<Metrics>,
        accounting: Arc<AccountingFanout>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState {
                relays: HashMap::new(),
                sessions: HashMap::new(),
                cleanup_timers: HashMap::new(),
            }),
            call_locks: Mutex::new(HashMap::new()),
            cleanup_timeout: Mutex::new(cleanup_timeout),
            relay_timeout: SharedTimeout::new(relay_timeout),
            metrics,
            accounting: Mutex::new(accounting),
            shutting_down: std::sync::atomic::AtomicBool::new(false),
            empty_notify: tokio::sync::Notify::new(),
        })
    }

    /// Apply a new cleanup grace period. Only affects timers armed after
    /// this call; a timer already running keeps the duration it was
    /// armed with.
    pub async fn set_cleanup_timeout(&self, timeout: Duration) {
        *self.cleanup_timeout.lock().await = timeout;
        tracing::info!(?timeout, "cleanup_timeout updated by config reload");
    }

    /// Apply a new per-command reply deadline. Takes effect immediately
    /// for every connected relay, since they all read the same shared
    /// value on each `send_command` call, and for every relay accepted
    /// afterward via `relay_timeout_handle`.
    pub fn set_relay_timeout(&self, timeout: Duration) {
        self.relay_timeout.set(timeout);
        tracing::info!(?timeout, "relay_timeout updated by config reload");
    }

    /// A clone of the shared timeout handle, given to each newly accepted
    /// relay's `RelayConnection` so it observes future reloads too.
    pub fn relay_timeout_handle(&self) -> SharedTimeout {
        self.relay_timeout.clone()
    }

    /// Swap the accounting fan-out wholesale, e.g. after `config_reload`
    /// picks up a changed `accounting.backends` list.
    pub async fn set_accounting(&self, accounting: Arc<AccountingFanout>) {
        *self.accounting.lock().await = accounting;
        tracing::info!("accounting backends updated by config reload");
    }

    /// Route a request frame to the correct relay, per §4.3's algorithm.
    pub async fn dispatch(self: &Arc<Self>, frame: &RequestFrame) -> Result<String, RelayError> {
        let call_id = frame.call_id().ok_or(RelayError::MissingCallId)?.to_string();

        if let Some(ip) = self.lookup_session(&call_id).await {
            return self.forward_to_existing(&ip, frame).await;
        }

        if frame.command != "update" {
            return Err(RelayError::UnknownSession);
        }

        let call_lock = self.acquire_call_lock(&call_id).await;
        let result = {
            let _guard = call_lock.lock().await;
            // Re-check under the per-call-id lock: another update() may
            // have bound this call_id while we were waiting for it.
            if let Some(ip) = self.lookup_session(&call_id).await {
                self.forward_to_existing(&ip, frame).await
            } else {
                self.dispatch_update(frame, &call_id).await
            }
        };
        drop(call_lock);
        self.release_call_lock(&call_id).await;
        result
    }

    async fn lookup_session(&self, call_id: &str) -> Option<String> {
        self.state.lock().await.sessions.get(call_id).cloned()
    }

    async fn forward_to_existing(
        &self,
        ip: &str,
        frame: &RequestFrame,
    ) -> Result<String, RelayError> {
        let relay = { self.state.lock().await.relays.get(ip).cloned() };
        let relay = relay.ok_or(RelayError::RelayGone)?;
        self.metrics.command_issued();
        let result = relay.send_command(&frame.command, frame.headers.clone()).await;
        if let Err(ref e) = result {
            if *e == RelayError::Timeout {
                self.metrics.command_timed_out();
            }
            self.metrics.command_failed();
        }
        result
    }

    /// Build the candidate list and attempt each in order, per §4.3: a
    /// `media_relay` header overrides readiness for the first attempt;
    /// otherwise only `ready` relays are candidates, in random order.
    async fn dispatch_update(
        &self,
        frame: &RequestFrame,
        call_id: &str,
    ) -> Result<String, RelayError> {
        let mut candidates = self.build_candidates(frame.media_relay()).await;
        if candidates.is_empty() {
            return Err(RelayError::NoRelayAvailable);
        }

        loop {
            let relay = match candidates.pop() {
                Some(relay) => relay,
                None => return Err(RelayError::NoRelayAvailable),
            };

            self.metrics.command_issued();
            match relay
                .send_command(&frame.command, frame.headers.clone())
                .await
            {
                Ok(reply) => {
                    self.state
                        .lock()
                        .await
                        .sessions
                        .insert(call_id.to_string(), relay.ip.clone());
                    self.metrics.session_bound();
                    return Ok(reply);
                }
                Err(e) => {
                    if e == RelayError::Timeout {
                        self.metrics.command_timed_out();
                    }
                    self.metrics.command_failed();
                    tracing::warn!(relay_ip = %relay.ip, error = %e, "relay failed, trying next candidate");
                    if candidates.is_empty() {
                        return Err(RelayError::NoRelayAvailable);
                    }
                }
            }
        }
    }

    async fn build_candidates(&self, preferred: Option<&str>) -> Vec<Arc<RelayConnection>> {
        let state = self.state.lock().await;
        let mut rng = rand::thread_rng();

        // Candidates are attempted by popping from the end of the vec, so
        // the intended first attempt is placed last.
        match preferred {
            Some(preferred_ip) => {
                let mut others: Vec<Arc<RelayConnection>> = state
                    .relays
                    .values()
                    .filter(|r| r.is_ready() && r.ip != preferred_ip)
                    .cloned()
                    .collect();
                others.shuffle(&mut rng);

                let mut candidates = others;
                if let Some(preferred_relay) = state.relays.get(preferred_ip) {
                    candidates.push(preferred_relay.clone());
                }
                candidates
            }
            None => {
                let mut ready: Vec<Arc<RelayConnection>> = state
                    .relays
                    .values()
                    .filter(|r| r.is_ready())
                    .cloned()
                    .collect();
                ready.shuffle(&mut rng);
                ready
            }
        }
    }

    async fn acquire_call_lock(&self, call_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.call_locks.lock().await;
        locks
            .entry(call_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn release_call_lock(&self, call_id: &str) {
        let mut locks = self.call_locks.lock().await;
        if let Some(lock) = locks.get(call_id) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(call_id);
            }
        }
    }

    /// Register a newly-connected relay. Rejects a second connection from
    /// an IP already present. Cancels any armed cleanup timer for this IP.
    pub async fn relay_connected(
        self: &Arc<Self>,
        ip: String,
        relay: Arc<RelayConnection>,
    ) -> Result<(), RelayError> {
        let mut state = self.state.lock().await;
        if state.relays.contains_key(&ip) {
            tracing::error!(relay_ip = %ip, "relay already connected, refusing duplicate");
            return Err(RelayError::Disconnected);
        }
        if let Some(timer) = state.cleanup_timers.remove(&ip) {
            timer.abort();
            tracing::info!(relay_ip = %ip, "relay reconnected within cleanup window, sessions preserved");
        }
        state.relays.insert(ip.clone(), relay);
        self.metrics.relay_connected();
        tracing::info!(relay_ip = %ip, "relay connected");
        Ok(())
    }

    /// Remove a relay from the pool. If sessions point at it, arm a
    /// cleanup timer; if a shutdown is in progress and the pool is now
    /// empty, signal shutdown completion.
    pub async fn relay_disconnected(self: &Arc<Self>, ip: &str) {
        let now_empty = {
            let mut state = self.state.lock().await;
            state.relays.remove(ip);
            self.metrics.relay_disconnected();

            if !self.shutting_down.load(std::sync::atomic::Ordering::Acquire) {
                let pool = self.clone();
                let ip_owned = ip.to_string();
                let cleanup_timeout = *self.cleanup_timeout.lock().await;
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(cleanup_timeout).await;
                    pool.do_cleanup(&ip_owned).await;
                });
                state.cleanup_timers.insert(ip.to_string(), handle);
            }

            state.relays.is_empty()
        };

        tracing::info!(relay_ip = %ip, "relay disconnected");

        if self.shutting_down.load(std::sync::atomic::Ordering::Acquire) && now_empty {
            self.empty_notify.notify_waiters();
        }
    }

    async fn do_cleanup(&self, ip: &str) {
        let mut state = self.state.lock().await;
        state.cleanup_timers.remove(ip);
        let before = state.sessions.len();
        state.sessions.retain(|_, owner| owner != ip);
        let removed = before - state.sessions.len();
        drop(state);
        for _ in 0..removed {
            self.metrics.session_released();
        }
        tracing::debug!(relay_ip = %ip, removed, "cleaned up sessions for old relay");
    }

    /// Drop the session for `call_id` if it is currently owned by `ip`.
    /// Used when a relay reports `expired` or completes a `remove`.
    pub async fn drop_session_if_owned(&self, ip: &str, call_id: &str) {
        let mut state = self.state.lock().await;
        if state.sessions.get(call_id).map(String::as_str) == Some(ip) {
            state.sessions.remove(call_id);
            drop(state);
            self.metrics.session_released();
        }
    }

    pub async fn accounting(&self) -> Arc<AccountingFanout> {
        self.accounting.lock().await.clone()
    }

    pub async fn relay_count(&self) -> usize {
        self.state.lock().await.relays.len()
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    /// Cancel all cleanup timers, close every relay connection, and wait
    /// (bounded by `timeout`) for all relays to confirm disconnect.
    pub async fn shutdown(self: &Arc<Self>, timeout: Duration) {
        self.shutting_down
            .store(true, std::sync::atomic::Ordering::Release);

        let is_empty = {
            let mut state = self.state.lock().await;
            for (_, timer) in state.cleanup_timers.drain() {
                timer.abort();
            }
            state.relays.is_empty()
        };

        if is_empty {
            return;
        }

        if tokio::time::timeout(timeout, self.empty_notify.notified())
            .await
            .is_err()
        {
            tracing::warn!("relay pool shutdown timed out waiting for relays to disconnect");
        }
    }
}

/// Drives the read half of one relay's connection: dispatches replies to
/// their outstanding command, forwards `expired` notifications to
/// accounting, and cleans up on disconnect.
pub async fn run_relay_read_loop<R>(
    pool: Arc<RelayPool>,
    ip: String,
    relay: Arc<RelayConnection>,
    mut reader: R,
) where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(relay_ip = %ip, error = %e, "error reading from relay");
                break;
            }
        }

        match parse_relay_line(&line) {
            RelayLine::Expired(stats) => {
                if let Some(call_id) = stats.get("call_id").and_then(|v| v.as_str()) {
                    pool.drop_session_if_owned(&ip, call_id).await;
                } else {
                    tracing::warn!(relay_ip = %ip, "expired notification missing call_id");
                }
                pool.accounting().await.do_accounting(&stats).await;
            }
            RelayLine::Reply { seq, payload } => {
                let Ok(seq) = seq.parse::<u32>() else {
                    tracing::warn!(relay_ip = %ip, seq, "malformed sequence number in relay reply");
                    continue;
                };

                if payload == "error" {
                    relay.complete(seq, Err(RelayError::ErrorReply), false).await;
                } else if payload == "halting" {
                    relay.complete(seq, Err(RelayError::Halting), true).await;
                } else if relay.pending_command_name(seq).await.as_deref() == Some("remove") {
                    match serde_json::from_str::<serde_json::Value>(&payload) {
                        Ok(stats) => {
                            if let Some(call_id) = stats.get("call_id").and_then(|v| v.as_str()) {
                                pool.drop_session_if_owned(&ip, call_id).await;
                            }
                            pool.accounting().await.do_accounting(&stats).await;
                            relay.complete(seq, Ok("removed".to_string()), false).await;
                        }
                        Err(_) => {
                            tracing::error!(relay_ip = %ip, seq, "could not decode JSON from relay");
                            relay.complete(seq, Ok("removed".to_string()), false).await;
                        }
                    }
                } else {
                    relay.complete(seq, Ok(payload), false).await;
                }
            }
            RelayLine::Malformed(raw) => {
                tracing::error!(relay_ip = %ip, line = %raw, "could not decode reply from relay");
            }
        }
    }

    relay.fail_all(RelayError::Disconnected).await;
    pool.relay_disconnected(&ip).await;
}
