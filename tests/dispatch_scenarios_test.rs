//! End-to-end scenarios over the control-socket wire protocol, driving
//! `RelayPool` and `control::run` together the way the proxy and relay
//! nodes actually would, rather than calling `RelayPool` methods
//! directly. Mirrors S1, S2, S3, and S6 from the design's scenario list.

use std::sync::Arc;
use std::time::Duration;

use mediaproxy_dispatcher::accounting::{AccountingFanout, LogSink};
use mediaproxy_dispatcher::metrics::Metrics;
use mediaproxy_dispatcher::relay::{run_relay_read_loop, RelayConnection, RelayPool, SharedTimeout};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;

fn new_pool(cleanup_timeout: Duration) -> Arc<RelayPool> {
    let metrics = Arc::new(Metrics::new());
    let accounting = Arc::new(AccountingFanout::new(vec![Box::new(LogSink::new())]));
    RelayPool::new(cleanup_timeout, Duration::from_secs(5), metrics, accounting)
}

/// Wires up a fake relay: a `RelayConnection` plus a task driving
/// `run_relay_read_loop` over an in-memory duplex pipe, standing in for
/// the TLS socket `accept_relays` would otherwise own.
async fn attach_relay(pool: Arc<RelayPool>, ip: &str, relay_timeout: Duration) -> (Arc<RelayConnection>, tokio::io::DuplexStream) {
    let (relay_side, wire_side) = tokio::io::duplex(8192);
    let (read_half, write_half) = tokio::io::split(relay_side);
    let relay = Arc::new(RelayConnection::new(ip.to_string(), Box::new(write_half), SharedTimeout::new(relay_timeout)));
    pool.relay_connected(ip.to_string(), relay.clone()).await.unwrap();

    let reader = tokio::io::BufReader::new(read_half);
    let pool_clone = pool.clone();
    let ip_owned = ip.to_string();
    let relay_clone = relay.clone();
    tokio::spawn(async move {
        run_relay_read_loop(pool_clone, ip_owned, relay_clone, reader).await;
    });

    (relay, wire_side)
}

/// Proxy-side helper: send one request frame over `client` and read back
/// one `\r\n`-terminated reply line.
async fn send_request(client: &mut tokio::io::DuplexStream, frame: &str) -> String {
    client.write_all(frame.as_bytes()).await.unwrap();
    let mut buf = [0u8; 1024];
    let n = client.read(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf[..n]).trim_end().to_string()
}

/// Reads one relay-bound command frame off `wire` and writes back `reply`
/// as the sequenced response line.
async fn relay_replies_once(wire: &mut tokio::io::DuplexStream, reply: &str) {
    let mut buf = [0u8; 1024];
    let n = wire.read(&mut buf).await.unwrap();
    let frame = String::from_utf8_lossy(&buf[..n]).to_string();
    let seq = frame.split_whitespace().nth(1).unwrap();
    wire.write_all(format!("{} {}\r\n", seq, reply).as_bytes())
        .await
        .unwrap();
}

#[tokio::test]
async fn s1_happy_path_binds_and_replies() {
    let pool = new_pool(Duration::from_secs(3600));
    let (_relay, mut wire) = attach_relay(pool.clone(), "10.0.0.1", Duration::from_secs(5)).await;

    let (mut proxy_client, proxy_server) = tokio::io::duplex(4096);
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(mediaproxy_dispatcher::control::run(pool.clone(), proxy_server, shutdown_rx));

    let request = tokio::spawn(async move {
        send_request(&mut proxy_client, "update\r\ncall_id: abc\r\n\r\n").await
    });
    relay_replies_once(&mut wire, "ok-payload").await;

    assert_eq!(request.await.unwrap(), "ok-payload");
    assert_eq!(pool.session_count().await, 1);
}

#[tokio::test]
async fn s2_first_candidate_error_fails_over_to_second() {
    let pool = new_pool(Duration::from_secs(3600));
    let (_r1, mut wire1) = attach_relay(pool.clone(), "10.0.0.1", Duration::from_secs(5)).await;
    let (_r2, mut wire2) = attach_relay(pool.clone(), "10.0.0.2", Duration::from_secs(5)).await;

    let (mut proxy_client, proxy_server) = tokio::io::duplex(4096);
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(mediaproxy_dispatcher::control::run(pool.clone(), proxy_server, shutdown_rx));

    let request = tokio::spawn(async move {
        send_request(&mut proxy_client, "update\r\ncall_id: abc\r\n\r\n").await
    });

    // Whichever relay is tried first gets "error"; the other gets the
    // real reply. Drive both wires concurrently since candidate order is
    // randomized.
    let fail_then_succeed = async {
        tokio::select! {
            n = wire1_errors_then(&mut wire1, &mut wire2) => n,
        }
    };
    fail_then_succeed.await;

    assert_eq!(request.await.unwrap(), "ok-payload");
    assert_eq!(pool.session_count().await, 1);
}

/// Reads whichever of the two wires receives a frame first, answers it
/// with `error`, then answers the other wire's frame with the real
/// payload — without assuming which relay the pool tried first.
async fn wire1_errors_then(a: &mut tokio::io::DuplexStream, b: &mut tokio::io::DuplexStream) {
    let mut buf_a = [0u8; 1024];
    let mut buf_b = [0u8; 1024];
    tokio::select! {
        res = a.read(&mut buf_a) => {
            let n = res.unwrap();
            let frame = String::from_utf8_lossy(&buf_a[..n]).to_string();
            let seq = frame.split_whitespace().nth(1).unwrap();
            a.write_all(format!("{} error\r\n", seq).as_bytes()).await.unwrap();
            let n = b.read(&mut buf_b).await.unwrap();
            let frame = String::from_utf8_lossy(&buf_b[..n]).to_string();
            let seq = frame.split_whitespace().nth(1).unwrap();
            b.write_all(format!("{} ok-payload\r\n", seq).as_bytes()).await.unwrap();
        }
        res = b.read(&mut buf_b) => {
            let n = res.unwrap();
            let frame = String::from_utf8_lossy(&buf_b[..n]).to_string();
            let seq = frame.split_whitespace().nth(1).unwrap();
            b.write_all(format!("{} error\r\n", seq).as_bytes()).await.unwrap();
            let n = a.read(&mut buf_a).await.unwrap();
            let frame = String::from_utf8_lossy(&buf_a[..n]).to_string();
            let seq = frame.split_whitespace().nth(1).unwrap();
            a.write_all(format!("{} ok-payload\r\n", seq).as_bytes()).await.unwrap();
        }
    }
}

#[tokio::test]
async fn s3_preference_tried_first_despite_halting() {
    let pool = new_pool(Duration::from_secs(3600));
    let (preferred, mut preferred_wire) = attach_relay(pool.clone(), "10.0.0.1", Duration::from_secs(5)).await;
    let (_other, mut other_wire) = attach_relay(pool.clone(), "10.0.0.2", Duration::from_secs(5)).await;

    // Mark the preferred relay halting via a real outstanding command,
    // matching how a live "halting" reply would flip readiness in
    // production (an unknown sequence no longer has that effect).
    let warmup = {
        let preferred = preferred.clone();
        tokio::spawn(async move { preferred.send_command("update", vec![]).await })
    };
    relay_replies_once(&mut preferred_wire, "halting").await;
    assert_eq!(
        warmup.await.unwrap(),
        Err(mediaproxy_dispatcher::relay::RelayError::Halting)
    );
    assert!(!preferred.is_ready());

    let (mut proxy_client, proxy_server) = tokio::io::duplex(4096);
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(mediaproxy_dispatcher::control::run(pool.clone(), proxy_server, shutdown_rx));

    let request = tokio::spawn(async move {
        send_request(
            &mut proxy_client,
            "update\r\ncall_id: x\r\nmedia_relay: 10.0.0.1\r\n\r\n",
        )
        .await
    });

    // The preferred relay must receive the first attempt even though it
    // is not ready; reply with halting again so the pool fails over.
    relay_replies_once(&mut preferred_wire, "halting").await;
    relay_replies_once(&mut other_wire, "ok-payload").await;

    assert_eq!(request.await.unwrap(), "ok-payload");
}

#[tokio::test]
async fn s6_expired_notification_drops_session_and_reaches_accounting() {
    let metrics = Arc::new(Metrics::new());
    let accounting = Arc::new(AccountingFanout::new(vec![Box::new(LogSink::new())]));
    let pool = RelayPool::new(Duration::from_secs(3600), Duration::from_secs(5), metrics, accounting);

    let (_relay, mut wire) = attach_relay(pool.clone(), "10.0.0.1", Duration::from_secs(5)).await;

    let (mut proxy_client, proxy_server) = tokio::io::duplex(4096);
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(mediaproxy_dispatcher::control::run(pool.clone(), proxy_server, shutdown_rx));

    let request = tokio::spawn(async move {
        send_request(&mut proxy_client, "update\r\ncall_id: q\r\n\r\n").await
    });
    relay_replies_once(&mut wire, "ok-payload").await;
    request.await.unwrap();
    assert_eq!(pool.session_count().await, 1);

    wire.write_all(b"expired {\"call_id\":\"q\",\"duration\":42}\r\n")
        .await
        .unwrap();

    // Give the relay's read loop a moment to process the notification.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.session_count().await, 0);
}

#[tokio::test]
async fn relay_gone_surfaces_as_error_to_the_proxy() {
    let pool = new_pool(Duration::from_millis(200));
    let (_relay, mut wire) = attach_relay(pool.clone(), "10.0.0.1", Duration::from_secs(5)).await;

    {
        let (mut proxy_client, proxy_server) = tokio::io::duplex(4096);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(mediaproxy_dispatcher::control::run(pool.clone(), proxy_server, shutdown_rx));

        let request = tokio::spawn(async move {
            send_request(&mut proxy_client, "update\r\ncall_id: z\r\n\r\n").await
        });
        relay_replies_once(&mut wire, "ok-payload").await;
        request.await.unwrap();
    }

    // Drop the relay's wire to simulate disconnect, then immediately try
    // `remove` before the (200ms) cleanup timer fires.
    drop(wire);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (mut proxy_client, proxy_server) = tokio::io::duplex(4096);
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(mediaproxy_dispatcher::control::run(pool, proxy_server, shutdown_rx));

    let reply = send_request(&mut proxy_client, "remove\r\ncall_id: z\r\n\r\n").await;
    assert_eq!(reply, "error");
}
