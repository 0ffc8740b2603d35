//! End-to-end integration tests: a real `FleetPeer` on a loopback port and
//! `TransportManager` clients connecting to it over QUIC or TCP+TLS.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use fleet_transport::{
    BoxError, CertificateProvider, ConnectionState, ErrorKind, FleetPeer, PeerConfig, TransportConfig,
    TransportManager, TransportMode,
};
use parking_lot::Mutex;
use tokio::time::timeout;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Start a peer on an OS-assigned loopback port.
async fn start_peer(configure: impl FnOnce(&mut PeerConfig)) -> FleetPeer {
    init_tracing();
    let identity = CertificateProvider::new().generate().unwrap();
    let mut config = PeerConfig {
        port: 0,
        handshake_timeout_ms: 5000,
        ..PeerConfig::default()
    };
    configure(&mut config);
    FleetPeer::start(config, &identity).await.unwrap()
}

fn client_config(port: u16) -> TransportConfig {
    TransportConfig::new("127.0.0.1", port)
        .with_connection_timeout_ms(2000)
        .with_retry_delay_ms(50)
        .with_max_retry_delay_ms(500)
        .with_max_retries(3)
}

/// Poll `condition` for up to ten seconds.
async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

fn collector(sink: &Arc<Mutex<Vec<Bytes>>>) -> impl Fn(&Bytes) -> Result<(), BoxError> + Send + Sync + 'static {
    let sink = Arc::clone(sink);
    move |payload: &Bytes| {
        sink.lock().push(payload.clone());
        Ok(())
    }
}

fn record_states(transport: &TransportManager) -> Arc<Mutex<Vec<ConnectionState>>> {
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    transport.on_state_change(move |state| sink.lock().push(state));
    states
}

fn record_errors(transport: &TransportManager) -> Arc<Mutex<Vec<ErrorKind>>> {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    transport.on_error(move |kind, _| sink.lock().push(kind));
    errors
}

fn count_reconnects(transport: &TransportManager) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&count);
    transport.on_reconnected(move || {
        sink.fetch_add(1, Ordering::SeqCst);
    });
    count
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario A: QUIC happy path
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quic_happy_path_delivers_in_order() {
    let peer = start_peer(|_| {}).await;
    let transport = TransportManager::new(client_config(peer.port()));
    let states = record_states(&transport);
    let received = Arc::new(Mutex::new(Vec::new()));
    let _subscription = transport.receive("tasks", collector(&received));

    timeout(Duration::from_secs(10), transport.initialize())
        .await
        .expect("initialize timed out")
        .unwrap();

    assert_eq!(transport.get_mode(), TransportMode::Quic);
    assert_eq!(
        *states.lock(),
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );
    assert!(eventually(|| peer.session_count_for(TransportMode::Quic) == 1).await);

    for payload in ["a", "b", "c"] {
        transport.send("tasks", payload).await.unwrap();
    }

    // The peer relays every frame back to its sender.
    assert!(eventually(|| received.lock().len() == 3).await);
    assert_eq!(
        *received.lock(),
        vec![Bytes::from_static(b"a"), Bytes::from_static(b"b"), Bytes::from_static(b"c")]
    );

    let metrics = transport.get_metrics();
    assert_eq!(metrics.mode, TransportMode::Quic);
    assert_eq!(metrics.state, ConnectionState::Connected);
    assert_eq!(metrics.messages_sent, 3);
    assert_eq!(metrics.messages_received, 3);
    assert_eq!(metrics.failed_attempts, 0);
    assert_eq!(metrics.active_streams, 1);

    transport.close().await;
    peer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_relays_between_clients_and_publishes() {
    let peer = start_peer(|_| {}).await;
    let alice = TransportManager::new(client_config(peer.port()));
    let bob = TransportManager::new(client_config(peer.port()));
    let bob_inbox = Arc::new(Mutex::new(Vec::new()));
    let _subscription = bob.receive("status", collector(&bob_inbox));

    alice.initialize().await.unwrap();
    bob.initialize().await.unwrap();
    assert!(eventually(|| peer.session_count() == 2).await);

    alice.send("status", "alice is busy").await.unwrap();
    assert!(eventually(|| bob_inbox.lock().len() == 1).await);

    assert_eq!(peer.publish("status", "peer announcement"), 2);
    assert!(eventually(|| bob_inbox.lock().len() == 2).await);
    assert_eq!(bob_inbox.lock()[1], Bytes::from_static(b"peer announcement"));

    // Traffic on other channels is not delivered to this subscriber
    alice.send("other", "ignored").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bob_inbox.lock().len(), 2);

    alice.close().await;
    bob.close().await;
    peer.stop().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario B: QUIC blocked, TCP fallback
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocked_quic_falls_back_to_tcp() {
    let peer = start_peer(|c| c.enable_quic = false).await;
    let config = client_config(peer.port()).with_connection_timeout_ms(1000);
    let transport = TransportManager::new(config);
    let states = record_states(&transport);
    let received = Arc::new(Mutex::new(Vec::new()));
    let _subscription = transport.receive("tasks", collector(&received));

    timeout(Duration::from_secs(10), transport.initialize())
        .await
        .expect("initialize timed out")
        .unwrap();

    assert_eq!(transport.get_mode(), TransportMode::TcpFallback);
    assert_eq!(transport.get_metrics().failed_attempts, 1);
    assert_eq!(
        *states.lock(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connecting,
            ConnectionState::Connected
        ]
    );
    assert!(eventually(|| peer.session_count_for(TransportMode::TcpFallback) == 1).await);

    transport.send("tasks", "over tcp").await.unwrap();
    assert!(eventually(|| received.lock().len() == 1).await);

    transport.close().await;
    peer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_fallback_against_tcp_only_peer_fails() {
    let peer = start_peer(|c| c.enable_quic = false).await;
    let config = client_config(peer.port())
        .with_tcp_fallback(false)
        .with_connection_timeout_ms(300)
        .with_max_retries(1);
    let transport = TransportManager::new(config);
    let errors = record_errors(&transport);

    let err = transport.initialize().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RetriesExhausted);
    assert_eq!(transport.state(), ConnectionState::Failed);
    assert_eq!(transport.get_metrics().failed_attempts, 2);
    assert_eq!(errors.lock().last(), Some(&ErrorKind::RetriesExhausted));
    assert_eq!(peer.session_count(), 0);

    transport.close().await;
    peer.stop().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario C: connection lost and recovered
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminated_sessions_reconnect() {
    let peer = start_peer(|_| {}).await;
    let transport = TransportManager::new(client_config(peer.port()));
    let states = record_states(&transport);
    let reconnects = count_reconnects(&transport);
    let received = Arc::new(Mutex::new(Vec::new()));
    let _subscription = transport.receive("tasks", collector(&received));

    transport.initialize().await.unwrap();
    assert!(eventually(|| peer.session_count() == 1).await);

    assert_eq!(peer.disconnect_all(), 1);

    assert!(eventually(|| reconnects.load(Ordering::SeqCst) == 1).await);
    assert!(eventually(|| transport.is_connected()).await);
    assert_eq!(
        states.lock()[2..],
        [ConnectionState::Reconnecting, ConnectionState::Connected]
    );

    let metrics = transport.get_metrics();
    assert_eq!(metrics.reconnections, 1);
    assert!(metrics.last_error.is_some());

    // Subscriptions made before the loss still receive
    transport.send("tasks", "after reconnect").await.unwrap();
    assert!(eventually(|| received.lock().len() == 1).await);

    transport.close().await;
    peer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_peer_is_detected_by_keep_alive() {
    let peer = start_peer(|_| {}).await;
    let config = client_config(peer.port()).with_keep_alive(true, 100);
    let transport = TransportManager::new(config);
    let errors = record_errors(&transport);
    let reconnects = count_reconnects(&transport);

    transport.initialize().await.unwrap();
    peer.set_mute_pings(true);

    assert!(eventually(|| errors.lock().contains(&ErrorKind::ConnectionLost)).await);
    peer.set_mute_pings(false);

    assert!(eventually(|| reconnects.load(Ordering::SeqCst) >= 1).await);
    assert!(eventually(|| transport.is_connected()).await);
    assert!(transport.get_metrics().average_latency_ms >= 0.0);

    transport.close().await;
    peer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quic_reconnect_resumes_transparently() {
    let peer = start_peer(|_| {}).await;
    let transport = TransportManager::new(client_config(peer.port()));
    let reconnects = count_reconnects(&transport);
    let received = Arc::new(Mutex::new(Vec::new()));
    let _subscription = transport.receive("tasks", collector(&received));

    transport.initialize().await.unwrap();
    assert!(eventually(|| peer.session_count() == 1).await);

    // The second handshake may use 0-RTT with the ticket from the first.
    peer.disconnect_all();
    assert!(eventually(|| reconnects.load(Ordering::SeqCst) == 1).await);
    assert!(eventually(|| transport.is_connected()).await);
    assert_eq!(transport.get_mode(), TransportMode::Quic);

    transport.send("tasks", "resumed").await.unwrap();
    assert!(eventually(|| received.lock().len() == 1).await);
    assert_eq!(transport.get_metrics().failed_attempts, 0);

    transport.close().await;
    peer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopped_peer_sends_client_into_recovery() {
    let peer = start_peer(|_| {}).await;
    let config = client_config(peer.port()).with_max_retries(1).with_connection_timeout_ms(300);
    let transport = TransportManager::new(config);
    let states = record_states(&transport);

    transport.initialize().await.unwrap();
    peer.stop().await;
    peer.stop().await;

    assert!(eventually(|| states.lock().contains(&ConnectionState::Reconnecting)).await);
    assert!(eventually(|| transport.state() == ConnectionState::Failed).await);

    transport.close().await;
    assert_eq!(transport.state(), ConnectionState::Closed);
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario D: send before initialize
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn send_before_initialize_fails_fast() {
    let transport = TransportManager::new(client_config(4433));

    let err = transport.send("tasks", "too early").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotConnected);
    assert_eq!(transport.state(), ConnectionState::Disconnected);
    assert_eq!(transport.get_mode(), TransportMode::Uninitialized);
    assert_eq!(transport.get_metrics().messages_sent, 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Certificates, pinning and lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pinned_fingerprint_is_enforced() {
    let peer = start_peer(|_| {}).await;

    let trusted = TransportManager::new(
        client_config(peer.port()).with_trusted_fingerprint(peer.fingerprint()),
    );
    trusted.initialize().await.unwrap();
    assert!(trusted.is_connected());
    trusted.close().await;

    let wrong_pin = format!("sha256:{}", "0".repeat(64));
    let untrusted = TransportManager::new(
        client_config(peer.port())
            .with_trusted_fingerprint(wrong_pin)
            .with_max_retries(0),
    );
    let err = untrusted.initialize().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RetriesExhausted);
    assert_eq!(untrusted.get_metrics().failed_attempts, 2);
    untrusted.close().await;

    peer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_loads_certificate_from_disk() {
    let peer = start_peer(|_| {}).await;
    let dir = tempfile::tempdir().unwrap();
    let identity = CertificateProvider::new().generate().unwrap();
    let (cert, key) = identity.persist(dir.path()).unwrap();

    let transport = TransportManager::new(client_config(peer.port()).with_certificate(cert, key));
    transport.initialize().await.unwrap();
    assert!(transport.is_connected());
    transport.close().await;

    let broken = TransportManager::new(
        client_config(peer.port()).with_certificate(dir.path().join("missing.pem"), dir.path().join("key.pem")),
    );
    let err = broken.initialize().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CertificateLoad);
    assert_eq!(broken.state(), ConnectionState::Disconnected);

    peer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_is_idempotent_and_final() {
    let peer = start_peer(|_| {}).await;
    let transport = TransportManager::new(client_config(peer.port()));
    let states = record_states(&transport);

    transport.initialize().await.unwrap();
    transport.close().await;
    transport.close().await;

    assert_eq!(transport.state(), ConnectionState::Closed);
    assert_eq!(
        states.lock().iter().filter(|s| **s == ConnectionState::Closed).count(),
        1
    );
    assert_eq!(transport.initialize().await.unwrap_err().kind(), ErrorKind::AlreadyClosed);
    assert_eq!(transport.send("tasks", "x").await.unwrap_err().kind(), ErrorKind::AlreadyClosed);
    assert!(eventually(|| peer.session_count() == 0).await);

    peer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initialize_racing_close_settles_closed() {
    let peer = start_peer(|_| {}).await;
    let transport = Arc::new(TransportManager::new(client_config(peer.port())));

    let pending = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move { transport.initialize().await })
    };
    tokio::task::yield_now().await;
    transport.close().await;

    let outcome = timeout(Duration::from_secs(5), pending)
        .await
        .expect("initialize should settle after close")
        .unwrap();
    if let Err(e) = outcome {
        assert_eq!(e.kind(), ErrorKind::AlreadyClosed);
    }
    assert_eq!(transport.state(), ConnectionState::Closed);
    assert!(eventually(|| peer.session_count() == 0).await);

    peer.stop().await;
}
