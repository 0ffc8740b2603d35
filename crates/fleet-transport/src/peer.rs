//! Accepting side of the fleet link.
//!
//! A `FleetPeer` listens for TCP+TLS and QUIC on the same port number,
//! answers the `HELLO` handshake and keep-alive probes, and relays every
//! `DATA` frame to all live sessions (the sender included) in arrival
//! order. It backs the `serve` CLI command and the integration tests.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use fleet_protocol::{
    Frame, FrameKind, Hello, PROTOCOL_VERSION, TransportMode, read_frame, write_frame,
};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cert::Identity;
use crate::error::TransportError;
use crate::link::Link;
use crate::tls::{self, FingerprintPolicy};

const RELAY_CAPACITY: usize = 1024;
const INBOUND_CAPACITY: usize = 256;
const STOP_GRACE: Duration = Duration::from_secs(1);
const QUIC_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Peer configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// IP literal to bind to
    pub hostname: String,
    /// Port for both listeners (0 for OS-assigned)
    pub port: u16,
    pub enable_quic: bool,
    pub enable_tcp: bool,
    /// Accept QUIC 0-RTT data from resuming clients
    pub accept_0rtt: bool,
    /// Time a new link has to complete TLS and send `HELLO`
    pub handshake_timeout_ms: u64,
    /// Maximum concurrent sessions
    pub max_sessions: Option<usize>,
    /// Client certificate pins; empty accepts any (or no) client certificate
    pub trusted_fingerprints: Vec<String>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".into(),
            port: 4433,
            enable_quic: true,
            enable_tcp: true,
            accept_0rtt: true,
            handshake_timeout_ms: 10_000,
            max_sessions: Some(256),
            trusted_fingerprints: Vec::new(),
        }
    }
}

struct SessionEntry {
    mode: TransportMode,
    kill: CancellationToken,
    quic: Option<quinn::Connection>,
}

/// Shared state for the peer's accept loops and sessions.
struct PeerState {
    config: PeerConfig,
    node_id: String,
    /// Relay channel (any session → all sessions)
    relay_tx: broadcast::Sender<Frame>,
    sessions: DashMap<u64, SessionEntry>,
    next_session: AtomicU64,
    mute_pings: AtomicBool,
    shutdown: CancellationToken,
}

impl PeerState {
    fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.config.handshake_timeout_ms)
    }

    fn admit(&self) -> bool {
        match self.config.max_sessions {
            Some(max) if self.sessions.len() >= max => {
                warn!("connection rejected: max sessions reached ({max})");
                false
            }
            _ => true,
        }
    }
}

/// The accepting endpoint.
pub struct FleetPeer {
    state: Arc<PeerState>,
    /// Actual bound port
    port: u16,
    fingerprint: String,
    quic_endpoint: Option<quinn::Endpoint>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FleetPeer {
    /// Bind the enabled listeners and start accepting.
    pub async fn start(config: PeerConfig, identity: &Identity) -> Result<Self, TransportError> {
        if !config.enable_quic && !config.enable_tcp {
            return Err(TransportError::InvalidConfig(
                "peer needs at least one of QUIC or TCP enabled".into(),
            ));
        }
        let ip: IpAddr = config.hostname.parse().map_err(|e| {
            TransportError::InvalidConfig(format!("bind address {}: {e}", config.hostname))
        })?;

        let policy = FingerprintPolicy::new(config.trusted_fingerprints.iter().cloned());
        let (relay_tx, _) = broadcast::channel(RELAY_CAPACITY);
        let state = Arc::new(PeerState {
            config: config.clone(),
            node_id: uuid::Uuid::new_v4().to_string(),
            relay_tx,
            sessions: DashMap::new(),
            next_session: AtomicU64::new(0),
            mute_pings: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        let mut port = config.port;
        let mut tasks = Vec::new();

        if config.enable_tcp {
            let listener = TcpListener::bind(SocketAddr::new(ip, port)).await?;
            port = listener.local_addr()?.port();
            let acceptor = TlsAcceptor::from(Arc::new(tls::server_config(identity, policy.clone(), false)?));
            info!("fleet peer listening on tcp+tls://{ip}:{port}");
            tasks.push(tokio::spawn(tcp_accept_loop(Arc::clone(&state), listener, acceptor)));
        }

        let quic_endpoint = if config.enable_quic {
            let server_tls = tls::server_config(identity, policy, config.accept_0rtt)?;
            let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(server_tls)
                .map_err(|e| TransportError::Handshake(e.to_string()))?;
            let mut transport = quinn::TransportConfig::default();
            transport.keep_alive_interval(Some(QUIC_KEEP_ALIVE));
            let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
            server_config.transport_config(Arc::new(transport));

            let endpoint = quinn::Endpoint::server(server_config, SocketAddr::new(ip, port))?;
            port = endpoint.local_addr()?.port();
            info!("fleet peer listening on quic://{ip}:{port}");
            tasks.push(tokio::spawn(quic_accept_loop(Arc::clone(&state), endpoint.clone())));
            Some(endpoint)
        } else {
            None
        };

        Ok(Self {
            state,
            port,
            fingerprint: identity.fingerprint().to_string(),
            quic_endpoint,
            tasks: Mutex::new(tasks),
        })
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Fingerprint of the certificate this peer presents.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn session_count(&self) -> usize {
        self.state.sessions.len()
    }

    /// Number of live sessions using `mode`.
    pub fn session_count_for(&self, mode: TransportMode) -> usize {
        self.state.sessions.iter().filter(|s| s.mode == mode).count()
    }

    /// Send a data frame from the peer itself to every session.
    /// Returns how many sessions it was queued for.
    pub fn publish(&self, channel: &str, payload: impl Into<Bytes>) -> usize {
        // No receivers is fine
        self.state.relay_tx.send(Frame::data(channel, payload)).unwrap_or(0)
    }

    /// Stop answering keep-alive probes (sessions stay open).
    pub fn set_mute_pings(&self, muted: bool) {
        self.state.mute_pings.store(muted, Ordering::Relaxed);
    }

    /// Forcibly terminate every live session without a `GOODBYE`.
    /// Listeners keep accepting.
    pub fn disconnect_all(&self) -> usize {
        let mut terminated = 0;
        for entry in self.state.sessions.iter() {
            if let Some(connection) = &entry.quic {
                connection.close(1u32.into(), b"terminated");
            }
            entry.kill.cancel();
            terminated += 1;
        }
        info!("terminated {terminated} session(s)");
        terminated
    }

    /// Gracefully stop the peer. Idempotent.
    pub async fn stop(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if self.state.shutdown.is_cancelled() {
            return;
        }
        self.state.shutdown.cancel();

        for mut task in tasks {
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        if let Some(endpoint) = &self.quic_endpoint {
            endpoint.close(0u32.into(), b"peer stopped");
        }

        // Let sessions observe the shutdown and unregister.
        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        while !self.state.sessions.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        info!("fleet peer on port {} stopped", self.port);
    }
}

impl Drop for FleetPeer {
    fn drop(&mut self) {
        self.state.shutdown.cancel();
        if let Some(endpoint) = &self.quic_endpoint {
            endpoint.close(0u32.into(), b"peer dropped");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Accept loops
// ─────────────────────────────────────────────────────────────────────────────

async fn tcp_accept_loop(state: Arc<PeerState>, listener: TcpListener, acceptor: TlsAcceptor) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("TCP accept failed: {e}");
                    continue;
                }
            },
        };
        if !state.admit() {
            continue;
        }
        let _ = stream.set_nodelay(true);

        let state = Arc::clone(&state);
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let tls = match tokio::time::timeout(state.handshake_timeout(), acceptor.accept(stream)).await {
                Ok(Ok(tls)) => tls,
                Ok(Err(e)) => {
                    debug!("TLS accept from {addr} failed: {e}");
                    return;
                }
                Err(_) => {
                    debug!("TLS accept from {addr} timed out");
                    return;
                }
            };
            serve_session(state, Link::from_stream(TransportMode::TcpFallback, tls), addr).await;
        });
    }
    debug!("TCP accept loop stopped");
}

async fn quic_accept_loop(state: Arc<PeerState>, endpoint: quinn::Endpoint) {
    loop {
        let incoming = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => break,
            },
        };
        if !state.admit() {
            incoming.refuse();
            continue;
        }

        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let addr = incoming.remote_address();
            let connecting = match incoming.accept() {
                Ok(connecting) => connecting,
                Err(e) => {
                    debug!("QUIC accept from {addr} failed: {e}");
                    return;
                }
            };

            // Taking the connection at 0.5-RTT lets early HELLO frames through.
            let connection = if state.config.accept_0rtt {
                match connecting.into_0rtt() {
                    Ok((connection, _accepted)) => Ok(connection),
                    Err(connecting) => connecting.await,
                }
            } else {
                connecting.await
            };
            let connection = match connection {
                Ok(connection) => connection,
                Err(e) => {
                    debug!("QUIC handshake with {addr} failed: {e}");
                    return;
                }
            };

            let streams = tokio::time::timeout(state.handshake_timeout(), connection.accept_bi()).await;
            let (send, recv) = match streams {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    debug!("QUIC stream from {addr} not opened: {e}");
                    return;
                }
                Err(_) => {
                    debug!("QUIC stream from {addr} timed out");
                    connection.close(0u32.into(), b"handshake timeout");
                    return;
                }
            };
            serve_session(state, Link::quic(connection, send, recv), addr).await;
        });
    }
    debug!("QUIC accept loop stopped");
}

// ─────────────────────────────────────────────────────────────────────────────
// Session handler
// ─────────────────────────────────────────────────────────────────────────────

async fn serve_session(state: Arc<PeerState>, mut link: Link, addr: SocketAddr) {
    let mode = link.mode();

    let hello = match tokio::time::timeout(state.handshake_timeout(), read_frame(link.reader())).await {
        Ok(Ok(Some(frame))) if frame.kind == FrameKind::Hello => frame,
        Ok(Ok(_)) => {
            debug!("{addr} did not open with HELLO");
            return;
        }
        Ok(Err(e)) => {
            debug!("reading HELLO from {addr} failed: {e}");
            return;
        }
        Err(_) => {
            warn!("HELLO timeout for {addr}");
            return;
        }
    };
    let hello = match hello.parse_hello() {
        Ok(hello) => hello,
        Err(e) => {
            warn!("malformed HELLO from {addr}: {e}");
            return;
        }
    };
    if hello.version != PROTOCOL_VERSION {
        warn!("{addr} speaks protocol version {}, closing", hello.version);
        let _ = write_frame(link.writer(), &Frame::control(FrameKind::Goodbye)).await;
        return;
    }

    let ack = Hello {
        version: PROTOCOL_VERSION.into(),
        node_id: state.node_id.clone(),
    };
    let ack = match Frame::hello(FrameKind::HelloAck, &ack) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("encoding HELLO_ACK failed: {e}");
            return;
        }
    };
    if let Err(e) = write_frame(link.writer(), &ack).await {
        debug!("sending HELLO_ACK to {addr} failed: {e}");
        return;
    }

    let (mut reader, mut writer, control) = link.into_parts();
    let session_id = state.next_session.fetch_add(1, Ordering::Relaxed) + 1;
    let kill = state.shutdown.child_token();
    // Subscribe before registering so nothing published after the count is visible is missed.
    let mut relay_rx = state.relay_tx.subscribe();
    state.sessions.insert(
        session_id,
        SessionEntry {
            mode,
            kill: kill.clone(),
            quic: control.connection(),
        },
    );
    info!(
        "session {session_id} opened: {addr} via {mode} (node {}, total: {})",
        hello.node_id,
        state.sessions.len()
    );

    // Reads go through a task so the select below stays cancel-safe.
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<Frame>(INBOUND_CAPACITY);
    let reader_task = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => {
                    if inbound_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("session read failed: {e}");
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            _ = kill.cancelled() => break,

            inbound = inbound_rx.recv() => {
                let Some(frame) = inbound else { break };
                match frame.kind {
                    FrameKind::Data => {
                        let _ = state.relay_tx.send(frame);
                    }
                    FrameKind::Ping => {
                        if !state.mute_pings.load(Ordering::Relaxed)
                            && write_frame(&mut writer, &Frame::pong(&frame)).await.is_err()
                        {
                            break;
                        }
                    }
                    FrameKind::Goodbye => {
                        debug!("session {session_id} said goodbye");
                        break;
                    }
                    FrameKind::Hello | FrameKind::HelloAck | FrameKind::Pong => {}
                }
            }

            relayed = relay_rx.recv() => match relayed {
                Ok(frame) => {
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        debug!("relay to session {session_id} failed: {e}");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("session {session_id} lagged, {skipped} frame(s) dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    reader_task.abort();
    state.sessions.remove(&session_id);

    // A stopping peer says goodbye; a terminated session just drops.
    if state.shutdown.is_cancelled() {
        let _ = write_frame(&mut writer, &Frame::control(FrameKind::Goodbye)).await;
        let _ = writer.shutdown().await;
    }
    control.close("session ended");
    info!("session {session_id} closed (total: {})", state.sessions.len());
}
