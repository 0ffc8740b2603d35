//! Raw links and the dialer seam.
//!
//! A [`Link`] is one ordered, bidirectional byte stream to the peer plus the
//! QUIC connection handle when there is one. The state machine never opens
//! sockets itself; it asks a [`Dialer`] for a link in a given mode, which is
//! what lets tests substitute in-memory links.

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use fleet_protocol::TransportMode;
use parking_lot::Mutex;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::cert::Identity;
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::tls::{self, FingerprintPolicy};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Resolves to `true` when the peer accepted 0-RTT data.
pub type EarlyData = Pin<Box<dyn Future<Output = bool> + Send>>;

pub type DialFuture<'a> = Pin<Box<dyn Future<Output = Result<Link, TransportError>> + Send + 'a>>;

/// Produces links to the configured peer.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self, mode: TransportMode) -> DialFuture<'_>;

    /// Release endpoint resources. Called once when the transport closes.
    fn shutdown(&self) {}
}

pub struct Link {
    mode: TransportMode,
    reader: BoxedReader,
    writer: BoxedWriter,
    quic: Option<quinn::Connection>,
    address: Option<watch::Receiver<SocketAddr>>,
    early_data: Option<EarlyData>,
}

impl Link {
    pub fn new(mode: TransportMode, reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            mode,
            reader,
            writer,
            quic: None,
            address: None,
            early_data: None,
        }
    }

    /// Wrap any duplex stream (TLS over TCP, or an in-memory pipe).
    pub fn from_stream<S>(mode: TransportMode, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(mode, Box::new(reader), Box::new(writer))
    }

    pub fn quic(connection: quinn::Connection, send: quinn::SendStream, recv: quinn::RecvStream) -> Self {
        Self {
            mode: TransportMode::Quic,
            reader: Box::new(recv),
            writer: Box::new(send),
            quic: Some(connection),
            address: None,
            early_data: None,
        }
    }

    /// Report the peer address from `address` for links that can move
    /// without a QUIC connection underneath.
    pub fn with_remote_address(mut self, address: watch::Receiver<SocketAddr>) -> Self {
        self.address = Some(address);
        self
    }

    /// Mark the first bytes written on this link as 0-RTT data.
    pub fn with_early_data<F>(mut self, accepted: F) -> Self
    where
        F: Future<Output = bool> + Send + 'static,
    {
        self.early_data = Some(Box::pin(accepted));
        self
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        remote_address(self.quic.as_ref(), self.address.as_ref())
    }

    pub(crate) fn take_early_data(&mut self) -> Option<EarlyData> {
        self.early_data.take()
    }

    /// Replace the stream after rejected 0-RTT data. Streams opened during
    /// 0-RTT are unusable once the peer rejects it, so QUIC links open a
    /// fresh bidirectional stream; other links keep theirs.
    pub(crate) async fn reopen_stream(&mut self) -> Result<(), TransportError> {
        if let Some(connection) = &self.quic {
            let (send, recv) = connection.open_bi().await?;
            self.reader = Box::new(recv);
            self.writer = Box::new(send);
        }
        Ok(())
    }

    pub(crate) fn reader(&mut self) -> &mut BoxedReader {
        &mut self.reader
    }

    pub(crate) fn writer(&mut self) -> &mut BoxedWriter {
        &mut self.writer
    }

    pub(crate) fn into_parts(self) -> (BoxedReader, BoxedWriter, LinkControl) {
        let control = LinkControl {
            quic: self.quic,
            address: self.address,
        };
        (self.reader, self.writer, control)
    }
}

fn remote_address(
    quic: Option<&quinn::Connection>,
    address: Option<&watch::Receiver<SocketAddr>>,
) -> Option<SocketAddr> {
    quic.map(|c| c.remote_address())
        .or_else(|| address.map(|a| *a.borrow()))
}

/// What remains of a link once its halves are handed to the I/O tasks.
pub(crate) struct LinkControl {
    quic: Option<quinn::Connection>,
    address: Option<watch::Receiver<SocketAddr>>,
}

impl LinkControl {
    pub(crate) fn remote_address(&self) -> Option<SocketAddr> {
        remote_address(self.quic.as_ref(), self.address.as_ref())
    }

    pub(crate) fn connection(&self) -> Option<quinn::Connection> {
        self.quic.clone()
    }

    pub(crate) fn close(&self, reason: &'static str) {
        if let Some(connection) = &self.quic {
            connection.close(0u32.into(), reason.as_bytes());
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Network dialer
// ─────────────────────────────────────────────────────────────────────────────

/// QUIC keep-alive below the idle timeout so quiet links stay open.
const QUIC_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Dials the configured peer over QUIC or TCP+TLS.
pub struct NetworkDialer {
    host: String,
    port: u16,
    server_name: String,
    enable_0rtt: bool,
    quic_config: quinn::ClientConfig,
    tcp_connector: tokio_rustls::TlsConnector,
    endpoint: Mutex<Option<quinn::Endpoint>>,
    /// `(host, port)` pairs we completed a QUIC handshake with, i.e. that
    /// may have handed us a session ticket.
    resumable: Mutex<HashSet<(String, u16)>>,
}

impl NetworkDialer {
    pub fn new(config: &TransportConfig, identity: &Identity) -> Result<Self, TransportError> {
        let policy = FingerprintPolicy::new(config.trusted_fingerprints.iter().cloned());
        if policy.is_development() {
            info!("no certificate pins configured, trusting any peer certificate");
        }

        let quic_tls = Arc::new(tls::client_config(identity, policy.clone(), config.enable_0rtt)?);
        let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(quic_tls)
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        let mut transport = quinn::TransportConfig::default();
        transport
            .max_concurrent_bidi_streams(quinn::VarInt::from_u32(config.max_concurrent_streams))
            .keep_alive_interval(Some(QUIC_KEEP_ALIVE));
        let mut quic_config = quinn::ClientConfig::new(Arc::new(quic_crypto));
        quic_config.transport_config(Arc::new(transport));

        let tcp_tls = tls::client_config(identity, policy, false)?;

        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            server_name: config.sni().to_string(),
            enable_0rtt: config.enable_0rtt,
            quic_config,
            tcp_connector: tokio_rustls::TlsConnector::from(Arc::new(tcp_tls)),
            endpoint: Mutex::new(None),
            resumable: Mutex::new(HashSet::new()),
        })
    }

    async fn resolve(&self) -> Result<SocketAddr, TransportError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .collect();
        // Peers usually bind IPv4; prefer it when a name resolves to both.
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| TransportError::Handshake(format!("{} did not resolve", self.host)))
    }

    fn endpoint_for(&self, target: SocketAddr) -> Result<quinn::Endpoint, TransportError> {
        let mut slot = self.endpoint.lock();
        if let Some(endpoint) = slot.as_ref() {
            let same_family = endpoint
                .local_addr()
                .map(|local| local.is_ipv4() == target.is_ipv4())
                .unwrap_or(false);
            if same_family {
                return Ok(endpoint.clone());
            }
        }

        let bind: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let endpoint = quinn::Endpoint::client(bind)?;
        debug!(local = ?endpoint.local_addr().ok(), "QUIC client endpoint bound");
        *slot = Some(endpoint.clone());
        Ok(endpoint)
    }

    async fn dial_quic(&self) -> Result<Link, TransportError> {
        let addr = self.resolve().await?;
        let endpoint = self.endpoint_for(addr)?;
        let connecting = endpoint.connect_with(self.quic_config.clone(), addr, &self.server_name)?;

        let key = (self.host.clone(), self.port);
        let try_0rtt = self.enable_0rtt && self.resumable.lock().contains(&key);

        let link = if try_0rtt {
            match connecting.into_0rtt() {
                Ok((connection, accepted)) => {
                    debug!(%addr, "resuming with 0-RTT");
                    let (send, recv) = connection.open_bi().await?;
                    Link::quic(connection, send, recv).with_early_data(accepted)
                }
                Err(connecting) => {
                    debug!(%addr, "no usable session ticket, full handshake");
                    open_stream(connecting.await?).await?
                }
            }
        } else {
            open_stream(connecting.await?).await?
        };

        self.resumable.lock().insert(key);
        Ok(link)
    }

    async fn dial_tcp(&self) -> Result<Link, TransportError> {
        let addr = self.resolve().await?;
        let stream = tokio::net::TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        let server_name = ServerName::try_from(self.server_name.clone())
            .map_err(|e| TransportError::Handshake(format!("invalid server name: {e}")))?;
        let tls_stream = self.tcp_connector.connect(server_name, stream).await?;
        Ok(Link::from_stream(TransportMode::TcpFallback, tls_stream))
    }
}

async fn open_stream(connection: quinn::Connection) -> Result<Link, TransportError> {
    let (send, recv) = connection.open_bi().await?;
    Ok(Link::quic(connection, send, recv))
}

impl Dialer for NetworkDialer {
    fn dial(&self, mode: TransportMode) -> DialFuture<'_> {
        Box::pin(async move {
            match mode {
                TransportMode::TcpFallback => self.dial_tcp().await,
                TransportMode::Quic | TransportMode::Uninitialized => self.dial_quic().await,
            }
        })
    }

    fn shutdown(&self) {
        if let Some(endpoint) = self.endpoint.lock().take() {
            endpoint.close(0u32.into(), b"transport closed");
        }
    }
}
