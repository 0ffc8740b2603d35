//! Transport error type.

use std::time::Duration;

use fleet_protocol::{ConnectionState, ErrorKind, FrameError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("certificate load failed: {0}")]
    CertificateLoad(String),

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("not connected (state: {0})")]
    NotConnected(ConnectionState),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("retries exhausted after {attempts} rounds: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("transport already initialized")]
    AlreadyInitialized,

    #[error("transport already closed")]
    AlreadyClosed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("QUIC connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("QUIC connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}

impl TransportError {
    /// The taxonomy entry this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CertificateLoad(_) => ErrorKind::CertificateLoad,
            Self::HandshakeTimeout(_) => ErrorKind::HandshakeTimeout,
            Self::Handshake(_) | Self::Connect(_) | Self::Tls(_) => ErrorKind::Handshake,
            Self::Connection(quinn::ConnectionError::TimedOut) => ErrorKind::HandshakeTimeout,
            Self::Connection(_) => ErrorKind::Handshake,
            Self::NotConnected(_) => ErrorKind::NotConnected,
            Self::ConnectionLost(_) | Self::Io(_) => ErrorKind::ConnectionLost,
            Self::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            Self::AlreadyInitialized => ErrorKind::AlreadyInitialized,
            Self::AlreadyClosed => ErrorKind::AlreadyClosed,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::Frame(_) => ErrorKind::Frame,
        }
    }
}
