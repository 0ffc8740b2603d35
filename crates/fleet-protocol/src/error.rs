//! Error kinds and frame codec errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport error taxonomy, as seen by lifecycle listeners.
///
/// Concrete error types in the transport crate map onto exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    CertificateLoad,
    HandshakeTimeout,
    Handshake,
    NotConnected,
    ConnectionLost,
    RetriesExhausted,
    AlreadyInitialized,
    AlreadyClosed,
    Subscriber,
    Frame,
    InvalidConfig,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CertificateLoad => "certificate-load",
            Self::HandshakeTimeout => "handshake-timeout",
            Self::Handshake => "handshake",
            Self::NotConnected => "not-connected",
            Self::ConnectionLost => "connection-lost",
            Self::RetriesExhausted => "retries-exhausted",
            Self::AlreadyInitialized => "already-initialized",
            Self::AlreadyClosed => "already-closed",
            Self::Subscriber => "subscriber",
            Self::Frame => "frame",
            Self::InvalidConfig => "invalid-config",
        }
    }

    /// Numeric code for log pipelines that key on integers (-32100 to -32110).
    pub fn code(&self) -> i32 {
        match self {
            Self::CertificateLoad => -32100,
            Self::HandshakeTimeout => -32101,
            Self::Handshake => -32102,
            Self::NotConnected => -32103,
            Self::ConnectionLost => -32104,
            Self::RetriesExhausted => -32105,
            Self::AlreadyInitialized => -32106,
            Self::AlreadyClosed => -32107,
            Self::Subscriber => -32108,
            Self::Frame => -32109,
            Self::InvalidConfig => -32110,
        }
    }

    /// Whether the kind concerns the whole connection rather than one call.
    pub fn is_connection_wide(&self) -> bool {
        matches!(
            self,
            Self::HandshakeTimeout | Self::Handshake | Self::ConnectionLost | Self::RetriesExhausted
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },

    #[error("frame truncated: {0}")]
    Truncated(&'static str),

    #[error("unknown frame kind: {0:#04x}")]
    UnknownKind(u8),

    #[error("channel name is not valid UTF-8")]
    InvalidChannel,

    #[error("channel name too long: {0} bytes")]
    ChannelTooLong(usize),

    #[error("malformed handshake payload: {0}")]
    Handshake(#[from] serde_json::Error),
}
