//! Client-side transport configuration.
//!
//! Field names on the wire are stable (`enable0RTT`, `enableTCPFallback`,
//! ...) so config files written for other fleet components load unchanged.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportConfig {
    /// Peer host name or IP literal.
    pub host: String,
    /// Peer port, shared by QUIC (UDP) and the TCP fallback.
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    #[serde(rename = "enable0RTT")]
    pub enable_0rtt: bool,
    pub max_concurrent_streams: u32,
    #[serde(rename = "enableTCPFallback")]
    pub enable_tcp_fallback: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Cap applied to the exponential backoff.
    pub max_retry_delay_ms: u64,
    pub connection_timeout_ms: u64,
    pub keep_alive: bool,
    pub keep_alive_interval_ms: u64,
    /// `sha256:<hex>` pins for the peer certificate. Empty trusts any
    /// certificate (development mode).
    pub trusted_fingerprints: Vec<String>,
    /// TLS server name; defaults to `host`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 4433,
            cert_path: None,
            key_path: None,
            enable_0rtt: true,
            max_concurrent_streams: 100,
            enable_tcp_fallback: true,
            max_retries: 5,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 30_000,
            connection_timeout_ms: 10_000,
            keep_alive: true,
            keep_alive_interval_ms: 30_000,
            trusted_fingerprints: Vec::new(),
            server_name: None,
        }
    }
}

impl TransportConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_certificate(mut self, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        self.cert_path = Some(cert_path.into());
        self.key_path = Some(key_path.into());
        self
    }

    pub fn with_0rtt(mut self, enabled: bool) -> Self {
        self.enable_0rtt = enabled;
        self
    }

    pub fn with_tcp_fallback(mut self, enabled: bool) -> Self {
        self.enable_tcp_fallback = enabled;
        self
    }

    pub fn with_max_concurrent_streams(mut self, streams: u32) -> Self {
        self.max_concurrent_streams = streams;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = delay_ms;
        self
    }

    pub fn with_max_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.max_retry_delay_ms = delay_ms;
        self
    }

    pub fn with_connection_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connection_timeout_ms = timeout_ms;
        self
    }

    pub fn with_keep_alive(mut self, enabled: bool, interval_ms: u64) -> Self {
        self.keep_alive = enabled;
        self.keep_alive_interval_ms = interval_ms;
        self
    }

    pub fn with_trusted_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.trusted_fingerprints.push(fingerprint.into());
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    /// Name presented via SNI and checked against the peer certificate.
    pub fn sni(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.host)
    }

    /// Capacity of the outbound frame queue feeding the single writer.
    pub fn outbound_capacity(&self) -> usize {
        (self.max_concurrent_streams as usize).saturating_mul(16).max(16)
    }

    pub fn from_json_str(json: &str) -> Result<Self, TransportError> {
        serde_json::from_str(json).map_err(|e| TransportError::InvalidConfig(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self, TransportError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| TransportError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        let invalid = |msg: &str| Err(TransportError::InvalidConfig(msg.to_string()));

        if self.host.trim().is_empty() {
            return invalid("host must not be empty");
        }
        if self.port == 0 {
            return invalid("port must not be zero");
        }
        if self.connection_timeout_ms == 0 {
            return invalid("connectionTimeoutMs must be greater than zero");
        }
        if self.keep_alive && self.keep_alive_interval_ms == 0 {
            return invalid("keepAliveIntervalMs must be greater than zero");
        }
        if self.max_concurrent_streams == 0 {
            return invalid("maxConcurrentStreams must be greater than zero");
        }
        if self.retry_delay_ms > self.max_retry_delay_ms {
            return invalid("retryDelayMs must not exceed maxRetryDelayMs");
        }
        if self.cert_path.is_some() != self.key_path.is_some() {
            return Err(TransportError::CertificateLoad(
                "certPath and keyPath must be supplied together".into(),
            ));
        }
        Ok(())
    }
}
