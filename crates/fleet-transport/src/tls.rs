//! rustls configuration for both link flavours.
//!
//! Both sides run TLS 1.3 on the ring provider with ALPN `fleet/1`.
//! Certificates are self-signed, so chain building is replaced by
//! fingerprint pinning; an empty pin list accepts any certificate
//! (development trust). Handshake signatures are always verified.

use std::sync::{Arc, LazyLock};

use fleet_protocol::ALPN_FLEET;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, Error as TlsError, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tracing::debug;

use crate::cert::{Identity, fingerprint};
use crate::error::TransportError;

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn signature_algorithms() -> &'static WebPkiSupportedAlgorithms {
    static ALGORITHMS: LazyLock<WebPkiSupportedAlgorithms> =
        LazyLock::new(|| rustls::crypto::ring::default_provider().signature_verification_algorithms);
    &ALGORITHMS
}

/// Fingerprint pin check shared by the server and client verifiers.
#[derive(Debug, Clone, Default)]
pub struct FingerprintPolicy {
    pins: Vec<String>,
}

impl FingerprintPolicy {
    pub fn new(pins: impl IntoIterator<Item = String>) -> Self {
        Self {
            pins: pins.into_iter().map(|p| p.to_ascii_lowercase()).collect(),
        }
    }

    pub fn is_development(&self) -> bool {
        self.pins.is_empty()
    }

    fn check(&self, end_entity: &CertificateDer<'_>) -> Result<(), TlsError> {
        let presented = fingerprint(end_entity.as_ref());
        if self.pins.is_empty() {
            debug!(fingerprint = %presented, "accepting unpinned certificate (development trust)");
            return Ok(());
        }
        if self.pins.iter().any(|pin| *pin == presented) {
            Ok(())
        } else {
            Err(TlsError::General(format!("certificate {presented} is not pinned")))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Verifiers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct PinnedServerVerifier {
    policy: FingerprintPolicy,
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        self.policy.check(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, signature_algorithms())
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, signature_algorithms())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        signature_algorithms().supported_schemes()
    }
}

/// Client certificates are optional; when presented they must satisfy the pins.
#[derive(Debug)]
struct OptionalClientVerifier {
    policy: FingerprintPolicy,
}

impl ClientCertVerifier for OptionalClientVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, TlsError> {
        self.policy.check(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, signature_algorithms())
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, signature_algorithms())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        signature_algorithms().supported_schemes()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config builders
// ─────────────────────────────────────────────────────────────────────────────

/// Client config presenting `identity` and pinning the server against `policy`.
///
/// One instance should be reused across reconnects: its resumption store
/// holds the session tickets that make 0-RTT possible.
pub fn client_config(
    identity: &Identity,
    policy: FingerprintPolicy,
    enable_early_data: bool,
) -> Result<rustls::ClientConfig, TransportError> {
    let verifier: Arc<dyn ServerCertVerifier> = Arc::new(PinnedServerVerifier { policy });

    let mut config = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(identity.cert_chain(), identity.private_key())?;

    config.alpn_protocols = vec![ALPN_FLEET.to_vec()];
    config.enable_early_data = enable_early_data;
    Ok(config)
}

/// Server config for the peer. `early_data` must be set only for QUIC,
/// where rustls requires the limit to be either 0 or `u32::MAX`.
pub fn server_config(
    identity: &Identity,
    policy: FingerprintPolicy,
    early_data: bool,
) -> Result<rustls::ServerConfig, TransportError> {
    let verifier: Arc<dyn ClientCertVerifier> = Arc::new(OptionalClientVerifier { policy });

    let mut config = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_client_cert_verifier(verifier)
        .with_single_cert(identity.cert_chain(), identity.private_key())?;

    config.alpn_protocols = vec![ALPN_FLEET.to_vec()];
    if early_data {
        config.max_early_data_size = u32::MAX;
    }
    Ok(config)
}
