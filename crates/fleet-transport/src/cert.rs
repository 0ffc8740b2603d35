//! TLS identity: load from PEM files or generate a self-signed one.
//!
//! Generated identities cover `localhost`, `127.0.0.1`, `::1` and the
//! machine host name, and are valid for 30 days starting one hour in the
//! past to tolerate clock skew between fleet nodes.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::error::TransportError;

const VALIDITY_DAYS: i64 = 30;

/// Backdating applied to `not_before`.
const CLOCK_SKEW_SECS: i64 = 3600;

/// Fraction of the validity window after which rotation is advised.
const ROTATION_THRESHOLD: f64 = 0.75;

/// `sha256:<hex>` fingerprint of a DER certificate.
pub fn fingerprint(der: &[u8]) -> String {
    let hash = Sha256::digest(der);
    format!("sha256:{}", hex::encode(hash))
}

/// A certificate chain plus its private key.
pub struct Identity {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    cert_pem: String,
    key_pem: String,
    fingerprint: String,
    /// Validity window in Unix seconds; only known for generated identities.
    validity: Option<(i64, i64)>,
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
            cert_pem: self.cert_pem.clone(),
            key_pem: self.key_pem.clone(),
            fingerprint: self.fingerprint.clone(),
            validity: self.validity,
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint)
            .field("chain_len", &self.cert_chain.len())
            .field("validity", &self.validity)
            .finish_non_exhaustive()
    }
}

impl Identity {
    pub fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        self.cert_chain.clone()
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }

    /// Fingerprint of the leaf certificate.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn is_generated(&self) -> bool {
        self.validity.is_some()
    }

    pub fn not_after_epoch(&self) -> Option<i64> {
        self.validity.map(|(_, not_after)| not_after)
    }

    /// True once 75% of the validity window has elapsed. Loaded identities
    /// are managed externally and always report `false`.
    pub fn needs_rotation(&self, now_epoch_secs: i64) -> bool {
        let Some((not_before, not_after)) = self.validity else {
            return false;
        };
        let total = (not_after - not_before) as f64;
        if total <= 0.0 {
            return true;
        }
        let elapsed = (now_epoch_secs - not_before) as f64;
        elapsed / total >= ROTATION_THRESHOLD
    }

    /// Write `cert.pem` and `key.pem` into `dir` so a later run can load them.
    pub fn persist(&self, dir: &Path) -> Result<(PathBuf, PathBuf), TransportError> {
        let write_err = |path: &Path, e: std::io::Error| {
            TransportError::CertificateLoad(format!("{}: {e}", path.display()))
        };

        std::fs::create_dir_all(dir).map_err(|e| write_err(dir, e))?;
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");

        std::fs::write(&cert_path, &self.cert_pem).map_err(|e| write_err(&cert_path, e))?;
        write_private(&key_path, self.key_pem.as_bytes()).map_err(|e| write_err(&key_path, e))?;

        Ok((cert_path, key_path))
    }
}

/// Write a file readable only by the owner from the moment it exists.
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    std::os::unix::fs::OpenOptionsExt::mode(&mut options, 0o600);

    let mut file = options.open(path)?;
    #[cfg(unix)]
    {
        // `mode` only applies on creation; tighten a pre-existing file too.
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(contents)?;
    file.sync_all()
}

/// Obtains the TLS identity used by both ends of a link.
#[derive(Debug, Clone, Default)]
pub struct CertificateProvider {
    extra_names: Vec<String>,
}

impl CertificateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subject alternative name to generated identities.
    pub fn with_subject_alt_name(mut self, name: impl Into<String>) -> Self {
        self.extra_names.push(name.into());
        self
    }

    /// Load from disk when both paths are given, generate when neither is.
    pub fn load_or_generate(
        &self,
        cert_path: Option<&Path>,
        key_path: Option<&Path>,
    ) -> Result<Identity, TransportError> {
        match (cert_path, key_path) {
            (Some(cert), Some(key)) => self.load(cert, key),
            (None, None) => self.generate(),
            _ => Err(TransportError::CertificateLoad(
                "certificate and key paths must be supplied together".into(),
            )),
        }
    }

    pub fn load(&self, cert_path: &Path, key_path: &Path) -> Result<Identity, TransportError> {
        let read = |path: &Path| {
            std::fs::read_to_string(path)
                .map_err(|e| TransportError::CertificateLoad(format!("{}: {e}", path.display())))
        };
        let cert_pem = read(cert_path)?;
        let key_pem = read(key_path)?;

        let cert_chain = CertificateDer::pem_slice_iter(cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                TransportError::CertificateLoad(format!("{}: {e}", cert_path.display()))
            })?;
        let Some(leaf) = cert_chain.first() else {
            return Err(TransportError::CertificateLoad(format!(
                "{}: no CERTIFICATE block found",
                cert_path.display()
            )));
        };
        let fingerprint = fingerprint(leaf.as_ref());

        let key = PrivateKeyDer::from_pem_slice(key_pem.as_bytes())
            .map_err(|e| TransportError::CertificateLoad(format!("{}: {e}", key_path.display())))?;

        // Reject keys the TLS stack cannot sign with before any socket opens.
        rustls::crypto::ring::default_provider()
            .key_provider
            .load_private_key(key.clone_key())
            .map_err(|e| TransportError::CertificateLoad(format!("{}: {e}", key_path.display())))?;

        info!(cert = %cert_path.display(), %fingerprint, "loaded TLS identity");

        Ok(Identity {
            cert_chain,
            key,
            cert_pem,
            key_pem,
            fingerprint,
            validity: None,
        })
    }

    pub fn generate(&self) -> Result<Identity, TransportError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        self.generate_at(now)
    }

    /// Generate a self-signed identity whose window is anchored at `now_epoch_secs`.
    pub fn generate_at(&self, now_epoch_secs: i64) -> Result<Identity, TransportError> {
        let gen_err = |e: &dyn std::fmt::Display| TransportError::CertificateLoad(e.to_string());

        let not_before_epoch = now_epoch_secs - CLOCK_SKEW_SECS;
        let not_after_epoch = not_before_epoch + VALIDITY_DAYS * 86_400;

        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).map_err(|e| gen_err(&e))?;
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "fleet-transport");
        params.subject_alt_names = self.subject_alt_names();
        params.not_before = OffsetDateTime::from_unix_timestamp(not_before_epoch).map_err(|e| gen_err(&e))?;
        params.not_after = OffsetDateTime::from_unix_timestamp(not_after_epoch).map_err(|e| gen_err(&e))?;

        let key_pair = rcgen::KeyPair::generate().map_err(|e| gen_err(&e))?;
        let cert = params.self_signed(&key_pair).map_err(|e| gen_err(&e))?;

        let fingerprint = fingerprint(cert.der());
        debug!(%fingerprint, "generated self-signed TLS identity");

        Ok(Identity {
            cert_chain: vec![cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            fingerprint,
            validity: Some((not_before_epoch, not_after_epoch)),
        })
    }

    fn subject_alt_names(&self) -> Vec<rcgen::SanType> {
        let mut names = vec![
            "localhost".to_string(),
            "127.0.0.1".to_string(),
            "::1".to_string(),
        ];
        if let Ok(host) = hostname::get() {
            let host = host.to_string_lossy().to_string();
            if !host.is_empty() && !names.contains(&host) {
                names.push(host);
            }
        }
        for name in &self.extra_names {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }

        names
            .into_iter()
            .filter_map(|name| match name.parse::<std::net::IpAddr>() {
                Ok(ip) => Some(rcgen::SanType::IpAddress(ip)),
                // Host names with characters outside IA5 are skipped
                Err(_) => name.try_into().ok().map(rcgen::SanType::DnsName),
            })
            .collect()
    }
}
