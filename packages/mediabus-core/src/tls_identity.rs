//! Long-lived self-signed TLS identity for the service hostname.
//!
//! Browsers trust the certificate on first use; keeping the same key pair
//! across restarts is what makes that stick. The DER material is persisted
//! in an owner-only identity file next to the rest of the store - the host
//! filesystem is the trust boundary here, not the encoding.

use std::fs;
use std::path::{Path, PathBuf};

use rcgen::{CertificateParams, DnType, KeyPair};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::now_millis;

const IDENTITY_FILE: &str = "tls_identity.json";

/// Validity window for a freshly generated certificate: 10 years.
const VALIDITY_DAYS: i64 = 3650;

/// Errors from certificate generation or persistence.
#[derive(Debug, Error)]
pub enum TlsIdentityError {
    #[error("TLS identity I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("certificate generation failed: {0}")]
    Generation(String),
}

/// A certificate and private key pair in DER form, ready for the TLS acceptor.
#[derive(Clone)]
pub struct TlsIdentity {
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct PersistedIdentity {
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
    created_at_ms: u64,
    not_after_ms: u64,
}

impl TlsIdentity {
    /// Loads the persisted identity for `hostname`, generating a new one when
    /// the stored entry is missing, unparsable, or expired.
    pub fn acquire(data_dir: &Path, hostname: &str) -> Result<Self, TlsIdentityError> {
        let path = data_dir.join(IDENTITY_FILE);
        let now = now_millis();

        match load_persisted(&path) {
            Some(persisted) if persisted.not_after_ms > now => {
                return Ok(Self {
                    cert_der: persisted.cert_der,
                    key_der: persisted.key_der,
                });
            }
            Some(_) => log::info!("[TLS] Stored certificate expired, regenerating"),
            None => log::info!("[TLS] No usable TLS identity, generating one for {}", hostname),
        }

        let identity = generate(hostname, now)?;
        persist(&path, &identity)?;
        Ok(Self {
            cert_der: identity.cert_der,
            key_der: identity.key_der,
        })
    }

    /// Certificate in DER encoding.
    #[must_use]
    pub fn cert_der(&self) -> Vec<u8> {
        self.cert_der.clone()
    }

    /// PKCS#8 private key in DER encoding.
    #[must_use]
    pub fn key_der(&self) -> Vec<u8> {
        self.key_der.clone()
    }
}

fn load_persisted(path: &Path) -> Option<PersistedIdentity> {
    let data = fs::read(path).ok()?;
    match serde_json::from_slice(&data) {
        Ok(persisted) => Some(persisted),
        Err(e) => {
            log::warn!("[TLS] Failed to parse stored identity: {}", e);
            None
        }
    }
}

fn generate(hostname: &str, now: u64) -> Result<PersistedIdentity, TlsIdentityError> {
    let mut params = CertificateParams::new(vec![hostname.to_string()])
        .map_err(|e| TlsIdentityError::Generation(e.to_string()))?;
    params
        .distinguished_name
        .push(DnType::CommonName, hostname);
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + time::Duration::days(VALIDITY_DAYS);

    let key_pair = KeyPair::generate().map_err(|e| TlsIdentityError::Generation(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TlsIdentityError::Generation(e.to_string()))?;

    Ok(PersistedIdentity {
        cert_der: cert.der().to_vec(),
        key_der: key_pair.serialize_der(),
        created_at_ms: now,
        not_after_ms: now + (VALIDITY_DAYS as u64) * 24 * 60 * 60 * 1000,
    })
}

fn persist(path: &Path, identity: &PersistedIdentity) -> Result<(), TlsIdentityError> {
    let data = serde_json::to_vec_pretty(identity)
        .map_err(|e| TlsIdentityError::Generation(e.to_string()))?;

    let tmp: PathBuf = path.with_extension("json.tmp");
    fs::write(&tmp, &data)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        if let Err(e) = fs::set_permissions(&tmp, perms) {
            log::warn!("[TLS] Failed to restrict identity file permissions: {}", e);
        }
    }

    let file = fs::File::open(&tmp)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}
