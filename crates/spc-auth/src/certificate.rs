//! X.509 client certificates for app-only authentication.
//!
//! Certificates can be resolved from a file (PKCS#12 or PEM bundle), from a
//! [`CertificateStore`] by thumbprint, from a PEM certificate/key pair, or from
//! a base64 blob. Every resolver either returns a [`Certificate`] with a
//! usable RSA private key or fails before any network call is made.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use jsonwebtoken::EncodingKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::errors::{Result, ScAuthError};

const TAG_CERTIFICATE: &str = "CERTIFICATE";
const TAG_PKCS8_KEY: &str = "PRIVATE KEY";
const TAG_PKCS1_KEY: &str = "RSA PRIVATE KEY";
const TAG_ENCRYPTED_KEY: &str = "ENCRYPTED PRIVATE KEY";

/// Where a certificate was loaded from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateSource {
    File(PathBuf),
    Store,
    Pem,
    Base64,
}

/// DER encoded private key together with its PEM label
pub(crate) struct PrivateKey {
    tag: &'static str,
    der: Zeroizing<Vec<u8>>,
}

impl PrivateKey {
    fn to_pem(&self) -> Zeroizing<String> {
        Zeroizing::new(pem::encode(&pem::Pem::new(self.tag, self.der.to_vec())))
    }

    pub(crate) fn der(&self) -> &[u8] {
        &self.der
    }
}

/// A client-authentication certificate and, usually, its private key
pub struct Certificate {
    der: Vec<u8>,
    subject: String,
    not_after: Option<DateTime<Utc>>,
    sha1_thumbprint: String,
    sha256_thumbprint: String,
    x5t: String,
    private_key: RwLock<Option<PrivateKey>>,
    source: CertificateSource,
}

impl Certificate {
    fn from_parts(
        der: Vec<u8>,
        private_key: Option<PrivateKey>,
        source: CertificateSource,
    ) -> Result<Self> {
        let (_, parsed) = x509_parser::parse_x509_certificate(&der)
            .map_err(|e| ScAuthError::CertificateLoad(format!("Invalid X.509 certificate: {e}")))?;

        let subject = parsed.subject().to_string();
        let not_after = DateTime::from_timestamp(parsed.validity().not_after.timestamp(), 0);

        let sha1 = Sha1::digest(&der);
        let sha256 = Sha256::digest(&der);

        Ok(Self {
            subject,
            not_after,
            sha1_thumbprint: hex::encode_upper(&sha1),
            sha256_thumbprint: hex::encode_upper(&sha256),
            x5t: URL_SAFE_NO_PAD.encode(&sha1),
            der,
            private_key: RwLock::new(private_key),
            source,
        })
    }

    /// SHA-1 thumbprint as upper-case hex, the form certificate stores use
    pub fn thumbprint(&self) -> &str {
        &self.sha1_thumbprint
    }

    pub fn sha256_thumbprint(&self) -> &str {
        &self.sha256_thumbprint
    }

    /// Value for the `x5t` JWT header of a client assertion
    pub fn x5t(&self) -> &str {
        &self.x5t
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn not_after(&self) -> Option<DateTime<Utc>> {
        self.not_after
    }

    pub fn source(&self) -> &CertificateSource {
        &self.source
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Compare against a user supplied thumbprint, ignoring case, spaces and colons
    pub fn matches_thumbprint(&self, thumbprint: &str) -> bool {
        let wanted = normalize_thumbprint(thumbprint);
        wanted == self.sha1_thumbprint || wanted == self.sha256_thumbprint
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// RS256 key used to sign client assertions
    pub fn signing_key(&self) -> Result<EncodingKey> {
        let guard = self
            .private_key
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let key = guard.as_ref().ok_or_else(|| ScAuthError::NoPrivateKey {
            thumbprint: self.sha1_thumbprint.clone(),
        })?;
        EncodingKey::from_rsa_pem(key.to_pem().as_bytes()).map_err(|e| {
            ScAuthError::CertificateLoad(format!("Private key is not a usable RSA key: {e}"))
        })
    }

    /// Name of the machine key container the private key would be persisted under
    pub fn key_container_name(&self) -> Option<String> {
        let guard = self
            .private_key
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map(|key| {
            let digest = Sha256::digest(key.der());
            format!("{}_{}", hex::encode(&digest[..16]), self.sha1_thumbprint.to_lowercase())
        })
    }

    /// Certificate and PKCS#8 key as PEM, for transport-level client authentication
    pub fn identity_pem(&self) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>)> {
        let guard = self
            .private_key
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let key = guard.as_ref().ok_or_else(|| ScAuthError::NoPrivateKey {
            thumbprint: self.sha1_thumbprint.clone(),
        })?;
        if key.tag != TAG_PKCS8_KEY {
            return Err(ScAuthError::CertificateLoad(
                "Transport identity requires a PKCS#8 private key".to_string(),
            ));
        }
        let cert_pem = pem::encode(&pem::Pem::new(TAG_CERTIFICATE, self.der.clone()));
        let key_pem = key.to_pem();
        Ok((cert_pem.into_bytes(), Zeroizing::new(key_pem.as_bytes().to_vec())))
    }

    fn install_private_key(&self, key: PrivateKey) {
        *self
            .private_key
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(key);
    }

    /// Drop the in-memory private key, returning it to the caller
    pub(crate) fn release_private_key(&self) -> Option<PrivateKey> {
        self.private_key
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Fail unless the certificate carries a key that can sign assertions
    fn require_signing_key(self) -> Result<Self> {
        if !self.has_private_key() {
            return Err(ScAuthError::CertificateLoad(format!(
                "Certificate {} does not contain a private key",
                self.sha1_thumbprint
            )));
        }
        self.signing_key()?;
        Ok(self)
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject)
            .field("thumbprint", &self.sha1_thumbprint)
            .field("not_after", &self.not_after)
            .field("has_private_key", &self.has_private_key())
            .field("source", &self.source)
            .finish()
    }
}

fn normalize_thumbprint(thumbprint: &str) -> String {
    thumbprint
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect::<String>()
        .to_ascii_uppercase()
}

fn looks_like_pem(bytes: &[u8]) -> bool {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    bytes[start..].starts_with(b"-----BEGIN")
}

/// Split a PEM bundle into the leaf certificate and an optional private key
fn parse_pem_bundle(
    bytes: &[u8],
    password: Option<&str>,
) -> Result<(Vec<u8>, Option<PrivateKey>)> {
    let entries = pem::parse_many(bytes)
        .map_err(|e| ScAuthError::CertificateLoad(format!("Failed to parse PEM content: {e}")))?;

    let cert = entries
        .iter()
        .find(|p| p.tag() == TAG_CERTIFICATE)
        .ok_or_else(|| ScAuthError::CertificateLoad("No certificate found in PEM".to_string()))?
        .contents()
        .to_vec();

    Ok((cert, find_private_key(&entries, password)?))
}

fn find_private_key(entries: &[pem::Pem], password: Option<&str>) -> Result<Option<PrivateKey>> {
    for entry in entries {
        let tag = match entry.tag() {
            TAG_PKCS8_KEY => TAG_PKCS8_KEY,
            TAG_PKCS1_KEY => TAG_PKCS1_KEY,
            TAG_ENCRYPTED_KEY => return decrypt_pkcs8(entry.contents(), password).map(Some),
            _ => continue,
        };
        return Ok(Some(PrivateKey {
            tag,
            der: Zeroizing::new(entry.contents().to_vec()),
        }));
    }
    Ok(None)
}

fn decrypt_pkcs8(der: &[u8], password: Option<&str>) -> Result<PrivateKey> {
    let password = password.ok_or_else(|| {
        ScAuthError::CertificateLoad("Private key is encrypted but no password was given".to_string())
    })?;
    let info = pkcs8::EncryptedPrivateKeyInfo::try_from(der).map_err(|e| {
        ScAuthError::CertificateLoad(format!("Invalid encrypted private key: {e}"))
    })?;
    let document = info.decrypt(password.as_bytes()).map_err(|e| {
        ScAuthError::CertificateLoad(format!("Failed to decrypt private key: {e}"))
    })?;

    Ok(PrivateKey {
        tag: TAG_PKCS8_KEY,
        der: Zeroizing::new(document.as_bytes().to_vec()),
    })
}

fn parse_pkcs12(bytes: &[u8], password: &str) -> Result<(Vec<u8>, Option<PrivateKey>)> {
    let pfx = p12::PFX::parse(bytes)
        .map_err(|e| ScAuthError::CertificateLoad(format!("Invalid PKCS#12 data: {e:?}")))?;

    let cert = pfx
        .cert_x509_bags(password)
        .map_err(|e| {
            ScAuthError::CertificateLoad(format!("Failed to read PKCS#12 certificates: {e:?}"))
        })?
        .into_iter()
        .next()
        .ok_or_else(|| ScAuthError::CertificateLoad("PKCS#12 contains no certificate".to_string()))?;

    let key = pfx
        .key_bags(password)
        .map_err(|e| ScAuthError::CertificateLoad(format!("Failed to read PKCS#12 keys: {e:?}")))?
        .into_iter()
        .next()
        .map(|der| PrivateKey {
            tag: TAG_PKCS8_KEY,
            der: Zeroizing::new(der),
        });

    Ok((cert, key))
}

fn parse_any(
    bytes: &[u8],
    password: Option<&str>,
) -> Result<(Vec<u8>, Option<PrivateKey>)> {
    if looks_like_pem(bytes) {
        parse_pem_bundle(bytes, password)
    } else {
        parse_pkcs12(bytes, password.unwrap_or_default())
    }
}

/// Load a certificate from a PKCS#12 file or a PEM bundle on disk
#[instrument(skip(password))]
pub async fn resolve_from_file(path: &Path, password: Option<&str>) -> Result<Certificate> {
    let bytes = Zeroizing::new(tokio::fs::read(path).await.map_err(|e| {
        ScAuthError::CertificateLoad(format!(
            "Failed to read certificate file '{}': {e}",
            path.display()
        ))
    })?);

    let (der, key) = parse_any(&bytes, password)?;
    let certificate =
        Certificate::from_parts(der, key, CertificateSource::File(path.to_path_buf()))?
            .require_signing_key()?;

    debug!("Loaded certificate {} from file", certificate.thumbprint());
    Ok(certificate)
}

/// Load a certificate from separate PEM encoded certificate and private key
#[instrument(skip_all)]
pub fn resolve_from_pem(
    certificate_pem: &str,
    private_key_pem: &str,
    password: Option<&str>,
) -> Result<Certificate> {
    let (der, bundled_key) = parse_pem_bundle(certificate_pem.as_bytes(), password)?;
    let key_entries = pem::parse_many(private_key_pem.as_bytes()).map_err(|e| {
        ScAuthError::CertificateLoad(format!("Failed to parse private key PEM: {e}"))
    })?;
    let key = find_private_key(&key_entries, password)?.or(bundled_key);

    let certificate =
        Certificate::from_parts(der, key, CertificateSource::Pem)?.require_signing_key()?;
    debug!("Loaded certificate {} from PEM", certificate.thumbprint());
    Ok(certificate)
}

/// Load a certificate from a base64 encoded PKCS#12 blob (no password) or PEM bundle
#[instrument(skip_all)]
pub fn resolve_from_base64(blob: &str) -> Result<Certificate> {
    let compact: String = blob.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = Zeroizing::new(
        STANDARD
            .decode(compact)
            .map_err(|e| ScAuthError::CertificateLoad(format!("Invalid base64 certificate: {e}")))?,
    );

    let (der, key) = parse_any(&bytes, None)?;
    let certificate =
        Certificate::from_parts(der, key, CertificateSource::Base64)?.require_signing_key()?;
    debug!("Loaded certificate {} from base64", certificate.thumbprint());
    Ok(certificate)
}

/// Look a certificate up by thumbprint
///
/// Fails with [`ScAuthError::CertificateNotFound`] when nothing matches and
/// with [`ScAuthError::NoPrivateKey`] when the match has no usable key.
#[instrument(skip(store))]
pub async fn resolve_from_store(
    store: &dyn CertificateStore,
    thumbprint: &str,
) -> Result<Certificate> {
    let certificate = store
        .find(thumbprint)
        .await?
        .ok_or_else(|| ScAuthError::CertificateNotFound {
            thumbprint: thumbprint.to_string(),
        })?;

    if !certificate.has_private_key() || certificate.signing_key().is_err() {
        return Err(ScAuthError::NoPrivateKey {
            thumbprint: certificate.thumbprint().to_string(),
        });
    }

    debug!("Loaded certificate {} from store", certificate.thumbprint());
    Ok(certificate)
}

/// A source of certificates addressable by thumbprint
#[async_trait::async_trait]
pub trait CertificateStore: Send + Sync {
    /// Find a certificate by SHA-1 or SHA-256 thumbprint
    async fn find(&self, thumbprint: &str) -> Result<Option<Certificate>>;
}

/// Certificate store backed by a directory of PEM files
///
/// Each `.pem`, `.crt` or `.cer` file holds one certificate and, optionally,
/// its unencrypted private key.
#[derive(Debug, Clone)]
pub struct DirectoryCertificateStore {
    dir: PathBuf,
}

impl DirectoryCertificateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Per-user store under the platform data directory
    pub fn default_location() -> Result<Self> {
        let project_dirs = directories::ProjectDirs::from("", "", "spconnect").ok_or_else(|| {
            ScAuthError::CertificateLoad("Could not determine data directory".to_string())
        })?;
        Ok(Self::new(project_dirs.data_dir().join("certificates")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait::async_trait]
impl CertificateStore for DirectoryCertificateStore {
    async fn find(&self, thumbprint: &str) -> Result<Option<Certificate>> {
        if !self.dir.exists() {
            return Ok(None);
        }

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_pem = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| matches!(e, "pem" | "crt" | "cer"));
            if !is_pem {
                continue;
            }

            let bytes = Zeroizing::new(tokio::fs::read(&path).await?);
            let entries = match pem::parse_many(&bytes[..]) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            let Some(der) = entries
                .iter()
                .find(|p| p.tag() == TAG_CERTIFICATE)
                .map(|p| p.contents().to_vec())
            else {
                debug!("Skipping {}: no certificate", path.display());
                continue;
            };

            let certificate = match Certificate::from_parts(der, None, CertificateSource::Store) {
                Ok(certificate) => certificate,
                Err(e) => {
                    debug!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            if !certificate.matches_thumbprint(thumbprint) {
                continue;
            }

            // A matched certificate whose key is unreadable is returned keyless
            match find_private_key(&entries, None) {
                Ok(Some(key)) => certificate.install_private_key(key),
                Ok(None) => {}
                Err(e) => debug!("Private key in {} is not usable: {}", path.display(), e),
            }
            return Ok(Some(certificate));
        }

        Ok(None)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    pub const CERT_PEM: &str = include_str!("../tests/fixtures/cert.pem");
    pub const KEY_PEM: &str = include_str!("../tests/fixtures/key.pem");
    pub const ENCRYPTED_KEY_PEM: &str = include_str!("../tests/fixtures/key-encrypted.pem");
    pub const KEY_PASSWORD: &str = "hunter2";
    pub const THUMBPRINT: &str = "12C63D3EFABFB5DA8ABDAC62C63AF5F159BF88EB";

    pub fn bundle() -> String {
        format!("{CERT_PEM}{KEY_PEM}")
    }
}
