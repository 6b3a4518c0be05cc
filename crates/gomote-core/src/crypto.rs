//! SSH certificate authority for gomote sessions.
//!
//! Provides three things:
//!   1. Key generation for bootstrapping host and CA identities
//!   2. Signing a caller's public key into a short-lived user certificate
//!      scoped to exactly one session
//!   3. Verifying that a presented certificate chains to the CA and is valid
//!      for a given principal
//!
//! Key types come from the `ssh-key` crate as re-exported by russh, so the
//! certificates produced here are the same types the SSH server receives.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use russh::keys::ssh_key::certificate::{Builder, CertType};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{self, Algorithm, EcdsaCurve, HashAlg, LineEnding};
use russh::keys::{Certificate, PrivateKey, PublicKey};
use thiserror::Error;

/// Key ID stamped into every certificate.
pub const CERT_KEY_ID: &str = "go_build";

const CERT_EXTENSIONS: [&str; 5] = [
    "permit-X11-forwarding",
    "permit-agent-forwarding",
    "permit-port-forwarding",
    "permit-pty",
    "permit-user-rc",
];

#[derive(Debug, Error)]
pub enum CaError {
    #[error("unable to parse public key: {0}")]
    InvalidPublicKey(String),
    #[error("ssh key error: {0}")]
    Key(#[from] ssh_key::Error),
    #[error("unable to decode private key: {0}")]
    Decode(#[from] russh::keys::Error),
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("certificate validity of {0:?} is out of range")]
    ValidityOutOfRange(Duration),
}

/// Why a certificate was not accepted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CertCheckError {
    #[error("certificate is not a user certificate")]
    NotUserCert,
    #[error("certificate was not signed by the gomote CA")]
    UnknownAuthority,
    #[error("principal {0:?} not in the set of valid principals")]
    PrincipalNotAllowed(String),
    #[error("certificate not valid at {0}")]
    OutsideValidity(u64),
    #[error("certificate signature invalid: {0}")]
    BadSignature(String),
}

/// A freshly generated keypair in text form.
pub struct SshKeyPair {
    /// OpenSSH PEM-armored private key.
    pub private_pem: String,
    /// `authorized_keys` line for the public half.
    pub public_authorized: String,
}

/// Generates a fresh ECDSA P-256 keypair.
pub fn ssh_key_pair() -> Result<SshKeyPair, CaError> {
    let key = PrivateKey::random(
        &mut OsRng,
        Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP256,
        },
    )?;
    let private_pem = key.to_openssh(LineEnding::LF)?.to_string();
    let public_authorized = key.public_key().to_openssh()?;
    Ok(SshKeyPair {
        private_pem,
        public_authorized,
    })
}

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Principal a certificate must carry to log into `session_id`.
pub fn session_principal(session_id: &str, relay_domain: &str) -> String {
    format!("{session_id}@{relay_domain}")
}

/// Signs `raw_public_key` (an `authorized_keys` line) into a user certificate
/// whose principals are exactly `{session_id}@{relay_domain}` and `owner_id`,
/// valid from now until now + `validity`.
///
/// Returns the certificate in `authorized_keys` form, newline terminated.
pub fn sign_public_ssh_key(
    ca: &PrivateKey,
    raw_public_key: &[u8],
    session_id: &str,
    owner_id: &str,
    relay_domain: &str,
    validity: Duration,
) -> Result<Vec<u8>, CaError> {
    let text = std::str::from_utf8(raw_public_key)
        .map_err(|e| CaError::InvalidPublicKey(e.to_string()))?;
    let client_key =
        PublicKey::from_openssh(text.trim()).map_err(|e| CaError::InvalidPublicKey(e.to_string()))?;

    let now = unix_now();
    let valid_before = now
        .checked_add(validity.as_secs())
        .ok_or(CaError::ValidityOutOfRange(validity))?;
    let mut builder = Builder::new_with_random_nonce(
        &mut OsRng,
        client_key.key_data().clone(),
        now,
        valid_before,
    )?;
    builder.serial(1)?;
    builder.key_id(CERT_KEY_ID)?;
    builder.cert_type(CertType::User)?;
    builder.valid_principal(session_principal(session_id, relay_domain))?;
    builder.valid_principal(owner_id)?;
    for ext in CERT_EXTENSIONS {
        builder.extension(ext, "")?;
    }
    let cert = builder.sign(ca)?;

    let mut out = cert.to_openssh()?.into_bytes();
    out.push(b'\n');
    Ok(out)
}

/// True when the certificate's signing key is byte-for-byte the CA key.
pub fn is_signed_by(cert: &Certificate, ca: &PublicKey) -> bool {
    cert.signature_key() == ca.key_data()
}

/// Principal, validity window and signature checks for one principal.
pub fn check_cert(
    cert: &Certificate,
    ca: &PublicKey,
    principal: &str,
    now: u64,
) -> Result<(), CertCheckError> {
    if cert.cert_type() != CertType::User {
        return Err(CertCheckError::NotUserCert);
    }
    if !is_signed_by(cert, ca) {
        return Err(CertCheckError::UnknownAuthority);
    }
    if !cert.valid_principals().iter().any(|p| p == principal) {
        return Err(CertCheckError::PrincipalNotAllowed(principal.to_string()));
    }
    if now < cert.valid_after() || now >= cert.valid_before() {
        return Err(CertCheckError::OutsideValidity(now));
    }
    let fingerprint = ca.fingerprint(HashAlg::Sha256);
    cert.validate_at(now, [&fingerprint])
        .map_err(|e| CertCheckError::BadSignature(e.to_string()))
}

/// Loads an OpenSSH private key from `path`, generating and persisting one of
/// the given algorithm if the file does not exist.
pub fn load_or_generate_key(path: &Path, algorithm: Algorithm) -> Result<PrivateKey, CaError> {
    if path.exists() {
        let pem = std::fs::read_to_string(path)
            .map_err(|e| CaError::ReadFailed(path.to_path_buf(), e))?;
        return Ok(russh::keys::decode_secret_key(&pem, None)?);
    }

    let key = PrivateKey::random(&mut OsRng, algorithm)?;
    let pem = key.to_openssh(LineEnding::LF)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CaError::WriteFailed(path.to_path_buf(), e))?;
    }
    write_private(path, pem.as_bytes()).map_err(|e| CaError::WriteFailed(path.to_path_buf(), e))?;
    tracing::info!(path = %path.display(), "generated ssh key");
    Ok(key)
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    f.write_all(data)
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, data)
}
