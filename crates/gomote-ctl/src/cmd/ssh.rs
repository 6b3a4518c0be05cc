//! SSH key commands.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use gomote_core::crypto::ssh_key_pair;

use super::http::Api;

#[derive(Deserialize)]
struct SignSshKeyResponse {
    signed_public_key: String,
}

/// `id_ed25519.pub` → `id_ed25519-cert.pub`, the name OpenSSH looks for.
fn cert_path(pubkey_file: &Path) -> PathBuf {
    let s = pubkey_file.to_string_lossy();
    let base = s.strip_suffix(".pub").unwrap_or(&s);
    PathBuf::from(format!("{base}-cert.pub"))
}

pub async fn cmd_ssh_sign(api: &Api, id: &str, pubkey_file: &str) -> Result<()> {
    let path = Path::new(pubkey_file);
    let public_key = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read public key: {pubkey_file}"))?;
    let body = serde_json::json!({ "public_key": public_key.trim() });
    let resp: SignSshKeyResponse = api
        .post_json(&format!("/instances/{id}/ssh-key"), &body)
        .await?;

    let out = cert_path(path);
    std::fs::write(&out, resp.signed_public_key)
        .with_context(|| format!("failed to write certificate: {}", out.display()))?;
    println!("certificate written to {}", out.display());
    Ok(())
}

pub fn cmd_keygen(path: &str) -> Result<()> {
    let pair = ssh_key_pair().context("failed to generate key")?;
    write_private(Path::new(path), pair.private_pem.as_bytes())
        .with_context(|| format!("failed to write private key: {path}"))?;
    let public = format!("{path}.pub");
    std::fs::write(&public, format!("{}\n", pair.public_authorized))
        .with_context(|| format!("failed to write public key: {public}"))?;
    println!("wrote {path} and {public}");
    Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn certificate_sits_next_to_the_key() {
        assert_eq!(
            cert_path(Path::new("/home/a/.ssh/id_ed25519.pub")),
            PathBuf::from("/home/a/.ssh/id_ed25519-cert.pub")
        );
        assert_eq!(cert_path(Path::new("key")), PathBuf::from("key-cert.pub"));
    }
}
