//! Public-key authentication chain for the SSH relay.
//!
//! Two handlers are tried in order:
//!   1. Certificates signed by the gomote CA for a live session
//!   2. (optional) Plain keys published on GitHub by the user named in a
//!      `[mutable-]user-<session id>` login
//!
//! Rejections are logged with their reason; the peer only ever sees a
//! protocol-level failure.

use std::collections::BTreeMap;
use std::sync::Arc;

use russh::keys::ssh_key::certificate::CertType;
use russh::keys::{Certificate, PublicKey};

use gomote_core::config::SshConfig;
use gomote_core::crypto::{check_cert, is_signed_by, session_principal, unix_now, CertCheckError};

use crate::github_keys::{GithubKeys, GithubKeysError};
use crate::session::SessionPool;

/// A key offered by an SSH client.
#[derive(Debug, Clone, Copy)]
pub enum PresentedKey<'a> {
    Plain(&'a PublicKey),
    Certificate(&'a Certificate),
}

/// How a login was accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// CA-signed certificate for this session.
    Certificate,
    /// Key published by this GitHub login, for the session named in the
    /// login.
    Legacy {
        github_user: String,
        session_id: String,
    },
}

impl AuthMethod {
    /// The session a login named `login` was accepted for.
    pub fn session_id<'a>(&'a self, login: &'a str) -> &'a str {
        match self {
            AuthMethod::Certificate => login,
            AuthMethod::Legacy { session_id, .. } => session_id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthRejection {
    #[error("presented key is not a certificate")]
    NotCertificate,
    #[error("certificate was not signed by the gomote CA")]
    UnknownAuthority,
    #[error("gomote session {0:?} does not exist")]
    NoSession(String),
    #[error(transparent)]
    Certificate(#[from] CertCheckError),
    #[error("session owner {0:?} is not a certificate principal")]
    OwnerNotPrincipal(String),
    #[error("legacy authentication is disabled")]
    LegacyDisabled,
    #[error("unable to derive user from instance name {0:?}")]
    BadInstanceName(String),
    #[error(transparent)]
    Github(#[from] GithubKeysError),
    #[error("key is not published by github user {0:?}")]
    KeyNotPublished(String),
    #[error("gomote session {session:?} does not belong to {user:?}")]
    NotSessionUser { session: String, user: String },
}

/// Extracts `<name>` from `[mutable-]user-<name>-...`.
pub fn user_from_gomote_instance_name(name: &str) -> Option<&str> {
    let user = session_from_instance_name(name)?.split('-').next()?;
    (!user.is_empty()).then_some(user)
}

/// Strips `[mutable-]user-`, leaving the session ID. Session IDs start with
/// their user name, so `user-alice-linux-amd64-0` names `alice-linux-amd64-0`.
pub fn session_from_instance_name(name: &str) -> Option<&str> {
    let name = name.strip_prefix("mutable-").unwrap_or(name);
    name.strip_prefix("user-")
}

struct LegacyAuth {
    github: GithubKeys,
    users: BTreeMap<String, String>,
}

pub struct Authenticator {
    pool: Arc<SessionPool>,
    ca: PublicKey,
    relay_domain: String,
    legacy: Option<LegacyAuth>,
}

impl Authenticator {
    pub fn new(
        pool: Arc<SessionPool>,
        ca: PublicKey,
        config: &SshConfig,
    ) -> Result<Self, GithubKeysError> {
        let legacy = if config.legacy_auth {
            Some(LegacyAuth {
                github: GithubKeys::new(&config.github_keys_url)?,
                users: config.github_users.clone(),
            })
        } else {
            None
        };
        Ok(Self {
            pool,
            ca,
            relay_domain: config.relay_domain.clone(),
            legacy,
        })
    }

    /// Runs the handler chain for `user` presenting `key`.
    pub async fn authenticate(
        &self,
        user: &str,
        key: PresentedKey<'_>,
    ) -> Result<AuthMethod, AuthRejection> {
        let cert_err = match self.check_certificate(user, key).await {
            Ok(()) => {
                tracing::info!(user, "ssh: certificate accepted");
                return Ok(AuthMethod::Certificate);
            }
            Err(e) => e,
        };

        let PresentedKey::Plain(public) = key else {
            tracing::warn!(user, reason = %cert_err, "ssh: rejected certificate");
            return Err(cert_err);
        };
        match self.check_legacy(user, public).await {
            Ok(method) => {
                tracing::info!(user, method = ?method, "ssh: legacy key accepted");
                Ok(method)
            }
            Err(e) => {
                tracing::warn!(user, reason = %e, "ssh: rejected public key");
                Err(e)
            }
        }
    }

    async fn check_certificate(
        &self,
        user: &str,
        key: PresentedKey<'_>,
    ) -> Result<(), AuthRejection> {
        let PresentedKey::Certificate(cert) = key else {
            return Err(AuthRejection::NotCertificate);
        };
        if cert.cert_type() != CertType::User {
            return Err(CertCheckError::NotUserCert.into());
        }
        if !is_signed_by(cert, &self.ca) {
            return Err(AuthRejection::UnknownAuthority);
        }
        let session = self
            .pool
            .session(user)
            .await
            .map_err(|_| AuthRejection::NoSession(user.to_string()))?;
        check_cert(
            cert,
            &self.ca,
            &session_principal(user, &self.relay_domain),
            unix_now(),
        )?;
        if !cert.valid_principals().iter().any(|p| p == &session.owner_id) {
            return Err(AuthRejection::OwnerNotPrincipal(session.owner_id));
        }
        Ok(())
    }

    /// Accepts a key published by the login's user. Whether the session is
    /// live is left to the channel layer; a session that exists must belong
    /// to that user.
    async fn check_legacy(&self, user: &str, key: &PublicKey) -> Result<AuthMethod, AuthRejection> {
        let legacy = self.legacy.as_ref().ok_or(AuthRejection::LegacyDisabled)?;
        let bad_name = || AuthRejection::BadInstanceName(user.to_string());
        let gomote_user = user_from_gomote_instance_name(user).ok_or_else(bad_name)?;
        let session_id = session_from_instance_name(user).ok_or_else(bad_name)?;
        let github_user = legacy
            .users
            .get(gomote_user)
            .map(String::as_str)
            .unwrap_or(gomote_user);
        if !legacy.github.has_key(github_user, key).await? {
            return Err(AuthRejection::KeyNotPublished(github_user.to_string()));
        }
        if let Ok(session) = self.pool.session(session_id).await {
            if session.user_name != gomote_user {
                return Err(AuthRejection::NotSessionUser {
                    session: session_id.to_string(),
                    user: gomote_user.to_string(),
                });
            }
        }
        Ok(AuthMethod::Legacy {
            github_user: github_user.to_string(),
            session_id: session_id.to_string(),
        })
    }
}
