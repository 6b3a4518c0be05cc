//! Caller identity as asserted by the identity-aware proxy in front of the API.
//!
//! The proxy authenticates the user and forwards the result in request
//! headers. Nothing here verifies the proxy's signature.

/// Header carrying the authenticated email, e.g. `accounts.google.com:alice@example.com`.
pub const HEADER_EMAIL: &str = "x-goog-authenticated-user-email";
/// Header carrying the stable account ID.
pub const HEADER_ID: &str = "x-goog-authenticated-user-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IapIdentity {
    pub email: String,
    pub id: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid email format: {0:?}")]
pub struct EmailFormatError(pub String);

impl IapIdentity {
    pub fn new(email: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            id: id.into(),
        }
    }
}

/// Returns the displayed user for an IAP email string.
///
/// `accounts.google.com:example@gmail.com` → `example`
pub fn email_to_user(email: &str) -> Result<String, EmailFormatError> {
    let invalid = || EmailFormatError(email.to_string());

    let rest = email.strip_prefix("accounts.google.com:").ok_or_else(invalid)?;
    // some '@' must split a non-empty local part from a dotted domain
    let well_formed = rest.match_indices('@').any(|(at, _)| {
        let domain = &rest[at + 1..];
        at > 0
            && domain
                .match_indices('.')
                .any(|(dot, _)| dot > 0 && dot + 1 < domain.len())
    });
    if !well_formed {
        return Err(invalid());
    }

    let start = email.find(':').ok_or_else(invalid)? + 1;
    let end = email.rfind('@').ok_or_else(invalid)?;
    Ok(email[start..end].to_string())
}

/// True if the user may lease restricted builders.
pub fn is_privileged_user(email: &str, privileged_suffixes: &[String]) -> bool {
    privileged_suffixes.iter().any(|s| email.ends_with(s.as_str()))
}
