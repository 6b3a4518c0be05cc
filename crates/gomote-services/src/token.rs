//! Authentication of reverse connections.
//!
//! A machine dialing back presents a signed identity token. Production
//! validates it as a Google-issued ID token for the coordinator's service
//! account; tests plug in a static answer.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::{Jwk, JwkSet, KeyAlgorithm};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::RwLock;

use gomote_core::config::RendezvousConfig;
use gomote_core::crypto::unix_now;

const JWKS_TTL: Duration = Duration::from_secs(3600);

#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> bool;
}

/// Accepts or rejects every token.
pub struct StaticValidator(pub bool);

#[async_trait]
impl TokenValidator for StaticValidator {
    async fn validate(&self, _token: &str) -> bool {
        self.0
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    iss: String,
    #[serde(default)]
    iat: u64,
    exp: u64,
    email: Option<String>,
    email_verified: Option<bool>,
}

/// Validates Google-signed ID tokens against a JWKS endpoint.
pub struct IdTokenValidator {
    audience: String,
    issuer: String,
    service_account: String,
    jwks_url: String,
    skew: u64,
    http: reqwest::Client,
    keys: RwLock<Option<CachedKeys>>,
}

struct CachedKeys {
    /// `None` for a pinned key set.
    until: Option<Instant>,
    set: JwkSet,
}

impl IdTokenValidator {
    pub fn new(config: &RendezvousConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            audience: config.audience.clone(),
            issuer: config.issuer.clone(),
            service_account: config.service_account.clone(),
            jwks_url: config.jwks_url.clone(),
            skew: config.time_skew_secs,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()?,
            keys: RwLock::new(None),
        })
    }

    /// Uses a fixed key set instead of fetching one.
    pub fn with_keys(config: &RendezvousConfig, keys: JwkSet) -> Result<Self, reqwest::Error> {
        let v = Self::new(config)?;
        Ok(Self {
            keys: RwLock::new(Some(CachedKeys {
                until: None,
                set: keys,
            })),
            ..v
        })
    }

    /// The key for `kid` and the algorithm it is published for.
    async fn key_for(&self, kid: &str) -> Result<(DecodingKey, Algorithm), String> {
        {
            let cached = self.keys.read().await;
            if let Some(keys) = cached.as_ref() {
                if keys.until.is_none_or(|t| Instant::now() < t) {
                    if let Some(jwk) = keys.set.find(kid) {
                        return decoding_key(jwk);
                    }
                }
            }
        }

        let set: JwkSet = self
            .http
            .get(&self.jwks_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| format!("fetching {}: {e}", self.jwks_url))?
            .json()
            .await
            .map_err(|e| format!("decoding {}: {e}", self.jwks_url))?;
        let key = set
            .find(kid)
            .ok_or_else(|| format!("no key with id {kid:?}"))
            .and_then(decoding_key);
        *self.keys.write().await = Some(CachedKeys {
            until: Some(Instant::now() + JWKS_TTL),
            set,
        });
        key
    }

    fn check_claims(&self, claims: &Claims, now: u64) -> Result<(), String> {
        if claims.iss != self.issuer {
            return Err(format!("incorrect issuer: {:?}", claims.iss));
        }
        if claims.exp + self.skew < now || claims.iat.saturating_sub(self.skew) > now {
            return Err(format!(
                "bad JWT times: expires {}, issued {}",
                claims.exp, claims.iat
            ));
        }
        if claims.email.as_deref() != Some(self.service_account.as_str()) {
            return Err(format!("incorrect email={:?}", claims.email));
        }
        if claims.email_verified != Some(true) {
            return Err(format!("email unverified email={:?}", claims.email));
        }
        Ok(())
    }

    async fn verify(&self, token: &str) -> Result<(), String> {
        let header = decode_header(token).map_err(|e| e.to_string())?;
        let kid = header.kid.ok_or("token has no key id")?;
        let (key, alg) = self.key_for(&kid).await?;

        // the header's alg is attacker controlled; the key decides
        let mut validation = Validation::new(alg);
        validation.set_audience(&[&self.audience]);
        validation.leeway = self.skew;
        let data = decode::<Claims>(token, &key, &validation).map_err(|e| e.to_string())?;
        self.check_claims(&data.claims, unix_now())
    }
}

/// Decoding key for `jwk`, pinned to the algorithm the key set declares.
/// Keys without one are taken to be RS256, which Google's certs use.
fn decoding_key(jwk: &Jwk) -> Result<(DecodingKey, Algorithm), String> {
    let alg = match &jwk.common.key_algorithm {
        None | Some(KeyAlgorithm::RS256) => Algorithm::RS256,
        Some(KeyAlgorithm::RS384) => Algorithm::RS384,
        Some(KeyAlgorithm::RS512) => Algorithm::RS512,
        Some(KeyAlgorithm::PS256) => Algorithm::PS256,
        Some(KeyAlgorithm::PS384) => Algorithm::PS384,
        Some(KeyAlgorithm::PS512) => Algorithm::PS512,
        Some(KeyAlgorithm::ES256) => Algorithm::ES256,
        Some(KeyAlgorithm::ES384) => Algorithm::ES384,
        Some(KeyAlgorithm::EdDSA) => Algorithm::EdDSA,
        Some(KeyAlgorithm::HS256) => Algorithm::HS256,
        Some(KeyAlgorithm::HS384) => Algorithm::HS384,
        Some(KeyAlgorithm::HS512) => Algorithm::HS512,
        Some(other) => return Err(format!("unsupported key algorithm {other:?}")),
    };
    let key = DecodingKey::from_jwk(jwk).map_err(|e| e.to_string())?;
    Ok((key, alg))
}

#[async_trait]
impl TokenValidator for IdTokenValidator {
    async fn validate(&self, token: &str) -> bool {
        match self.verify(token).await {
            Ok(()) => true,
            Err(reason) => {
                tracing::warn!(reason = %reason, "unable to validate reverse authentication token");
                false
            }
        }
    }
}
