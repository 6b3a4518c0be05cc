//! Public keys published on GitHub, for the legacy SSH login path.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use russh::keys::PublicKey;

const CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum GithubKeysError {
    #[error("fetching keys for {user}: {reason}")]
    Fetch { user: String, reason: String },
    #[error("building http client: {0}")]
    Client(#[from] reqwest::Error),
}

struct CachedKeys {
    fetched: Instant,
    keys: Vec<PublicKey>,
}

/// Fetches and caches `https://github.com/{user}.keys`.
pub struct GithubKeys {
    base_url: String,
    http: reqwest::Client,
    cache: DashMap<String, CachedKeys>,
}

impl GithubKeys {
    pub fn new(base_url: &str) -> Result<Self, GithubKeysError> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?,
            cache: DashMap::new(),
        })
    }

    /// Keys published by `user`. Lines that fail to parse are skipped.
    pub async fn keys(&self, user: &str) -> Result<Vec<PublicKey>, GithubKeysError> {
        if let Some(entry) = self.cache.get(user) {
            if entry.fetched.elapsed() < CACHE_TTL {
                return Ok(entry.keys.clone());
            }
        }

        let url = format!("{}/{user}.keys", self.base_url);
        let fetch_err = |reason: String| GithubKeysError::Fetch {
            user: user.to_string(),
            reason,
        };
        let body = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| fetch_err(e.to_string()))?
            .text()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;

        let keys = parse_keys(&body);
        tracing::debug!(user, count = keys.len(), "fetched github keys");
        self.cache.insert(
            user.to_string(),
            CachedKeys {
                fetched: Instant::now(),
                keys: keys.clone(),
            },
        );
        Ok(keys)
    }

    /// True if `key` is one of `user`'s published keys.
    pub async fn has_key(&self, user: &str, key: &PublicKey) -> Result<bool, GithubKeysError> {
        Ok(self
            .keys(user)
            .await?
            .iter()
            .any(|k| k.key_data() == key.key_data()))
    }
}

fn parse_keys(body: &str) -> Vec<PublicKey> {
    body.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|l| PublicKey::from_openssh(l).ok())
        .collect()
}
