//! Configuration system for the gomote broker.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $GOMOTE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/gomote/config.toml
//!   3. ~/.config/gomote/config.toml

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GomoteConfig {
    pub api: ApiConfig,
    pub ssh: SshConfig,
    pub session: SessionConfig,
    pub rendezvous: RendezvousConfig,
    pub access: AccessConfig,
    pub scheduler: SchedulerConfig,
    /// Known builder types keyed by name.
    pub builders: BTreeMap<String, BuilderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen_addr: String,
    /// PEM certificate chain. The API is served over HTTPS only when both
    /// paths are set.
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub listen_addr: String,
    /// Server host key. Generated on first run.
    pub host_key_path: PathBuf,
    /// Certificate authority private key. Generated on first run.
    pub ca_key_path: PathBuf,
    /// Hostname suffix scoping certificate principals to this broker.
    pub relay_domain: String,
    pub cert_validity_secs: u64,
    /// Accept plain public keys published on GitHub for `user-<session id>`
    /// logins.
    pub legacy_auth: bool,
    pub github_keys_url: String,
    /// Gomote user name → GitHub login. Unmapped users use their own name.
    pub github_users: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub keepalive_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    pub sweep_interval_secs: u64,
    /// How long a scheduler waits for a machine to dial back.
    pub wait_secs: u64,
    pub audience: String,
    pub issuer: String,
    /// The only service account allowed to assert reverse connections.
    pub service_account: String,
    pub jwks_url: String,
    pub time_skew_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Email suffixes allowed to use restricted builders.
    pub privileged_suffixes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Program started for each allocation with GOMOTE_ID set. Empty means
    /// buildlets are started out of band.
    pub launch_command: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BuilderConfig {
    pub host_type: String,
    pub restricted: bool,
    /// Extra `KEY=VALUE` entries for command execution.
    pub env: Vec<String>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for GomoteConfig {
    fn default() -> Self {
        let mut builders = BTreeMap::new();
        builders.insert(
            "linux-amd64".to_string(),
            BuilderConfig {
                host_type: "host-linux-amd64".to_string(),
                restricted: false,
                env: vec!["GOOS=linux".to_string(), "GOARCH=amd64".to_string()],
            },
        );
        Self {
            api: ApiConfig::default(),
            ssh: SshConfig::default(),
            session: SessionConfig::default(),
            rendezvous: RendezvousConfig::default(),
            access: AccessConfig::default(),
            scheduler: SchedulerConfig::default(),
            builders,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8443".to_string(),
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:2222".to_string(),
            host_key_path: config_dir().join("ssh_host_key"),
            ca_key_path: config_dir().join("ssh_ca_key"),
            relay_domain: "farmer.golang.org".to_string(),
            cert_validity_secs: 300,
            legacy_auth: false,
            github_keys_url: "https://github.com".to_string(),
            github_users: BTreeMap::new(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            sweep_interval_secs: 60,
            keepalive_interval_secs: 60,
        }
    }
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 10,
            wait_secs: 10 * 60,
            audience: "https://gomote.golang.org".to_string(),
            issuer: "https://accounts.google.com".to_string(),
            service_account: "coordinator-builder@golang-ci-luci.iam.gserviceaccount.com"
                .to_string(),
            jwks_url: "https://www.googleapis.com/oauth2/v3/certs".to_string(),
            time_skew_secs: 30,
        }
    }
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            privileged_suffixes: vec![
                "@google.com".to_string(),
                "@symbolic-datum-552.iam.gserviceaccount.com".to_string(),
                "@go-security-trybots.iam.gserviceaccount.com".to_string(),
            ],
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }
}

impl RendezvousConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("gomote")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl GomoteConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            GomoteConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("GOMOTE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&GomoteConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply GOMOTE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("GOMOTE_API__LISTEN_ADDR") {
            self.api.listen_addr = v;
        }
        if let Some(v) = lookup("GOMOTE_API__TLS_CERT_PATH") {
            self.api.tls_cert_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("GOMOTE_API__TLS_KEY_PATH") {
            self.api.tls_key_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("GOMOTE_SSH__LISTEN_ADDR") {
            self.ssh.listen_addr = v;
        }
        if let Some(v) = lookup("GOMOTE_SSH__CA_KEY_PATH") {
            self.ssh.ca_key_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("GOMOTE_SSH__HOST_KEY_PATH") {
            self.ssh.host_key_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("GOMOTE_SSH__RELAY_DOMAIN") {
            self.ssh.relay_domain = v;
        }
        if let Some(v) = lookup("GOMOTE_SSH__LEGACY_AUTH") {
            self.ssh.legacy_auth = v == "true" || v == "1";
        }
        if let Some(v) = lookup("GOMOTE_SESSION__IDLE_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.session.idle_timeout_secs = secs;
            }
        }
        if let Some(v) = lookup("GOMOTE_RENDEZVOUS__WAIT_SECS") {
            if let Ok(secs) = v.parse() {
                self.rendezvous.wait_secs = secs;
            }
        }
    }
}
