//! gomote-core: Configuration, caller identity, and the SSH certificate
//! authority. All other gomote crates depend on this one.

pub mod config;
pub mod crypto;
pub mod identity;

pub use config::GomoteConfig;
pub use identity::IapIdentity;
