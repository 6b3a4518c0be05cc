//! SSH relay into gomote instances, authenticated by gomote CA certificates.

mod handler;
mod server;

use std::sync::Arc;
use std::time::Duration;

use russh::keys::PrivateKey;
use russh::{MethodKind, MethodSet};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use gomote_services::ssh_auth::Authenticator;
use gomote_services::SessionPool;

pub use handler::SshHandler;
pub use server::SshServer;

pub fn server_config(host_key: PrivateKey) -> russh::server::Config {
    russh::server::Config {
        keys: vec![host_key],
        methods: MethodSet::from([MethodKind::PublicKey].as_slice()),
        nodelay: true,
        auth_rejection_time: Duration::from_millis(250),
        auth_rejection_time_initial: Some(Duration::ZERO),
        inactivity_timeout: Some(Duration::from_secs(60 * 60)),
        ..Default::default()
    }
}

/// Starts the SSH server on `listener` in a background task.
pub fn spawn(
    host_key: PrivateKey,
    auth: Arc<Authenticator>,
    pool: Arc<SessionPool>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> JoinHandle<anyhow::Result<()>> {
    let config = Arc::new(server_config(host_key));
    tokio::spawn(SshServer::new(auth, pool).run(config, listener, shutdown))
}
