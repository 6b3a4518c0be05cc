//! SSH accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use russh::server::{run_stream, Server as _};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use gomote_services::ssh_auth::Authenticator;
use gomote_services::SessionPool;

use super::handler::SshHandler;

pub struct SshServer {
    auth: Arc<Authenticator>,
    pool: Arc<SessionPool>,
}

impl SshServer {
    pub fn new(auth: Arc<Authenticator>, pool: Arc<SessionPool>) -> Self {
        Self { auth, pool }
    }

    /// Accepts connections on `listener` until `shutdown` fires. Connections
    /// already established keep running on their own tasks.
    pub async fn run(
        mut self,
        config: Arc<russh::server::Config>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "SSH listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "ssh accept failed");
                            continue;
                        }
                    };
                    if let Err(e) = socket.set_nodelay(true) {
                        tracing::debug!(error = %e, "set_nodelay failed");
                    }
                    let handler = self.new_client(Some(peer));
                    let config = config.clone();
                    tokio::spawn(async move {
                        let session = match run_stream(config, socket, handler).await {
                            Ok(s) => s,
                            Err(e) => {
                                tracing::warn!(%peer, error = %e, "ssh connection setup failed");
                                return;
                            }
                        };
                        match session.await {
                            Ok(()) => tracing::debug!(%peer, "ssh connection closed"),
                            Err(e) => tracing::debug!(%peer, error = %e, "ssh connection closed with error"),
                        }
                    });
                }
                _ = shutdown.cancelled() => break,
            }
        }
        Ok(())
    }
}

impl russh::server::Server for SshServer {
    type Handler = SshHandler;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> SshHandler {
        SshHandler::new(self.auth.clone(), self.pool.clone(), peer)
    }
}
