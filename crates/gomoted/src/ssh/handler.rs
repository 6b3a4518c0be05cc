//! Per-connection SSH handler.
//!
//! The login name is the gomote instance name. Once authenticated, every
//! session channel is bound to that instance: the connection keeps it alive
//! and `exec` requests run on its buildlet.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use russh::keys::{Certificate, PublicKey};
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodKind, MethodSet};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use gomote_services::buildlet::ExecOpts;
use gomote_services::ssh_auth::{Authenticator, PresentedKey};
use gomote_services::{BuildletClient, SessionPool};

pub struct SshHandler {
    auth: Arc<Authenticator>,
    pool: Arc<SessionPool>,
    peer: Option<SocketAddr>,
    instance: Option<String>,
    keep_alive_started: bool,
    /// Cancelled when the connection goes away, ending the keep-alive.
    conn: CancellationToken,
}

impl SshHandler {
    pub fn new(auth: Arc<Authenticator>, pool: Arc<SessionPool>, peer: Option<SocketAddr>) -> Self {
        Self {
            auth,
            pool,
            peer,
            instance: None,
            keep_alive_started: false,
            conn: CancellationToken::new(),
        }
    }

    async fn check(&mut self, user: &str, key: PresentedKey<'_>) -> Auth {
        match self.auth.authenticate(user, key).await {
            Ok(method) => {
                tracing::info!(
                    instance = user,
                    peer = ?self.peer,
                    method = ?method,
                    "ssh login"
                );
                self.instance = Some(method.session_id(user).to_string());
                Auth::Accept
            }
            // the reason was already logged by the authenticator
            Err(_) => reject(),
        }
    }

    async fn buildlet(&self) -> anyhow::Result<(String, Arc<dyn BuildletClient>)> {
        let instance = self
            .instance
            .clone()
            .ok_or_else(|| anyhow::anyhow!("channel opened before authentication"))?;
        let bc = self.pool.buildlet_client(&instance).await?;
        Ok((instance, bc))
    }
}

impl Drop for SshHandler {
    fn drop(&mut self) {
        self.conn.cancel();
    }
}

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: Some(MethodSet::from([MethodKind::PublicKey].as_slice())),
        partial_success: false,
    }
}

/// Splits an exec line into a command and its arguments.
fn parse_command(line: &str) -> Option<(String, Vec<String>)> {
    let mut words = line.split_whitespace().map(str::to_string);
    let cmd = words.next()?;
    Some((cmd, words.collect()))
}

impl russh::server::Handler for SshHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(reject())
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(self.check(user, PresentedKey::Plain(public_key)).await)
    }

    async fn auth_openssh_certificate(
        &mut self,
        user: &str,
        certificate: &Certificate,
    ) -> Result<Auth, Self::Error> {
        Ok(self.check(user, PresentedKey::Certificate(certificate)).await)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(instance) = self.instance.clone() else {
            return Ok(false);
        };
        if self.keep_alive_started {
            return Ok(true);
        }
        match self.pool.keep_alive(self.conn.clone(), &instance).await {
            Ok(()) => {
                self.keep_alive_started = true;
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(instance = %instance, error = %e, "ssh: refusing channel");
                Ok(false)
            }
        }
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let (instance, bc) = self.buildlet().await?;
        let work_dir = bc.work_dir().await.unwrap_or_default();
        session.channel_success(channel)?;
        let banner = format!(
            "gomote {instance}\nworking directory: {work_dir}\n\
             interactive shells are not supported; run `ssh {instance}@<host> <command>`\n"
        );
        session.data(channel, CryptoVec::from(banner))?;
        session.exit_status_request(channel, 0)?;
        session.eof(channel)?;
        session.close(channel)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let line = String::from_utf8_lossy(data).into_owned();
        let (instance, bc) = self.buildlet().await?;
        let Some((cmd, args)) = parse_command(&line) else {
            session.channel_failure(channel)?;
            return Ok(());
        };
        session.channel_success(channel)?;
        tracing::info!(instance = %instance, cmd = %cmd, "ssh exec");

        let handle = session.handle();
        let ctx = self.conn.clone();
        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::channel::<Bytes>(16);
            let opts = ExecOpts {
                args,
                ..ExecOpts::default()
            };
            let run = bc.exec(&cmd, opts, tx);
            let forward = async {
                while let Some(chunk) = rx.recv().await {
                    if handle
                        .data(channel, CryptoVec::from_slice(&chunk))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            };
            let res = tokio::select! {
                _ = ctx.cancelled() => return,
                (res, ()) = async { tokio::join!(run, forward) } => res,
            };
            let status = match res {
                Ok(Ok(())) => 0,
                Ok(Err(remote)) => {
                    tracing::info!(instance = %instance, cmd = %cmd, error = %remote, "ssh exec failed");
                    1
                }
                Err(e) => {
                    let msg = format!("unable to execute command: {e}\n");
                    let _ = handle.extended_data(channel, 1, CryptoVec::from(msg)).await;
                    1
                }
            };
            let _ = handle.exit_status_request(channel, status).await;
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
        });
        Ok(())
    }
}
