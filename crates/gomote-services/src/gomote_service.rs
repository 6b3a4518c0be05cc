//! Gomote service: The authenticated façade over the session pool, the
//! scheduler, and the SSH certificate authority.
//!
//! Every operation takes the caller's proxy-asserted identity and fails with
//! `Unauthenticated` when there is none. Operations on an existing instance
//! also check that the caller owns it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use russh::keys::PrivateKey;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use gomote_core::config::{BuilderConfig, GomoteConfig};
use gomote_core::crypto::sign_public_ssh_key;
use gomote_core::identity::{email_to_user, is_privileged_user};
use gomote_core::IapIdentity;

use crate::buildlet::{BuildletClient, ExecOpts, ListDirOpts};
use crate::rendezvous::RendezvousError;
use crate::scheduler::{SchedItem, ScheduleError, Scheduler};
use crate::session::{SessionPool, SessionView};
use crate::status::{Code, Status};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub gomote_id: String,
    pub builder_type: String,
    pub host_type: String,
    /// Unix seconds; 0 when the session does not expire.
    pub expires: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreateStatus {
    Waiting,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInstanceResponse {
    pub status: CreateStatus,
    pub waiters_ahead: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<Instance>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuteCommandRequest {
    pub gomote_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub directory: String,
    pub system_level: bool,
    pub debug: bool,
    pub append_environment: Vec<String>,
    pub path: Vec<String>,
    /// Run with another builder type's environment.
    pub imitate_host_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListDirectoryRequest {
    pub gomote_id: String,
    pub directory: String,
    pub recursive: bool,
    pub skip_files: Vec<String>,
    pub digest: bool,
}

fn unix_secs(t: Option<SystemTime>) -> i64 {
    t.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl From<&SessionView> for Instance {
    fn from(s: &SessionView) -> Self {
        Self {
            gomote_id: s.id.clone(),
            builder_type: s.builder_type.clone(),
            host_type: s.host_type.clone(),
            expires: unix_secs(s.expires),
            working_dir: String::new(),
        }
    }
}

/// Removes duplicate `KEY=VALUE` entries, keeping the last value of each key
/// at its last position. Entries without `=` are kept as is.
pub fn dedup_env(env: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out: Vec<String> = env
        .iter()
        .rev()
        .filter(|kv| match kv.split_once('=') {
            Some((key, _)) => seen.insert(key.to_string()),
            None => true,
        })
        .cloned()
        .collect();
    out.reverse();
    out
}

// ── Service ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GomoteServiceConfig {
    pub relay_domain: String,
    pub cert_validity: Duration,
    pub builders: BTreeMap<String, BuilderConfig>,
    pub privileged_suffixes: Vec<String>,
}

impl From<&GomoteConfig> for GomoteServiceConfig {
    fn from(c: &GomoteConfig) -> Self {
        Self {
            relay_domain: c.ssh.relay_domain.clone(),
            cert_validity: Duration::from_secs(c.ssh.cert_validity_secs),
            builders: c.builders.clone(),
            privileged_suffixes: c.access.privileged_suffixes.clone(),
        }
    }
}

pub struct GomoteService {
    config: GomoteServiceConfig,
    pool: Arc<SessionPool>,
    scheduler: Arc<dyn Scheduler>,
    ca: PrivateKey,
}

fn caller(identity: Option<&IapIdentity>) -> Result<&IapIdentity, Status> {
    identity.ok_or_else(Status::unauthenticated)
}

impl GomoteService {
    pub fn new(
        config: GomoteServiceConfig,
        pool: Arc<SessionPool>,
        scheduler: Arc<dyn Scheduler>,
        ca: PrivateKey,
    ) -> Self {
        Self {
            config,
            pool,
            scheduler,
            ca,
        }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Confirms the caller carries an identity.
    pub fn authenticate(&self, identity: Option<&IapIdentity>) -> Result<(), Status> {
        caller(identity).map(|_| ())
    }

    /// Allocates a machine and registers a session for it, sending progress
    /// on `progress` while waiting and a final `COMPLETE` message.
    pub async fn create_instance(
        &self,
        ctx: &CancellationToken,
        identity: Option<&IapIdentity>,
        builder_type: &str,
        progress: mpsc::Sender<CreateInstanceResponse>,
    ) -> Result<(), Status> {
        let creds = caller(identity)?;
        if builder_type.is_empty() {
            return Err(Status::invalid_argument("invalid builder type"));
        }
        let bconf = self
            .config
            .builders
            .get(builder_type)
            .ok_or_else(|| Status::invalid_argument("unknown builder type"))?;
        if bconf.restricted && !is_privileged_user(&creds.email, &self.config.privileged_suffixes) {
            return Err(Status::permission_denied(
                "user is unable to create gomote of that builder type",
            ));
        }
        let user_name =
            email_to_user(&creds.email).map_err(|_| Status::internal("invalid user email format"))?;

        let item = SchedItem {
            host_type: bconf.host_type.clone(),
            builder_type: builder_type.to_string(),
            user: user_name.clone(),
            is_gomote: true,
        };
        let stream_err = |e| Status::internal(format!("unable to stream result: {e}"));

        let alloc = self.scheduler.get_buildlet(ctx, &item);
        tokio::pin!(alloc);
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + PROGRESS_INTERVAL, PROGRESS_INTERVAL);
        // the scheduler watches ctx itself and cleans up before returning
        let bc = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let st = self.scheduler.waiter_state(&item).await;
                    progress
                        .send(CreateInstanceResponse {
                            status: CreateStatus::Waiting,
                            waiters_ahead: st.ahead as i64,
                            instance: None,
                        })
                        .await
                        .map_err(stream_err)?;
                }
                res = &mut alloc => match res {
                    Ok(bc) => break bc,
                    Err(ScheduleError::Cancelled)
                    | Err(ScheduleError::Rendezvous(RendezvousError::Cancelled(_))) => {
                        return Err(Status::new(
                            Code::DeadlineExceeded,
                            "timed out waiting for gomote instance to be created",
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(user = %user_name, error = %e, "error creating gomote buildlet");
                        return Err(Status::new(Code::Unknown, format!("gomote creation failed: {e}")));
                    }
                },
            }
        };

        let gomote_id = self
            .pool
            .add_session(&creds.id, &user_name, builder_type, &bconf.host_type, None, bc.clone())
            .await;
        tracing::info!(id = %gomote_id, user = %user_name, addr = %bc.remote_addr(), "created gomote buildlet");
        let session = self
            .pool
            .session(&gomote_id)
            .await
            .map_err(|_| Status::internal("unable to query for gomote timeout"))?;
        let working_dir = bc
            .work_dir()
            .await
            .map_err(|e| Status::internal(format!("could not read working dir: {e}")))?;

        progress
            .send(CreateInstanceResponse {
                status: CreateStatus::Complete,
                waiters_ahead: 0,
                instance: Some(Instance {
                    working_dir,
                    ..Instance::from(&session)
                }),
            })
            .await
            .map_err(stream_err)
    }

    /// Renews the instance's timeout.
    pub async fn instance_alive(
        &self,
        identity: Option<&IapIdentity>,
        gomote_id: &str,
    ) -> Result<(), Status> {
        let creds = caller(identity)?;
        if gomote_id.is_empty() {
            return Err(Status::invalid_argument("invalid gomote ID"));
        }
        self.session(gomote_id, &creds.id).await?;
        self.pool
            .renew_timeout(gomote_id)
            .await
            .map_err(|_| Status::internal("unable to renew timeout"))
    }

    /// Instances owned by the caller, sorted by ID.
    pub async fn list_instances(
        &self,
        identity: Option<&IapIdentity>,
    ) -> Result<Vec<Instance>, Status> {
        let creds = caller(identity)?;
        Ok(self
            .pool
            .list()
            .await
            .iter()
            .filter(|s| s.owner_id == creds.id)
            .map(Instance::from)
            .collect())
    }

    pub async fn destroy_instance(
        &self,
        identity: Option<&IapIdentity>,
        gomote_id: &str,
    ) -> Result<(), Status> {
        let creds = caller(identity)?;
        if gomote_id.is_empty() {
            return Err(Status::invalid_argument("invalid gomote ID"));
        }
        self.session(gomote_id, &creds.id).await?;
        self.pool.destroy_session(gomote_id).await.map_err(|e| {
            tracing::warn!(id = %gomote_id, error = %e, "unable to destroy gomote session");
            Status::internal("unable to destroy gomote instance")
        })
    }

    /// Runs a command on the instance, streaming its output into `output`.
    pub async fn execute_command(
        &self,
        ctx: &CancellationToken,
        identity: Option<&IapIdentity>,
        req: ExecuteCommandRequest,
        output: mpsc::Sender<Bytes>,
    ) -> Result<(), Status> {
        let creds = caller(identity)?;
        let (session, bc) = self.session_and_client(ctx, &req.gomote_id, &creds.id).await?;
        let builder_type = if req.imitate_host_type.is_empty() {
            session.builder_type.as_str()
        } else {
            req.imitate_host_type.as_str()
        };
        let conf = self
            .config
            .builders
            .get(builder_type)
            .ok_or_else(|| Status::internal("unable to retrieve configuration for instance"))?;

        let mut env = conf.env.clone();
        env.extend(req.append_environment.iter().cloned());
        let opts = ExecOpts {
            dir: req.directory,
            args: req.args,
            extra_env: dedup_env(&env),
            system_level: req.system_level,
            debug: req.debug,
            path: req.path,
        };

        let res = tokio::select! {
            _ = ctx.cancelled() => {
                return Err(Status::new(Code::Aborted, "unable to execute command: request cancelled"));
            }
            res = bc.exec(&req.command, opts, output) => res,
        };
        match res {
            Err(e) => Err(Status::new(
                Code::Aborted,
                format!("unable to execute command: {e}"),
            )),
            Ok(Err(remote)) => Err(Status::new(
                Code::Unknown,
                format!("command execution failed: {remote}"),
            )),
            Ok(Ok(())) => Ok(()),
        }
    }

    pub async fn list_directory(
        &self,
        ctx: &CancellationToken,
        identity: Option<&IapIdentity>,
        req: ListDirectoryRequest,
    ) -> Result<Vec<String>, Status> {
        let creds = caller(identity)?;
        if req.gomote_id.is_empty() || req.directory.is_empty() {
            return Err(Status::invalid_argument("invalid arguments"));
        }
        let (_, bc) = self.session_and_client(ctx, &req.gomote_id, &creds.id).await?;
        let opts = ListDirOpts {
            recursive: req.recursive,
            digest: req.digest,
            skip: req.skip_files,
        };
        bc.list_dir(&req.directory, opts)
            .await
            .map_err(|e| Status::new(Code::Aborted, format!("unable to list directory: {e}")))
    }

    pub async fn remove_files(
        &self,
        ctx: &CancellationToken,
        identity: Option<&IapIdentity>,
        gomote_id: &str,
        paths: &[String],
    ) -> Result<(), Status> {
        let creds = caller(identity)?;
        if gomote_id.is_empty() || paths.is_empty() {
            return Err(Status::invalid_argument("invalid arguments"));
        }
        let (_, bc) = self.session_and_client(ctx, gomote_id, &creds.id).await?;
        bc.remove_all(paths).await.map_err(|e| {
            tracing::warn!(id = %gomote_id, error = %e, "remove files failed");
            Status::new(Code::Unknown, "unable to remove files")
        })
    }

    /// Has the instance download and extract a tar.gz.
    pub async fn write_tgz_from_url(
        &self,
        ctx: &CancellationToken,
        identity: Option<&IapIdentity>,
        gomote_id: &str,
        url: &str,
        directory: &str,
    ) -> Result<(), Status> {
        let creds = caller(identity)?;
        if gomote_id.is_empty() {
            return Err(Status::invalid_argument("invalid gomote ID"));
        }
        if url.is_empty() {
            return Err(Status::invalid_argument("missing URL"));
        }
        url::Url::parse(url).map_err(|_| Status::invalid_argument("invalid URL"))?;
        let (_, bc) = self.session_and_client(ctx, gomote_id, &creds.id).await?;
        bc.put_tar_from_url(url, directory).await.map_err(|e| {
            Status::new(
                Code::FailedPrecondition,
                format!("unable to write tar.gz: {e}"),
            )
        })
    }

    /// Signs `public_key` into a certificate for logging into `gomote_id`
    /// over SSH.
    pub async fn sign_ssh_key(
        &self,
        identity: Option<&IapIdentity>,
        gomote_id: &str,
        public_key: &[u8],
    ) -> Result<Vec<u8>, Status> {
        let creds = caller(identity)?;
        let session = self.session(gomote_id, &creds.id).await?;
        sign_public_ssh_key(
            &self.ca,
            public_key,
            &session.id,
            &session.owner_id,
            &self.config.relay_domain,
            self.config.cert_validity,
        )
        .map_err(|e| {
            tracing::warn!(id = %gomote_id, error = %e, "unable to sign ssh key");
            Status::invalid_argument("unable to sign ssh key")
        })
    }

    /// Looks up `gomote_id` and checks that `owner_id` owns it.
    async fn session(&self, gomote_id: &str, owner_id: &str) -> Result<SessionView, Status> {
        let session = self
            .pool
            .session(gomote_id)
            .await
            .map_err(|_| Status::not_found("specified gomote instance does not exist"))?;
        if session.owner_id != owner_id {
            return Err(Status::permission_denied(
                "not allowed to modify this gomote session",
            ));
        }
        Ok(session)
    }

    /// Like [`Self::session`], and keeps the session alive until `ctx` ends.
    async fn session_and_client(
        &self,
        ctx: &CancellationToken,
        gomote_id: &str,
        owner_id: &str,
    ) -> Result<(SessionView, Arc<dyn BuildletClient>), Status> {
        let session = self.session(gomote_id, owner_id).await?;
        let bc = self
            .pool
            .buildlet_client(gomote_id)
            .await
            .map_err(|_| Status::not_found("specified gomote instance does not exist"))?;
        if let Err(e) = self.pool.keep_alive(ctx.clone(), gomote_id).await {
            tracing::warn!(id = %gomote_id, error = %e, "unable to keep alive");
        }
        Ok((session, bc))
    }
}
