//! Rendezvous: Matches machines dialing back to the broker with the request
//! that is waiting for them.
//!
//! A waiter registers an ID with a deadline, then blocks in
//! [`Rendezvous::wait_for_instance`]. When the machine connects to
//! `/reverse`, the HTTP layer asks [`Rendezvous::accept_reverse`] for a
//! [`ReverseSlot`], upgrades the connection, and delivers the resulting
//! buildlet through the slot. Each registration ends exactly once: matched,
//! timed out by the sweep, or abandoned by its waiter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::buildlet::BuildletClient;
use crate::periodic::PeriodicTask;
use crate::token::TokenValidator;

/// Header carrying the gomote ID the machine registered under.
pub const HEADER_ID: &str = "X-Go-Gomote-ID";
/// Header carrying the authentication token.
pub const HEADER_TOKEN: &str = "X-Go-Swarming-Auth-Token";
/// Header carrying the machine's hostname.
pub const HEADER_HOSTNAME: &str = "X-Go-Hostname";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RendezvousError {
    #[error("instance not found: name={0:?}")]
    NotFound(String),
    #[error("timed out waiting for rendezvous client={0:?}")]
    TimedOut(String),
    #[error("context cancelled waiting for rendezvous client={0:?}")]
    Cancelled(String),
    #[error("registration for {0:?} was removed")]
    Abandoned(String),
    #[error("reverse connection failed: {0}")]
    Connection(String),
}

/// Why a reverse connection was refused. Carries the HTTP status to answer with.
#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum ReverseRejection {
    #[error("buildlet registration requires SSL")]
    NotTls,
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("not expecting buildlet client")]
    NotExpected,
    #[error("invalid authentication Token")]
    InvalidToken,
}

impl ReverseRejection {
    pub fn status_code(&self) -> u16 {
        match self {
            ReverseRejection::NotTls => 500,
            ReverseRejection::MissingHeader(_) => 400,
            ReverseRejection::NotExpected | ReverseRejection::InvalidToken => 412,
        }
    }
}

/// What the HTTP layer extracted from a `/reverse` request.
#[derive(Debug, Clone, Default)]
pub struct ReverseRequest<'a> {
    pub tls: bool,
    pub id: Option<&'a str>,
    pub token: Option<&'a str>,
    pub hostname: Option<&'a str>,
}

type Outcome = Result<Arc<dyn BuildletClient>, RendezvousError>;

/// A header value, treating empty as absent.
fn present(v: Option<&str>) -> Option<&str> {
    v.filter(|s| !s.is_empty())
}

struct Entry {
    seq: u64,
    deadline: Instant,
    tx: Option<oneshot::Sender<Outcome>>,
    rx: Option<oneshot::Receiver<Outcome>>,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

impl Registry {
    /// Removes `id` only if it is still the registration numbered `seq`.
    fn remove_if_current(&mut self, id: &str, seq: u64) {
        if self.entries.get(id).is_some_and(|e| e.seq == seq) {
            self.entries.remove(id);
        }
    }
}

struct RdvInner {
    registry: Mutex<Registry>,
    validator: Arc<dyn TokenValidator>,
}

impl RdvInner {
    async fn purge_expired_registrations(&self) {
        let now = Instant::now();
        let mut registry = self.registry.lock().await;
        let expired: Vec<String> = registry
            .entries
            .iter()
            // a slot already handed to a connection delivers on its own
            .filter(|(_, e)| e.tx.is_some() && now >= e.deadline)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(mut entry) = registry.entries.remove(&id) {
                tracing::info!(instance = %id, "rendezvous: stopped waiting for instance due to timeout");
                if let Some(tx) = entry.tx.take() {
                    let _ = tx.send(Err(RendezvousError::TimedOut(id.clone())));
                }
            }
        }
    }
}

/// Registry of machines the broker is waiting on.
pub struct Rendezvous {
    inner: Arc<RdvInner>,
    sweeper: PeriodicTask,
}

impl Rendezvous {
    /// Creates a registry whose expired registrations are failed every
    /// `sweep_interval`.
    pub fn new(sweep_interval: Duration, validator: Arc<dyn TokenValidator>) -> Self {
        let inner = Arc::new(RdvInner {
            registry: Mutex::new(Registry::default()),
            validator,
        });
        let sweep_inner = inner.clone();
        let sweeper = PeriodicTask::spawn("rendezvous-sweep", sweep_interval, move || {
            let inner = sweep_inner.clone();
            async move { inner.purge_expired_registrations().await }
        });
        Self { inner, sweeper }
    }

    /// Stops the sweep and waits for it to exit.
    pub async fn close(&self) {
        self.sweeper.shutdown().await;
    }

    /// Declares that a machine named `id` is expected within `wait`.
    /// Replaces any earlier registration for the same ID.
    pub async fn register_instance(&self, id: &str, wait: Duration) {
        let (tx, rx) = oneshot::channel();
        let mut registry = self.inner.registry.lock().await;
        let seq = registry.next_seq;
        registry.next_seq += 1;
        registry.entries.insert(
            id.to_string(),
            Entry {
                seq,
                deadline: Instant::now() + wait,
                tx: Some(tx),
                rx: Some(rx),
            },
        );
        tracing::debug!(instance = %id, ?wait, "rendezvous: registered instance");
    }

    /// Drops a registration without waiting for it.
    pub async fn deregister_instance(&self, id: &str) {
        self.inner.registry.lock().await.entries.remove(id);
    }

    /// Blocks until the machine connects, the registration times out, or
    /// `ctx` is cancelled. The registration is gone when this returns.
    pub async fn wait_for_instance(
        &self,
        ctx: &CancellationToken,
        id: &str,
    ) -> Result<Arc<dyn BuildletClient>, RendezvousError> {
        let (seq, rx) = {
            let mut registry = self.inner.registry.lock().await;
            let entry = registry
                .entries
                .get_mut(id)
                .ok_or_else(|| RendezvousError::NotFound(id.to_string()))?;
            let rx = entry
                .rx
                .take()
                .ok_or_else(|| RendezvousError::NotFound(id.to_string()))?;
            (entry.seq, rx)
        };

        tokio::select! {
            _ = ctx.cancelled() => {
                self.inner.registry.lock().await.remove_if_current(id, seq);
                Err(RendezvousError::Cancelled(id.to_string()))
            }
            res = rx => {
                self.inner.registry.lock().await.remove_if_current(id, seq);
                match res {
                    Ok(outcome) => outcome,
                    Err(_) => Err(RendezvousError::Abandoned(id.to_string())),
                }
            }
        }
    }

    /// Checks a reverse connection and claims its registration.
    ///
    /// On success the returned slot is the only way to complete the
    /// registration; a second connection for the same ID is refused.
    pub async fn accept_reverse(
        &self,
        req: &ReverseRequest<'_>,
    ) -> Result<ReverseSlot, ReverseRejection> {
        if !req.tls {
            return Err(ReverseRejection::NotTls);
        }
        let hostname =
            present(req.hostname).ok_or(ReverseRejection::MissingHeader(HEADER_HOSTNAME))?;
        let id = present(req.id).ok_or(ReverseRejection::MissingHeader(HEADER_ID))?;
        let token = present(req.token).ok_or(ReverseRejection::MissingHeader(HEADER_TOKEN))?;

        let seq = {
            let registry = self.inner.registry.lock().await;
            match registry.entries.get(id) {
                Some(e) if e.tx.is_some() => e.seq,
                _ => return Err(ReverseRejection::NotExpected),
            }
        };

        if !self.inner.validator.validate(token).await {
            tracing::warn!(instance = %id, hostname, "rendezvous: unable to validate authentication token");
            return Err(ReverseRejection::InvalidToken);
        }

        let mut registry = self.inner.registry.lock().await;
        let tx = registry
            .entries
            .get_mut(id)
            .filter(|e| e.seq == seq)
            .and_then(|e| e.tx.take())
            .ok_or(ReverseRejection::NotExpected)?;
        Ok(ReverseSlot {
            id: id.to_string(),
            hostname: hostname.to_string(),
            tx,
        })
    }

    /// Number of registrations made before `id` that are still unmatched.
    pub async fn pending_before(&self, id: &str) -> usize {
        let registry = self.inner.registry.lock().await;
        let Some(seq) = registry.entries.get(id).map(|e| e.seq) else {
            return 0;
        };
        registry
            .entries
            .values()
            .filter(|e| e.seq < seq && e.tx.is_some())
            .count()
    }

    pub async fn is_registered(&self, id: &str) -> bool {
        self.inner.registry.lock().await.entries.contains_key(id)
    }

    /// Runs one expiry sweep now.
    pub async fn purge_expired_registrations(&self) {
        self.inner.purge_expired_registrations().await
    }
}

/// A claimed registration, completed once the reverse connection has been
/// turned into a buildlet client. Dropping it unused fails the waiter.
pub struct ReverseSlot {
    id: String,
    hostname: String,
    tx: oneshot::Sender<Outcome>,
}

impl ReverseSlot {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn deliver(self, outcome: Outcome) {
        match &outcome {
            Ok(bc) => tracing::info!(instance = %self.id, hostname = %self.hostname, addr = %bc.remote_addr(), "rendezvous: buildlet connected"),
            Err(e) => tracing::warn!(instance = %self.id, hostname = %self.hostname, error = %e, "rendezvous: reverse connection failed"),
        }
        if self.tx.send(outcome).is_err() {
            tracing::debug!(instance = %self.id, "rendezvous: waiter already gone");
        }
    }
}
