//! Finding a machine for a new session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::buildlet::{BuildletClient, FakeBuildlet};
use crate::rendezvous::{Rendezvous, RendezvousError};

/// One outstanding request for a machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedItem {
    pub host_type: String,
    pub builder_type: String,
    /// Caller's user name, as derived from their email.
    pub user: String,
    pub is_gomote: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaiterState {
    /// Requests queued ahead of this one.
    pub ahead: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),
    #[error("launching instance {id}: {reason}")]
    Launch { id: String, reason: String },
    #[error("no capacity for host type {0}")]
    NoCapacity(String),
    #[error("cancelled")]
    Cancelled,
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Blocks until a machine for `item` is ready or `ctx` is cancelled.
    async fn get_buildlet(
        &self,
        ctx: &CancellationToken,
        item: &SchedItem,
    ) -> Result<Arc<dyn BuildletClient>, ScheduleError>;

    async fn waiter_state(&self, item: &SchedItem) -> WaiterState;
}

// ── RendezvousScheduler ───────────────────────────────────────────────────────

/// Registers a fresh instance ID with the rendezvous, optionally runs a
/// command that boots a machine for it, and waits for the machine to dial
/// back.
pub struct RendezvousScheduler {
    rendezvous: Arc<Rendezvous>,
    wait: Duration,
    /// Program and arguments. `GOMOTE_ID` and `GOMOTE_HOST_TYPE` are set in
    /// its environment.
    launch_command: Vec<String>,
    /// Instance IDs currently being waited on, mapped to their user.
    pending: DashMap<String, String>,
}

/// Undoes a request's bookkeeping however `get_buildlet` ends, including
/// when its future is dropped mid-wait.
struct PendingGuard<'a> {
    sched: &'a RendezvousScheduler,
    id: String,
    /// Still registered with the rendezvous.
    registered: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.sched.pending.remove(&self.id);
        if !self.registered {
            return;
        }
        let rendezvous = self.sched.rendezvous.clone();
        let id = std::mem::take(&mut self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move { rendezvous.deregister_instance(&id).await });
            }
            Err(_) => tracing::warn!(instance = %id, "no runtime to deregister abandoned instance"),
        }
    }
}

impl RendezvousScheduler {
    pub fn new(rendezvous: Arc<Rendezvous>, wait: Duration, launch_command: Vec<String>) -> Self {
        Self {
            rendezvous,
            wait,
            launch_command,
            pending: DashMap::new(),
        }
    }

    /// IDs of the requests still waiting for a machine.
    pub fn pending_ids(&self) -> Vec<String> {
        self.pending.iter().map(|e| e.key().clone()).collect()
    }

    async fn launch(&self, id: &str, item: &SchedItem) -> Result<(), ScheduleError> {
        let Some((program, args)) = self.launch_command.split_first() else {
            tracing::info!(instance = %id, "waiting for externally launched buildlet");
            return Ok(());
        };
        let status = tokio::process::Command::new(program)
            .args(args)
            .env("GOMOTE_ID", id)
            .env("GOMOTE_HOST_TYPE", &item.host_type)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| ScheduleError::Launch {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        if !status.success() {
            return Err(ScheduleError::Launch {
                id: id.to_string(),
                reason: status.to_string(),
            });
        }
        tracing::info!(instance = %id, program = %program, "launch command finished");
        Ok(())
    }

    async fn wait_for(
        &self,
        ctx: &CancellationToken,
        id: &str,
        item: &SchedItem,
    ) -> Result<Arc<dyn BuildletClient>, ScheduleError> {
        tokio::select! {
            _ = ctx.cancelled() => return Err(ScheduleError::Cancelled),
            res = self.launch(id, item) => res?,
        }
        Ok(self.rendezvous.wait_for_instance(ctx, id).await?)
    }
}

#[async_trait]
impl Scheduler for RendezvousScheduler {
    async fn get_buildlet(
        &self,
        ctx: &CancellationToken,
        item: &SchedItem,
    ) -> Result<Arc<dyn BuildletClient>, ScheduleError> {
        let id = format!("gomote-{}-{}", item.user, uuid::Uuid::new_v4());
        self.rendezvous.register_instance(&id, self.wait).await;
        self.pending.insert(id.clone(), item.user.clone());
        let mut guard = PendingGuard {
            sched: self,
            id: id.clone(),
            registered: true,
        };
        tracing::info!(instance = %id, host_type = %item.host_type, "waiting for buildlet");

        let res = self.wait_for(ctx, &id, item).await;
        if res.is_err() {
            self.rendezvous.deregister_instance(&id).await;
        }
        // every path out of wait_for leaves nothing registered
        guard.registered = false;
        res
    }

    async fn waiter_state(&self, item: &SchedItem) -> WaiterState {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|e| e.value() == &item.user)
            .map(|e| e.key().clone())
            .collect();
        // the caller's newest request has the most registrations ahead of it
        let mut ahead = 0;
        for id in ids {
            ahead = ahead.max(self.rendezvous.pending_before(&id).await);
        }
        WaiterState { ahead }
    }
}

// ── FakeScheduler ─────────────────────────────────────────────────────────────

/// Hands out [`FakeBuildlet`]s after an optional delay.
pub struct FakeScheduler {
    delay: Duration,
    fail: Option<String>,
    created: tokio::sync::Mutex<Vec<Arc<FakeBuildlet>>>,
}

impl FakeScheduler {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            fail: None,
            created: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Every request fails with `reason`.
    pub fn failing(reason: &str) -> Self {
        Self {
            fail: Some(reason.to_string()),
            ..Self::new()
        }
    }

    /// Buildlets handed out so far.
    pub async fn created(&self) -> Vec<Arc<FakeBuildlet>> {
        self.created.lock().await.clone()
    }
}

impl Default for FakeScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scheduler for FakeScheduler {
    async fn get_buildlet(
        &self,
        ctx: &CancellationToken,
        item: &SchedItem,
    ) -> Result<Arc<dyn BuildletClient>, ScheduleError> {
        tokio::select! {
            _ = ctx.cancelled() => return Err(ScheduleError::Cancelled),
            _ = tokio::time::sleep(self.delay) => {}
        }
        if let Some(reason) = &self.fail {
            return Err(ScheduleError::NoCapacity(format!("{}: {reason}", item.host_type)));
        }
        let mut created = self.created.lock().await;
        let bc = Arc::new(FakeBuildlet::new(format!(
            "fake-{}-{}",
            item.host_type,
            created.len()
        )));
        created.push(bc.clone());
        Ok(bc)
    }

    async fn waiter_state(&self, _item: &SchedItem) -> WaiterState {
        WaiterState::default()
    }
}
