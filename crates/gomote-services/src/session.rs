//! Session pool: The registry of leased gomote instances.
//!
//! Sessions are keyed by `{user}-{builderType}-{n}` and expire after an idle
//! timeout unless renewed. A background sweep removes expired sessions and
//! closes their buildlets after the pool lock has been released, so a slow
//! teardown never blocks new sessions.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use gomote_core::config::SessionConfig;

use crate::buildlet::BuildletClient;
use crate::periodic::PeriodicTask;

#[derive(Debug, Clone)]
pub struct SessionPoolConfig {
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub keepalive_interval: Duration,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for SessionPoolConfig {
    fn from(c: &SessionConfig) -> Self {
        Self {
            idle_timeout: c.idle_timeout(),
            sweep_interval: c.sweep_interval(),
            keepalive_interval: c.keepalive_interval(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("session not found: {0}")]
    NotFound(String),
}

/// Public fields of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub id: String,
    pub owner_id: String,
    /// User name the ID was derived from.
    pub user_name: String,
    pub builder_type: String,
    pub host_type: String,
    pub swarming_task_id: Option<String>,
    pub created: SystemTime,
    /// `None` means the session is not subject to expiry.
    pub expires: Option<SystemTime>,
}

struct Session {
    view: SessionView,
    client: Arc<dyn BuildletClient>,
}

impl Session {
    fn is_expired(&self, now: SystemTime) -> bool {
        matches!(self.view.expires, Some(t) if t < now)
    }

    /// Pushes expiry out to now + idle. Never moves it earlier.
    fn renew(&mut self, idle: Duration) {
        let next = SystemTime::now() + idle;
        self.view.expires = Some(match self.view.expires {
            Some(current) if current > next => current,
            _ => next,
        });
    }
}

struct PoolInner {
    config: SessionPoolConfig,
    sessions: RwLock<BTreeMap<String, Session>>,
    shutdown: CancellationToken,
}

impl PoolInner {
    async fn renew(&self, id: &str) -> Result<(), PoolError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| PoolError::NotFound(id.to_string()))?;
        session.renew(self.config.idle_timeout);
        Ok(())
    }

    async fn destroy_expired_sessions(&self, now: SystemTime) {
        let expired: Vec<Session> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.is_expired(now))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        if expired.is_empty() {
            return;
        }
        tracing::debug!(count = expired.len(), "expired gomote sessions");
        for session in expired {
            if let Err(e) = session.client.close().await {
                tracing::warn!(id = %session.view.id, error = %e, "failed to close expired buildlet");
            }
            tracing::info!(id = %session.view.id, owner = %session.view.owner_id, "destroyed expired gomote session");
        }
    }
}

/// Concurrency-safe registry of active sessions.
pub struct SessionPool {
    inner: Arc<PoolInner>,
    sweeper: PeriodicTask,
}

impl SessionPool {
    /// Creates a pool and starts its expiry sweep.
    pub fn new(config: SessionPoolConfig) -> Self {
        let inner = Arc::new(PoolInner {
            config,
            sessions: RwLock::new(BTreeMap::new()),
            shutdown: CancellationToken::new(),
        });
        let sweep_inner = inner.clone();
        let sweeper = PeriodicTask::spawn("session-sweep", inner.config.sweep_interval, move || {
            let inner = sweep_inner.clone();
            async move { inner.destroy_expired_sessions(SystemTime::now()).await }
        });
        Self { inner, sweeper }
    }

    /// Stops the sweep and all keep-alive tasks, waiting for the sweep to exit.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.sweeper.shutdown().await;
    }

    /// Registers a new session and returns its ID.
    pub async fn add_session(
        &self,
        owner_id: &str,
        user_name: &str,
        builder_type: &str,
        host_type: &str,
        swarming_task_id: Option<String>,
        client: Arc<dyn BuildletClient>,
    ) -> String {
        let mut sessions = self.inner.sessions.write().await;
        let id = (0u64..)
            .map(|n| format!("{user_name}-{builder_type}-{n}"))
            .find(|id| !sessions.contains_key(id))
            .unwrap_or_default();
        let now = SystemTime::now();
        sessions.insert(
            id.clone(),
            Session {
                view: SessionView {
                    id: id.clone(),
                    owner_id: owner_id.to_string(),
                    user_name: user_name.to_string(),
                    builder_type: builder_type.to_string(),
                    host_type: host_type.to_string(),
                    swarming_task_id,
                    created: now,
                    expires: Some(now + self.inner.config.idle_timeout),
                },
                client,
            },
        );
        tracing::info!(id = %id, owner = owner_id, host_type, "added gomote session");
        id
    }

    /// Returns the session's fields and renews its timeout.
    pub async fn session(&self, id: &str) -> Result<SessionView, PoolError> {
        let mut sessions = self.inner.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| PoolError::NotFound(id.to_string()))?;
        session.renew(self.inner.config.idle_timeout);
        Ok(session.view.clone())
    }

    pub async fn renew_timeout(&self, id: &str) -> Result<(), PoolError> {
        self.inner.renew(id).await
    }

    /// Renews the session now and then every keep-alive interval until `ctx`
    /// is cancelled, the pool is closed, or the session disappears.
    pub async fn keep_alive(&self, ctx: CancellationToken, id: &str) -> Result<(), PoolError> {
        self.inner.renew(id).await?;

        let inner = self.inner.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let period = inner.config.keepalive_interval;
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = inner.shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = inner.renew(&id).await {
                            tracing::debug!(id = %id, error = %e, "stopping keep-alive");
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Removes the session and closes its buildlet.
    pub async fn destroy_session(&self, id: &str) -> Result<(), PoolError> {
        let session = self
            .inner
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| PoolError::NotFound(id.to_string()))?;
        if let Err(e) = session.client.close().await {
            tracing::warn!(id = %id, error = %e, "failed to close buildlet");
        }
        tracing::info!(id = %id, "destroyed gomote session");
        Ok(())
    }

    /// Snapshot of all sessions, sorted by ID.
    pub async fn list(&self) -> Vec<SessionView> {
        self.inner
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.view.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.sessions.read().await.is_empty()
    }

    /// True if any session's buildlet reports `instance_name`.
    pub async fn is_session(&self, instance_name: &str) -> bool {
        self.inner
            .sessions
            .read()
            .await
            .values()
            .any(|s| s.client.instance_name() == instance_name)
    }

    pub async fn buildlet_client(&self, id: &str) -> Result<Arc<dyn BuildletClient>, PoolError> {
        self.inner
            .sessions
            .read()
            .await
            .get(id)
            .map(|s| s.client.clone())
            .ok_or_else(|| PoolError::NotFound(id.to_string()))
    }

    /// Runs one expiry sweep as of `now`.
    pub async fn destroy_expired_sessions(&self, now: SystemTime) {
        self.inner.destroy_expired_sessions(now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buildlet::FakeBuildlet;

    const OWNER: &str = "accounts.google.com:user-xyz-124";

    fn pool() -> SessionPool {
        SessionPool::new(SessionPoolConfig::default())
    }

    fn fake(name: &str) -> Arc<FakeBuildlet> {
        Arc::new(FakeBuildlet::new(name))
    }

    impl SessionPool {
        async fn set_expires(&self, id: &str, expires: Option<SystemTime>) {
            let mut sessions = self.inner.sessions.write().await;
            sessions.get_mut(id).unwrap().view.expires = expires;
        }
    }

    #[tokio::test]
    async fn ids_are_distinct_and_fill_lowest_slot() {
        let sp = pool();
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(
                sp.add_session(OWNER, "test-user", "builder-x", "host-x", None, fake("i"))
                    .await,
            );
        }
        assert_eq!(
            ids,
            vec![
                "test-user-builder-x-0",
                "test-user-builder-x-1",
                "test-user-builder-x-2",
                "test-user-builder-x-3",
            ]
        );

        sp.destroy_session("test-user-builder-x-1").await.unwrap();
        let id = sp
            .add_session(OWNER, "test-user", "builder-x", "host-x", None, fake("i"))
            .await;
        assert_eq!(id, "test-user-builder-x-1");
        let id = sp
            .add_session(OWNER, "test-user", "builder-x", "host-x", None, fake("i"))
            .await;
        assert_eq!(id, "test-user-builder-x-4");
        sp.close().await;
    }

    #[tokio::test]
    async fn new_sessions_survive_sweep() {
        let sp = pool();
        for _ in 0..4 {
            sp.add_session(OWNER, "test-user", "builder-type-x", "host-type-x", None, fake("i"))
                .await;
        }
        sp.destroy_expired_sessions(SystemTime::now()).await;
        assert_eq!(sp.len().await, 4);
        sp.close().await;
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_and_closes_them() {
        let sp = pool();
        let stale_bc = fake("stale");
        let fresh_bc = fake("fresh");
        let pinned_bc = fake("pinned");
        let stale = sp
            .add_session(OWNER, "u", "b", "h", None, stale_bc.clone())
            .await;
        let fresh = sp
            .add_session(OWNER, "u", "b", "h", None, fresh_bc.clone())
            .await;
        let pinned = sp
            .add_session(OWNER, "u", "b", "h", None, pinned_bc.clone())
            .await;
        sp.set_expires(&stale, Some(SystemTime::now() - Duration::from_secs(60)))
            .await;
        sp.set_expires(&pinned, None).await;

        sp.destroy_expired_sessions(SystemTime::now()).await;

        assert!(matches!(sp.session(&stale).await, Err(PoolError::NotFound(_))));
        assert!(sp.session(&fresh).await.is_ok());
        assert!(sp.session(&pinned).await.is_ok());
        assert!(stale_bc.is_closed());
        assert!(!fresh_bc.is_closed());
        assert!(!pinned_bc.is_closed());
        sp.close().await;
    }

    #[tokio::test]
    async fn reading_an_unswept_expired_session_renews_it() {
        let sp = pool();
        let id = sp.add_session(OWNER, "u", "b", "h", None, fake("i")).await;
        let past = SystemTime::now() - Duration::from_secs(1);
        sp.set_expires(&id, Some(past)).await;

        let view = sp.session(&id).await.unwrap();
        assert!(view.expires.unwrap() > SystemTime::now());

        // the renewal happened first, so the sweep leaves it alone
        sp.destroy_expired_sessions(SystemTime::now()).await;
        assert!(sp.session(&id).await.is_ok());
        sp.close().await;
    }

    #[tokio::test]
    async fn list_is_sorted_snapshot() {
        let sp = pool();
        for i in [3, 0, 2, 1] {
            sp.add_session(OWNER, &format!("user-{i}"), "builder", "host", None, fake("i"))
                .await;
        }
        let got = sp.list().await;
        assert_eq!(got.len(), 4);
        let ids: Vec<_> = got.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "user-0-builder-0",
                "user-1-builder-0",
                "user-2-builder-0",
                "user-3-builder-0"
            ]
        );
        sp.close().await;
    }

    #[tokio::test]
    async fn destroy_twice_is_not_found() {
        let sp = pool();
        let bc = fake("i");
        let id = sp.add_session(OWNER, "u", "b", "h", None, bc.clone()).await;
        sp.destroy_session(&id).await.unwrap();
        assert!(bc.is_closed());
        assert_eq!(
            sp.destroy_session(&id).await,
            Err(PoolError::NotFound(id.clone()))
        );
        assert!(sp.buildlet_client(&id).await.is_err());
        sp.close().await;
    }

    #[tokio::test]
    async fn renew_never_shortens_expiry() {
        let sp = pool();
        let id = sp.add_session(OWNER, "u", "b", "h", None, fake("i")).await;
        let far = SystemTime::now() + Duration::from_secs(24 * 3600);
        sp.set_expires(&id, Some(far)).await;
        for _ in 0..3 {
            sp.renew_timeout(&id).await.unwrap();
        }
        assert_eq!(sp.session(&id).await.unwrap().expires, Some(far));

        let mut last = None;
        sp.set_expires(&id, Some(SystemTime::now())).await;
        for _ in 0..3 {
            sp.renew_timeout(&id).await.unwrap();
            let e = sp.list().await[0].expires;
            assert!(e >= last);
            last = e;
        }
        sp.close().await;
    }

    #[tokio::test]
    async fn renew_unknown_session_fails() {
        let sp = pool();
        let id = sp.add_session(OWNER, "user-x", "builder", "host", None, fake("i")).await;
        assert!(sp.renew_timeout(&id).await.is_ok());
        assert_eq!(
            sp.renew_timeout(&format!("{id}-wrong")).await,
            Err(PoolError::NotFound(format!("{id}-wrong")))
        );
        sp.close().await;
    }

    #[tokio::test]
    async fn is_session_matches_instance_name() {
        let sp = pool();
        sp.add_session(OWNER, "u", "b", "h", None, fake("gomote-u-abc")).await;
        assert!(sp.is_session("gomote-u-abc").await);
        assert!(!sp.is_session("gomote-u-abd").await);
        sp.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_renews_until_cancelled() {
        let sp = SessionPool::new(SessionPoolConfig {
            idle_timeout: Duration::from_secs(1800),
            sweep_interval: Duration::from_secs(3600),
            keepalive_interval: Duration::from_secs(60),
        });
        let id = sp.add_session(OWNER, "u", "b", "h", None, fake("i")).await;

        let ctx = CancellationToken::new();
        assert!(sp.keep_alive(ctx.clone(), "missing").await.is_err());
        sp.keep_alive(ctx.clone(), &id).await.unwrap();

        sp.set_expires(&id, Some(SystemTime::now())).await;
        tokio::time::sleep(Duration::from_secs(61)).await;
        let renewed = sp.list().await[0].expires.unwrap();
        assert!(renewed > SystemTime::now() + Duration::from_secs(1000));

        ctx.cancel();
        tokio::task::yield_now().await;
        sp.set_expires(&id, None).await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(sp.list().await[0].expires, None);
        sp.close().await;
    }

    #[tokio::test]
    async fn keep_alive_stops_after_destroy() {
        let sp = pool();
        let id = sp.add_session(OWNER, "u", "b", "h", None, fake("i")).await;
        sp.keep_alive(CancellationToken::new(), &id).await.unwrap();
        sp.destroy_session(&id).await.unwrap();
        // nothing resurrects the session
        assert!(sp.session(&id).await.is_err());
        sp.close().await;
    }
}
