//! Cancellable periodic background task.

use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Runs a job every `period` until shut down. The first run happens one
/// period after spawning.
pub struct PeriodicTask {
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => job().await,
                }
            }
            tracing::debug!(task = name, "periodic task stopped");
        });
        Self {
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stops the task and waits for it to exit. Later calls return at once.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "periodic task panicked");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
