use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::config::TaskPoolConfig;

/// Bounded pool for fire-and-forget bookkeeping (quota returns, webhook
/// delivery). Tasks are detached from the request that submitted them and
/// each one runs under its own timeout.
#[derive(Clone, Debug)]
pub struct TaskPool {
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl TaskPool {
    pub fn new(max_concurrency: usize, timeout: Duration) -> Self {
        Self {
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            timeout,
        }
    }

    pub fn from_config(config: &TaskPoolConfig) -> Self {
        Self::new(
            config.max_concurrency,
            Duration::from_secs(config.task_timeout_secs.max(1)),
        )
    }

    /// Must be called from within a tokio runtime. Never waits for a permit;
    /// the spawned task does.
    pub fn submit<F>(&self, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        let timeout = self.timeout;
        self.tracker.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                tracing::warn!(task = name, "task pool closed; dropping task");
                return;
            };
            if tokio::time::timeout(timeout, task).await.is_err() {
                tracing::warn!(
                    task = name,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "background task timed out"
                );
            }
        })
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Waits until every task submitted so far has finished.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::from_config(&TaskPoolConfig::default())
    }
}

/// Background loop running `tick` every `period` until stopped.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(
        name: &'static str,
        period: Duration,
        run_immediately: bool,
        mut tick: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let stopped = cancel.clone();
        let period = period.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            if !run_immediately {
                interval.tick().await;
            }
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            tracing::debug!(task = name, "periodic task stopped");
        });
        Self {
            name,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels the loop and waits for an in-progress tick to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cancel.cancel();
            handle.abort();
        }
    }
}
