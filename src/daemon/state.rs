//! Daemon process state — admission control, job tracking, and the
//! bounded execution-history buffer.
//!
//! One `DaemonState` value is constructed at startup and passed to every
//! handler; there are no ambient singletons. `stop()` tears it down:
//! admissions close first, in-flight jobs get a grace period, stragglers
//! are aborted.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{BackpressurePolicy, DaemonConfig};
use crate::daemon::exec::{self, ExecOrigin, ExecutionJob};
use crate::error::{Error, ExecutionError};
use crate::registry::SyncManager;
use crate::router::ExecuteTarget;

/// Bounded FIFO buffer of finished jobs.
#[derive(Clone)]
struct HistoryBuffer {
    inner: Arc<RwLock<VecDeque<ExecutionJob>>>,
    capacity: usize,
}

impl HistoryBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(VecDeque::new())),
            capacity,
        }
    }

    async fn push(&self, job: ExecutionJob) {
        let mut buf = self.inner.write().await;
        buf.push_back(job);
        while buf.len() > self.capacity {
            buf.pop_front();
        }
    }

    async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    async fn recent(&self, limit: usize) -> Vec<ExecutionJob> {
        self.inner.read().await.iter().rev().take(limit).cloned().collect()
    }

    async fn find(&self, id: Uuid) -> Option<ExecutionJob> {
        self.inner.read().await.iter().find(|j| j.id == id).cloned()
    }
}

/// Snapshot returned by `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub active_jobs: usize,
    pub queued_jobs: usize,
    pub peak_active: usize,
    pub history_len: usize,
    pub uptime_secs: u64,
    pub max_concurrent: usize,
    pub backpressure: String,
}

/// Process-wide daemon state.
pub struct DaemonState {
    config: DaemonConfig,
    sync: Arc<SyncManager>,
    semaphore: Arc<Semaphore>,
    /// Requests currently waiting for a permit (queue policy only).
    queued: Arc<AtomicUsize>,
    /// Jobs currently running. The semaphore enforces the bound; this is
    /// the observable gauge.
    active: Arc<AtomicUsize>,
    peak_active: Arc<AtomicUsize>,
    running: RwLock<HashMap<Uuid, JoinHandle<()>>>,
    history: HistoryBuffer,
    started_at: Instant,
    shutting_down: AtomicBool,
}

impl DaemonState {
    pub fn new(config: DaemonConfig, sync: Arc<SyncManager>) -> Arc<Self> {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        let history = HistoryBuffer::new(config.history_capacity);
        Arc::new(Self {
            config,
            sync,
            semaphore,
            queued: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            peak_active: Arc::new(AtomicUsize::new(0)),
            running: RwLock::new(HashMap::new()),
            history,
            started_at: Instant::now(),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    /// Execute a command through the registry, honoring the concurrency
    /// limit and backpressure policy. Waits for the job to finish and
    /// returns its terminal record.
    pub async fn execute(
        &self,
        command: &str,
        args: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<ExecutionJob, ExecutionError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ExecutionError::ShuttingDown);
        }

        let record = self
            .sync
            .store()
            .resolve(command)
            .await
            .map_err(|e| ExecutionError::SpawnFailed {
                name: command.to_string(),
                reason: format!("manifest store error: {e}"),
            })?
            .ok_or_else(|| ExecutionError::CommandNotFound {
                name: command.to_string(),
            })?;

        let permit = self.admit().await?;
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let grace = self.config.kill_grace;

        let job_key = Uuid::new_v4();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let active = Arc::clone(&self.active);
        let peak = Arc::clone(&self.peak_active);
        let history = self.history.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now_active, Ordering::SeqCst);

            let result = exec::run_script(&record, &args, timeout, grace, ExecOrigin::Daemon).await;

            active.fetch_sub(1, Ordering::SeqCst);
            if let Ok(ref job) = result {
                history.push(job.clone()).await;
            }
            let _ = tx.send(result);
        });

        self.running.write().await.insert(job_key, handle);
        let result = rx.await.map_err(|_| ExecutionError::ShuttingDown);
        self.running.write().await.remove(&job_key);
        result?
    }

    /// Acquire an execution permit according to the backpressure policy.
    async fn admit(&self) -> Result<OwnedSemaphorePermit, ExecutionError> {
        match self.config.backpressure {
            BackpressurePolicy::Reject => Arc::clone(&self.semaphore)
                .try_acquire_owned()
                .map_err(|_| ExecutionError::Busy {
                    limit: self.config.max_concurrent,
                }),
            BackpressurePolicy::Queue { capacity } => {
                // Fast path: a permit is free, no queueing involved.
                if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
                    return Ok(permit);
                }
                if self.queued.fetch_add(1, Ordering::SeqCst) >= capacity {
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    return Err(ExecutionError::QueueFull { capacity });
                }
                let acquired = Arc::clone(&self.semaphore).acquire_owned().await;
                self.queued.fetch_sub(1, Ordering::SeqCst);
                acquired.map_err(|_| ExecutionError::ShuttingDown)
            }
        }
    }

    /// Most recent executions, newest first.
    pub async fn history(&self, limit: usize) -> Vec<ExecutionJob> {
        self.history.recent(limit).await
    }

    /// Look up one execution by id.
    pub async fn job(&self, id: Uuid) -> Option<ExecutionJob> {
        self.history.find(id).await
    }

    /// Status snapshot for `/status`.
    pub async fn status(&self) -> DaemonStatus {
        DaemonStatus {
            active_jobs: self.active.load(Ordering::SeqCst),
            queued_jobs: self.queued.load(Ordering::SeqCst),
            peak_active: self.peak_active.load(Ordering::SeqCst),
            history_len: self.history.len().await,
            uptime_secs: self.started_at.elapsed().as_secs(),
            max_concurrent: self.config.max_concurrent,
            backpressure: match self.config.backpressure {
                BackpressurePolicy::Reject => "reject".to_string(),
                BackpressurePolicy::Queue { capacity } => format!("queue:{capacity}"),
            },
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop accepting work, give in-flight jobs a grace period, then
    /// abort stragglers (their children die via kill-on-drop).
    pub async fn stop(&self, grace: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.semaphore.close();

        let deadline = Instant::now() + grace;
        while self.active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let mut running = self.running.write().await;
        let stragglers = running.len();
        for (_, handle) in running.drain() {
            if !handle.is_finished() {
                handle.abort();
            }
        }
        if stragglers > 0 {
            tracing::warn!(count = stragglers, "Aborted jobs still running at shutdown");
        }
        tracing::info!("Daemon state torn down");
    }
}

#[async_trait]
impl ExecuteTarget for DaemonState {
    async fn dispatch(
        &self,
        command: &str,
        args: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<ExecutionJob, Error> {
        Ok(self.execute(command, args, timeout).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    async fn state_with_scripts(
        root: &Path,
        max_concurrent: usize,
        backpressure: BackpressurePolicy,
        scripts: &[(&str, &str)],
    ) -> Arc<DaemonState> {
        for (name, body) in scripts {
            tokio::fs::write(root.join(name), body).await.unwrap();
        }
        let sync = Arc::new(SyncManager::new(root.to_path_buf()));
        sync.sync_all().await;
        let config = DaemonConfig {
            max_concurrent,
            backpressure,
            history_capacity: 5,
            default_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_millis(200),
            ..DaemonConfig::default()
        };
        DaemonState::new(config, sync)
    }

    #[tokio::test]
    async fn execute_unknown_command_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state_with_scripts(tmp.path(), 2, BackpressurePolicy::Reject, &[]).await;

        let err = state.execute("nope", vec![], None).await.unwrap_err();
        assert!(matches!(err, ExecutionError::CommandNotFound { .. }));
    }

    #[tokio::test]
    async fn execute_runs_and_records_history() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state_with_scripts(
            tmp.path(),
            2,
            BackpressurePolicy::Reject,
            &[("hi.sh", "echo hi\n")],
        )
        .await;

        let job = state.execute("hi", vec![], None).await.unwrap();
        assert_eq!(job.status, crate::daemon::exec::JobStatus::Succeeded);
        assert_eq!(job.origin, ExecOrigin::Daemon);

        let history = state.history(10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, job.id);
        assert!(state.job(job.id).await.is_some());
    }

    #[tokio::test]
    async fn reject_policy_fails_fast_at_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state_with_scripts(
            tmp.path(),
            1,
            BackpressurePolicy::Reject,
            &[("slow.sh", "sleep 2\n"), ("fast.sh", "echo fast\n")],
        )
        .await;

        let bg = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.execute("slow", vec![], None).await })
        };
        // Let the slow job take the only permit.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let err = state.execute("fast", vec![], None).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Busy { limit: 1 }));
        bg.abort();
    }

    #[tokio::test]
    async fn queue_policy_bounds_concurrency() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state_with_scripts(
            tmp.path(),
            2,
            BackpressurePolicy::Queue { capacity: 10 },
            &[("nap.sh", "sleep 0.2\n")],
        )
        .await;

        let mut handles = Vec::new();
        for _ in 0..6 {
            let state = Arc::clone(&state);
            handles.push(tokio::spawn(
                async move { state.execute("nap", vec![], None).await },
            ));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let status = state.status().await;
        assert!(
            status.peak_active <= 2,
            "concurrency bound violated: peak {}",
            status.peak_active
        );
        assert_eq!(status.active_jobs, 0);
    }

    #[tokio::test]
    async fn queue_policy_rejects_when_queue_full() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state_with_scripts(
            tmp.path(),
            1,
            BackpressurePolicy::Queue { capacity: 1 },
            &[("slow.sh", "sleep 2\n")],
        )
        .await;

        let first = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.execute("slow", vec![], None).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        let second = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.execute("slow", vec![], None).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Limit held by #1, queue held by #2; #3 must bounce.
        let err = state.execute("slow", vec![], None).await.unwrap_err();
        assert!(matches!(err, ExecutionError::QueueFull { capacity: 1 }));
        first.abort();
        second.abort();
    }

    #[tokio::test]
    async fn history_evicts_oldest_beyond_capacity() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state_with_scripts(
            tmp.path(),
            2,
            BackpressurePolicy::Reject,
            &[("hi.sh", "echo hi\n")],
        )
        .await;

        // history_capacity is 5 in the fixture
        for _ in 0..7 {
            state.execute("hi", vec![], None).await.unwrap();
        }
        assert_eq!(state.status().await.history_len, 5);
    }

    #[tokio::test]
    async fn stop_rejects_new_work() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state_with_scripts(
            tmp.path(),
            2,
            BackpressurePolicy::Reject,
            &[("hi.sh", "echo hi\n")],
        )
        .await;

        state.stop(Duration::from_millis(100)).await;
        let err = state.execute("hi", vec![], None).await.unwrap_err();
        assert!(matches!(err, ExecutionError::ShuttingDown));
    }
}
