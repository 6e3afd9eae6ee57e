//! Cron scheduler — persisted job definitions and the periodic tick that
//! fires due jobs through an execution target.
//!
//! Overlap policy: when a job's previous invocation is still running at
//! its next due tick, that tick is skipped and `next_run` advances. The
//! skip is logged and recorded as the job's `last_status`.

pub mod cron;
pub mod job;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::daemon::exec::JobStatus;
use crate::error::SchedulerError;
use crate::router::ExecuteTarget;
use cron::CronSpec;
use job::{JobStore, ScheduledJob};

/// Arg patterns that get a warning at `add_job` time. They do not block
/// the job — the scheduler is not a sandbox — but they are worth flagging
/// before something fires unattended at 3am.
static DANGEROUS_ARG_PATTERNS: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    vec![
        "rm -rf /",
        "mkfs",
        "dd if=",
        "> /dev/sd",
        "chmod -R 777",
        ":(){",
    ]
});

/// The cron scheduler.
pub struct Scheduler {
    config: SchedulerConfig,
    store: JobStore,
    jobs: RwLock<Vec<ScheduledJob>>,
    target: Arc<dyn ExecuteTarget>,
    /// Jobs with an invocation currently in flight.
    running: Mutex<HashSet<Uuid>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, target: Arc<dyn ExecuteTarget>) -> Arc<Self> {
        let store = JobStore::new(config.store_path.clone());
        Arc::new(Self {
            config,
            store,
            jobs: RwLock::new(Vec::new()),
            target,
            running: Mutex::new(HashSet::new()),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Load persisted jobs. Invalid cron expressions disable their job;
    /// a corrupt store starts empty rather than taking the daemon down.
    pub async fn load(&self) -> usize {
        let mut loaded = match self.store.load().await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(error = %e, "Job store unreadable, starting with no jobs");
                Vec::new()
            }
        };

        let now = Utc::now();
        for job in &mut loaded {
            match CronSpec::parse(&job.cron) {
                Ok(spec) => {
                    // Keep a stored future next_run; recompute when it is
                    // missing. A stored next_run in the past is left alone
                    // so a restart fires missed jobs exactly once.
                    if job.next_run.is_none() {
                        job.next_run = spec.next_after(now);
                    }
                }
                Err(e) => {
                    tracing::warn!(job = %job.name, error = %e, "Disabling job with invalid cron");
                    job.enabled = false;
                    job.next_run = None;
                }
            }
        }

        let count = loaded.len();
        *self.jobs.write().await = loaded;
        tracing::info!(count, "Scheduler loaded jobs");
        count
    }

    /// Add and persist a new job. The cron expression is validated here —
    /// invalid input never reaches the store.
    pub async fn add_job(
        &self,
        name: &str,
        cron_expr: &str,
        command: &str,
        args: Vec<String>,
    ) -> Result<ScheduledJob, SchedulerError> {
        let spec = CronSpec::parse(cron_expr)?;

        let joined = format!("{} {}", command, args.join(" "));
        for pattern in DANGEROUS_ARG_PATTERNS.iter() {
            if joined.contains(pattern) {
                tracing::warn!(job = name, pattern = %pattern, "Scheduled command matches a destructive pattern");
            }
        }

        let next_run = spec.next_from_now();
        if next_run.is_none() {
            return Err(SchedulerError::InvalidCron {
                expr: cron_expr.to_string(),
                message: "expression can never fire".to_string(),
            });
        }

        let job = ScheduledJob {
            id: Uuid::new_v4(),
            name: name.to_string(),
            cron: spec.expr().to_string(),
            command: command.to_string(),
            args,
            enabled: true,
            created_at: Utc::now(),
            last_run: None,
            next_run,
            run_count: 0,
            failure_count: 0,
            last_status: None,
        };

        let mut jobs = self.jobs.write().await;
        jobs.push(job.clone());
        self.persist(&jobs).await?;
        tracing::info!(job = %job.name, cron = %job.cron, next_run = ?job.next_run, "Job added");
        Ok(job)
    }

    /// Remove a job by id.
    pub async fn remove_job(&self, id: Uuid) -> Result<ScheduledJob, SchedulerError> {
        let mut jobs = self.jobs.write().await;
        let idx = jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or(SchedulerError::JobNotFound { id })?;
        let removed = jobs.remove(idx);
        self.persist(&jobs).await?;
        tracing::info!(job = %removed.name, "Job removed");
        Ok(removed)
    }

    /// Enable or disable a job. Enabling recomputes `next_run` from now.
    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<ScheduledJob, SchedulerError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or(SchedulerError::JobNotFound { id })?;

        job.enabled = enabled;
        if enabled {
            let spec = CronSpec::parse(&job.cron)?;
            job.next_run = spec.next_from_now();
        }
        let snapshot = job.clone();
        self.persist(&jobs).await?;
        Ok(snapshot)
    }

    pub async fn list_jobs(&self) -> Vec<ScheduledJob> {
        self.jobs.read().await.clone()
    }

    pub async fn get_job(&self, id: Uuid) -> Option<ScheduledJob> {
        self.jobs.read().await.iter().find(|j| j.id == id).cloned()
    }

    /// One scheduler pass: fire every due job. Dispatch is spawned so the
    /// tick never blocks on a job's duration.
    pub async fn tick(self: &Arc<Self>) {
        let now = Utc::now();
        let due: Vec<ScheduledJob> = {
            let jobs = self.jobs.read().await;
            jobs.iter().filter(|j| j.is_due(now)).cloned().collect()
        };

        for job in due {
            let mut running = self.running.lock().await;
            if running.contains(&job.id) {
                drop(running);
                tracing::warn!(job = %job.name, "Previous invocation still running, skipping tick");
                self.finish_run(job.id, "skipped", false, false).await;
                continue;
            }
            running.insert(job.id);
            drop(running);

            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                scheduler.fire(job).await;
            });
        }
    }

    /// Run one job invocation to completion and record the outcome.
    async fn fire(self: Arc<Self>, job: ScheduledJob) {
        tracing::info!(job = %job.name, command = %job.command, "Scheduled job firing");

        let result = self
            .target
            .dispatch(&job.command, job.args.clone(), None)
            .await;

        let (status, failed) = match &result {
            Ok(exec) => (
                exec.status.to_string(),
                !matches!(exec.status, JobStatus::Succeeded),
            ),
            Err(e) => {
                tracing::warn!(job = %job.name, error = %e, "Scheduled dispatch failed");
                ("error".to_string(), true)
            }
        };

        self.running.lock().await.remove(&job.id);
        self.finish_run(job.id, &status, true, failed).await;
    }

    /// Update a job's bookkeeping after a run (or a skip) and advance
    /// `next_run` past now.
    async fn finish_run(&self, id: Uuid, status: &str, ran: bool, failed: bool) {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.iter_mut().find(|j| j.id == id) else {
            return; // removed while running
        };

        if ran {
            job.last_run = Some(now);
            job.run_count += 1;
            if failed {
                job.failure_count += 1;
            }
        }
        job.last_status = Some(status.to_string());

        match CronSpec::parse(&job.cron) {
            Ok(spec) => job.next_run = spec.next_after(now),
            Err(_) => {
                job.enabled = false;
                job.next_run = None;
            }
        }

        if let Err(e) = self.persist(&jobs).await {
            tracing::error!(error = %e, "Failed to persist job store after run");
        }
    }

    async fn persist(&self, jobs: &[ScheduledJob]) -> Result<(), SchedulerError> {
        self.store.save(jobs).await?;
        Ok(())
    }
}

/// Spawn the periodic tick task. The first tick happens one interval
/// after startup, not immediately.
pub fn spawn_ticker(scheduler: Arc<Scheduler>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            scheduler.tick().await;
        }
    })
}
