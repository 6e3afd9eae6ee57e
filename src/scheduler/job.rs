//! Scheduled job model and its JSON-file store.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::error::ManifestError;

/// One cron-scheduled command invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: Uuid,
    pub name: String,
    /// Validated 5-field cron expression.
    pub cron: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    /// Earliest cron-matching instant after `last_run` (or after load
    /// time, for jobs that have never run). `None` marks an expression
    /// that can never fire; such jobs are disabled.
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub last_status: Option<String>,
}

impl ScheduledJob {
    /// Whether this job should fire at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run.is_some_and(|next| next <= now)
    }
}

/// On-disk shape of the job store.
#[derive(Debug, Default, Serialize, Deserialize)]
struct JobsFile {
    #[serde(default = "JobsFile::default_version")]
    version: String,
    #[serde(default)]
    saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    jobs: Vec<ScheduledJob>,
}

impl JobsFile {
    fn default_version() -> String {
        "1.0".to_string()
    }
}

/// JSON-file persistence for scheduled jobs. Writes are temp-then-rename
/// like the manifest store.
#[derive(Debug, Clone)]
pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Load all persisted jobs. A missing file is an empty store; invalid
    /// JSON is a typed corruption error for the caller to handle.
    pub async fn load(&self) -> Result<Vec<ScheduledJob>, ManifestError> {
        let bytes = match fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ManifestError::Io(e)),
        };
        let file: JobsFile =
            serde_json::from_slice(&bytes).map_err(|e| ManifestError::Corrupt {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
        Ok(file.jobs)
    }

    /// Persist the full job set atomically.
    pub async fn save(&self, jobs: &[ScheduledJob]) -> Result<(), ManifestError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = JobsFile {
            version: JobsFile::default_version(),
            saved_at: Some(Utc::now()),
            jobs: jobs.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&file)?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json).await?;
        if let Err(e) = fs::rename(&tmp, &self.path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(ManifestError::Io(e));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job(name: &str) -> ScheduledJob {
        ScheduledJob {
            id: Uuid::new_v4(),
            name: name.to_string(),
            cron: "*/5 * * * *".to_string(),
            command: "backup".to_string(),
            args: vec!["--fast".to_string()],
            enabled: true,
            created_at: Utc::now(),
            last_run: None,
            next_run: Some(Utc::now()),
            run_count: 0,
            failure_count: 0,
            last_status: None,
        }
    }

    #[tokio::test]
    async fn save_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JobStore::new(tmp.path().join("jobs.json"));

        let jobs = vec![sample_job("nightly"), sample_job("hourly")];
        store.save(&jobs).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].name, "nightly");
        assert_eq!(loaded[0].args, vec!["--fast"]);
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JobStore::new(tmp.path().join("jobs.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_typed_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("jobs.json");
        fs::write(&path, b"][").await.unwrap();

        let err = JobStore::new(path).load().await.unwrap_err();
        assert!(matches!(err, ManifestError::Corrupt { .. }));
    }

    #[test]
    fn due_requires_enabled_and_past_next_run() {
        let now = Utc::now();
        let mut job = sample_job("j");
        job.next_run = Some(now - chrono::Duration::seconds(1));
        assert!(job.is_due(now));

        job.enabled = false;
        assert!(!job.is_due(now));

        job.enabled = true;
        job.next_run = Some(now + chrono::Duration::seconds(60));
        assert!(!job.is_due(now));

        job.next_run = None;
        assert!(!job.is_due(now));
    }
}
