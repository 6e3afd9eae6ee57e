//! Sync manager — scans script directories and keeps the manifest store
//! in step with what is on disk.
//!
//! Hash-based invalidation: a script is only re-synced when its SHA-256
//! content hash differs from the stored manifest's. Concurrent syncs of
//! the same path are serialized through a per-path lock; different paths
//! proceed in parallel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::{ManifestError, SyncError};
use crate::registry::language::ScriptLanguage;
use crate::registry::manifest::{MANIFEST_DIR, ManifestRecord, ManifestStore};
use crate::registry::metadata::ScriptMetadata;

/// Outcome of syncing a single script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Manifest was (re)written.
    Synced,
    /// Content hash matched; no write performed.
    Unchanged,
}

/// Tally returned by `sync_all`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SyncReport {
    pub synced: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// Read-only registry health counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SyncStatus {
    /// Manifests whose source exists and hash matches.
    pub in_sync: usize,
    /// Manifests whose source exists but content has drifted.
    pub stale: usize,
    /// Manifests whose source no longer exists.
    pub orphaned: usize,
    /// Scripts on disk with no manifest yet.
    pub untracked: usize,
}

/// Scans a script tree and maintains its manifest store.
pub struct SyncManager {
    root: PathBuf,
    store: ManifestStore,
    /// Per-path write locks; single-writer-per-path discipline.
    path_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl SyncManager {
    pub fn new(root: PathBuf) -> Self {
        let store = ManifestStore::for_root(&root);
        Self {
            root,
            store,
            path_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    /// Walk the tree for recognized script files. Hidden directories
    /// (including the manifest store) are skipped.
    pub fn discover(&self) -> Vec<PathBuf> {
        let mut scripts = Vec::new();
        let mut stack = vec![self.root.clone()];

        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "Cannot read directory, skipping");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let name = entry.file_name();
                let name = name.to_string_lossy();
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };
                if file_type.is_dir() {
                    if !name.starts_with('.') && name.as_ref() != MANIFEST_DIR {
                        stack.push(path);
                    }
                } else if file_type.is_file()
                    && let Some(ext) = path.extension().and_then(|e| e.to_str())
                    && ScriptLanguage::recognized_extensions().contains(&ext)
                {
                    scripts.push(path);
                }
            }
        }

        scripts.sort();
        scripts
    }

    /// Sync every recognized script under the root. Per-file failures are
    /// logged and counted; they never abort the batch. Files are hashed
    /// a few at a time; the per-path locks keep writers exclusive.
    pub async fn sync_all(&self) -> SyncReport {
        const MAX_PARALLEL_SYNCS: usize = 8;

        let scripts = self.discover();
        let results: Vec<_> = stream::iter(scripts)
            .map(|path| async move {
                let outcome = self.sync_one(&path).await;
                (path, outcome)
            })
            .buffer_unordered(MAX_PARALLEL_SYNCS)
            .collect()
            .await;

        let mut report = SyncReport::default();
        for (path, outcome) in results {
            match outcome {
                Ok(SyncOutcome::Synced) => report.synced += 1,
                Ok(SyncOutcome::Unchanged) => report.unchanged += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Sync failed, skipping");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            synced = report.synced,
            unchanged = report.unchanged,
            failed = report.failed,
            "Sync pass complete"
        );
        report
    }

    /// Sync a single script file. No write happens when the stored hash
    /// already matches the file content.
    pub async fn sync_one(&self, path: &Path) -> Result<SyncOutcome, SyncError> {
        let path = self.absolute(path);
        let _guard = self.lock_for(&path).await;

        let content = fs::read(&path).await.map_err(|e| SyncError::Unreadable {
            path: path.clone(),
            source: e,
        })?;

        let name = command_name(&path).ok_or_else(|| SyncError::InvalidName { path: path.clone() })?;

        let text = String::from_utf8_lossy(&content);
        let first_line = text.lines().next().unwrap_or("");
        let language = ScriptLanguage::detect(&path, first_line);
        if !language.is_recognized() {
            return Err(SyncError::UnrecognizedLanguage { path });
        }

        let hash = content_hash(&content);

        match self.store.load(&name).await {
            Ok(Some(existing))
                if existing.source_hash == hash && existing.source_path == path =>
            {
                tracing::debug!(command = %name, "Hash unchanged, skipping write");
                return Ok(SyncOutcome::Unchanged);
            }
            Ok(_) => {}
            Err(ManifestError::Corrupt { path: mpath, message }) => {
                tracing::warn!(path = %mpath.display(), %message, "Corrupt manifest treated as stale");
            }
            Err(e) => {
                return Err(SyncError::Manifest {
                    path,
                    source: e,
                });
            }
        }

        let metadata = ScriptMetadata::extract(&text);
        let group = metadata
            .group
            .clone()
            .or_else(|| parent_group(&path))
            .unwrap_or_else(|| "workflows".to_string());

        let record = ManifestRecord {
            name: name.clone(),
            group,
            source_path: path.clone(),
            source_hash: hash,
            language,
            metadata,
            synced_at: Utc::now(),
        };

        self.store
            .write(&record)
            .await
            .map_err(|e| SyncError::Manifest {
                path: path.clone(),
                source: e,
            })?;

        tracing::info!(command = %name, path = %path.display(), "Manifest synced");
        Ok(SyncOutcome::Synced)
    }

    /// Remove the manifest belonging to a (deleted) script path. Used by
    /// the watcher's delete handling; bypasses hashing entirely.
    pub async fn remove_for_path(&self, path: &Path) -> Result<bool, ManifestError> {
        let path = self.absolute(path);
        let Some(name) = command_name(&path) else {
            return Ok(false);
        };
        let _guard = self.lock_for(&path).await;
        let removed = self.store.remove(&name).await?;
        if removed {
            tracing::info!(command = %name, "Manifest removed for deleted script");
        }
        Ok(removed)
    }

    /// Delete every manifest whose source script no longer exists.
    /// Returns the number of records removed.
    pub async fn cleanup(&self) -> Result<usize, ManifestError> {
        let records = self.store.list().await?;
        let mut removed = 0;

        for record in records {
            if record.is_orphaned() {
                if self.store.remove(&record.name).await? {
                    tracing::info!(command = %record.name, path = %record.source_path.display(),
                        "Removed orphaned manifest");
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }

    /// Report registry health without mutating anything.
    pub async fn status(&self) -> Result<SyncStatus, ManifestError> {
        let records = self.store.list().await?;
        let mut status = SyncStatus::default();
        let mut tracked: Vec<PathBuf> = Vec::with_capacity(records.len());

        for record in records {
            if record.is_orphaned() {
                status.orphaned += 1;
                continue;
            }
            tracked.push(record.source_path.clone());
            match fs::read(&record.source_path).await {
                Ok(content) if content_hash(&content) == record.source_hash => {
                    status.in_sync += 1;
                }
                Ok(_) => status.stale += 1,
                Err(_) => status.stale += 1,
            }
        }

        for script in self.discover() {
            if !tracked.contains(&script) {
                status.untracked += 1;
            }
        }

        Ok(status)
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    async fn lock_for(&self, path: &Path) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.path_locks.lock().await;
            Arc::clone(
                locks
                    .entry(path.to_path_buf())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }
}

/// Command name: the script's file stem.
fn command_name(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Group: the parent directory's name.
fn parent_group(path: &Path) -> Option<String> {
    path.parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .map(|s| s.to_string())
}

/// `sha256:<hex>` over raw file bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}
