//! Manifest store — the durable JSON projection of synced scripts.
//!
//! One `<command>.json` file per script, kept in a `.manifests/` directory
//! next to the scripts it describes. Writes are temp-then-rename so a
//! concurrent reader never observes a partial file.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::error::ManifestError;
use crate::registry::language::ScriptLanguage;
use crate::registry::metadata::ScriptMetadata;

/// Directory name for the manifest store, colocated with the scripts.
pub const MANIFEST_DIR: &str = ".manifests";

/// Durable record for one resolvable command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRecord {
    /// Command name, derived from the script's file stem.
    pub name: String,
    /// Command group, from `@group:` or the parent directory name.
    pub group: String,
    /// Absolute path of the source script.
    pub source_path: PathBuf,
    /// `sha256:<hex>` content hash of the source at last sync.
    pub source_hash: String,
    pub language: ScriptLanguage,
    #[serde(flatten)]
    pub metadata: ScriptMetadata,
    /// When this record was last written.
    pub synced_at: DateTime<Utc>,
}

impl ManifestRecord {
    /// A record whose source no longer exists is an orphan; it must not
    /// resolve for execution.
    pub fn is_orphaned(&self) -> bool {
        !self.source_path.exists()
    }
}

/// File-backed manifest store.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    /// Create a store rooted at `<scripts_root>/.manifests`.
    pub fn for_root(scripts_root: &Path) -> Self {
        Self {
            dir: scripts_root.join(MANIFEST_DIR),
        }
    }

    /// The store's directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Load one record by command name. `Ok(None)` when absent;
    /// `ManifestError::Corrupt` when the file exists but is not valid
    /// JSON — callers treat that as stale and re-sync.
    pub async fn load(&self, name: &str) -> Result<Option<ManifestRecord>, ManifestError> {
        let path = self.record_path(name);
        let bytes = match fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ManifestError::Io(e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ManifestError::Corrupt {
                path,
                message: e.to_string(),
            })
    }

    /// Write a record atomically: serialize to a temp file in the same
    /// directory, then rename over the target.
    pub async fn write(&self, record: &ManifestRecord) -> Result<(), ManifestError> {
        fs::create_dir_all(&self.dir).await?;

        let target = self.record_path(&record.name);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", record.name, Uuid::new_v4().simple()));

        let json = serde_json::to_vec_pretty(record)?;
        fs::write(&tmp, &json).await?;
        if let Err(e) = fs::rename(&tmp, &target).await {
            // Best effort: don't leave the temp file behind on failure.
            let _ = fs::remove_file(&tmp).await;
            return Err(ManifestError::Io(e));
        }
        Ok(())
    }

    /// Remove one record. Returns whether a file was deleted.
    pub async fn remove(&self, name: &str) -> Result<bool, ManifestError> {
        match fs::remove_file(self.record_path(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ManifestError::Io(e)),
        }
    }

    /// Load every parseable record in the store. Corrupt files are
    /// skipped with a warning — they will be repaired by the next sync.
    pub async fn list(&self) -> Result<Vec<ManifestRecord>, ManifestError> {
        let mut records = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(ManifestError::Io(e)),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<ManifestRecord>(&bytes) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping corrupt manifest");
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable manifest");
                }
            }
        }

        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Resolve a command name to a non-orphaned record.
    pub async fn resolve(&self, name: &str) -> Result<Option<ManifestRecord>, ManifestError> {
        match self.load(name).await {
            Ok(Some(record)) if record.is_orphaned() => {
                tracing::warn!(command = %name, path = %record.source_path.display(),
                    "Manifest is orphaned; refusing to resolve");
                Ok(None)
            }
            Ok(other) => Ok(other),
            Err(ManifestError::Corrupt { path, message }) => {
                tracing::warn!(path = %path.display(), %message, "Corrupt manifest treated as unresolvable");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
