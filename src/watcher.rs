//! File watcher — debounced filesystem events driving single-file syncs.
//!
//! OS events flow through a bounded channel into one debounce task.
//! Each create/modify arms (or re-arms) a per-path timer; when a path
//! stays quiet for the debounce window it gets exactly one `sync_one`.
//! Deletes bypass the timer and remove the manifest immediately.
//!
//! Per-path state machine: `Idle → PendingSync (timer armed) → Syncing →
//! Idle`; a new event while pending restarts the timer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::WatchConfig;
use crate::error::WatchError;
use crate::registry::manifest::MANIFEST_DIR;
use crate::registry::{ScriptLanguage, SyncManager};

/// Kind of filesystem change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Created,
    Modified,
    Removed,
}

/// One filesystem event, as consumed by the debounce task.
#[derive(Debug, Clone)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
    pub timestamp: DateTime<Utc>,
}

/// What the debouncer drives. Implemented by `SyncManager`; tests swap in
/// a counting mock.
#[async_trait]
pub trait SyncSink: Send + Sync {
    async fn sync_path(&self, path: &Path);
    async fn remove_path(&self, path: &Path);
}

#[async_trait]
impl SyncSink for SyncManager {
    async fn sync_path(&self, path: &Path) {
        if let Err(e) = self.sync_one(path).await {
            tracing::warn!(path = %path.display(), error = %e, "Watcher-triggered sync failed");
        }
    }

    async fn remove_path(&self, path: &Path) {
        if let Err(e) = self.remove_for_path(path).await {
            tracing::warn!(path = %path.display(), error = %e, "Watcher-triggered removal failed");
        }
    }
}

/// Running watcher. Dropping (or `stop`ping) releases the OS watch
/// handles and shuts the debounce task down.
pub struct FileWatcher {
    /// Held for its side effect: dropping unsubscribes from the OS.
    watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl FileWatcher {
    /// Watch the sync manager's root recursively.
    pub fn start(config: &WatchConfig, sync: Arc<SyncManager>) -> Result<Self, WatchError> {
        let root = sync.root().to_path_buf();
        let (tx, rx) = mpsc::channel::<FileEvent>(config.channel_capacity);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "Filesystem watch error");
                    return;
                }
            };
            for file_event in convert(event) {
                if let Err(e) = tx.try_send(file_event) {
                    tracing::warn!(error = %e, "Watch event dropped (channel full or closed)");
                }
            }
        })
        .map_err(|e| WatchError::Init(e.to_string()))?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| WatchError::Subscribe {
                path: root.clone(),
                reason: e.to_string(),
            })?;

        let task = spawn_debouncer(rx, sync, config.debounce);
        tracing::info!(root = %root.display(), debounce_ms = config.debounce.as_millis() as u64,
            "File watcher started");

        Ok(Self { watcher, task })
    }

    /// Stop watching: release OS handles, let the debouncer drain, then
    /// shut it down. Pending timers are cancelled and logged, not
    /// silently lost.
    pub async fn stop(self) {
        let Self { watcher, task } = self;
        // Dropping the OS watcher closes the event channel, which ends
        // the debounce loop after it logs any pending syncs it drops.
        drop(watcher);
        if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
            tracing::warn!("Debounce task did not exit in time");
        }
        tracing::info!("File watcher stopped");
    }
}

/// Map a notify event to zero or more script-relevant `FileEvent`s.
/// Manifest-store and hidden paths are filtered out here so manifest
/// writes can never feed back into the watcher.
fn convert(event: Event) -> Vec<FileEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => FileEventKind::Created,
        EventKind::Modify(_) => FileEventKind::Modified,
        EventKind::Remove(_) => FileEventKind::Removed,
        _ => return Vec::new(),
    };

    event
        .paths
        .into_iter()
        .filter(|p| is_watchable_script(p))
        .map(|path| FileEvent {
            path,
            kind,
            timestamp: Utc::now(),
        })
        .collect()
}

fn is_watchable_script(path: &Path) -> bool {
    let hidden = path.components().any(|c| {
        let name = c.as_os_str().to_string_lossy();
        name == MANIFEST_DIR || (name.starts_with('.') && name.len() > 1 && name != "..")
    });
    if hidden {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| ScriptLanguage::recognized_extensions().contains(&ext))
}

/// Spawn the debounce-and-sync task. Exits when the event channel closes.
pub fn spawn_debouncer(
    rx: mpsc::Receiver<FileEvent>,
    sink: Arc<dyn SyncSink>,
    window: Duration,
) -> JoinHandle<()> {
    tokio::spawn(debounce_loop(rx, sink, window))
}

async fn debounce_loop(
    mut rx: mpsc::Receiver<FileEvent>,
    sink: Arc<dyn SyncSink>,
    window: Duration,
) {
    // Paths in PendingSync, keyed to their timer deadline.
    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();

    loop {
        let deadline = pending
            .values()
            .min()
            .copied()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(ev) => match ev.kind {
                        FileEventKind::Removed => {
                            // Deletes skip the debounce entirely.
                            pending.remove(&ev.path);
                            sink.remove_path(&ev.path).await;
                        }
                        FileEventKind::Created | FileEventKind::Modified => {
                            pending.insert(ev.path, Instant::now() + window);
                        }
                    },
                    None => break,
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                let now = Instant::now();
                let due: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, at)| **at <= now)
                    .map(|(p, _)| p.clone())
                    .collect();
                for path in due {
                    pending.remove(&path);
                    tracing::debug!(path = %path.display(), "Debounce window elapsed, syncing");
                    sink.sync_path(&path).await;
                }
            }
        }
    }

    // Shutdown: anything still pending is dropped explicitly.
    for path in pending.keys() {
        tracing::warn!(path = %path.display(), "Watcher stopped; pending sync dropped");
    }
}
