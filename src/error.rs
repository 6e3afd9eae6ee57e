//! Error types for scripthub.

use std::path::PathBuf;

use uuid::Uuid;

/// Top-level error type for the orchestration core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Watcher error: {0}")]
    Watch(#[from] WatchError),
}

/// File-watcher errors.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("Failed to install filesystem watcher: {0}")]
    Init(String),

    #[error("Failed to watch {path}: {reason}")]
    Subscribe { path: PathBuf, reason: String },
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-script sync failures. These are logged and skipped during batch
/// syncs; they never abort `sync_all`.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Cannot read script {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unrecognized script type: {path}")]
    UnrecognizedLanguage { path: PathBuf },

    #[error("Script has no usable file name: {path}")]
    InvalidName { path: PathBuf },

    #[error("Manifest error for {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: ManifestError,
    },
}

/// Manifest store errors.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// Invalid JSON on disk. Treated as stale by the sync path (forces a
    /// re-sync) rather than crashing consumers.
    #[error("Corrupt manifest {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Routing errors.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Daemon could not be reached and fallback-to-local is disabled.
    #[error("Daemon unreachable at {url}: {reason}")]
    DaemonUnavailable { url: String, reason: String },

    #[error("Daemon request failed: {0}")]
    Request(String),
}

/// Command execution errors.
///
/// Non-zero exits and timeouts are *results*, not errors — they come back
/// as terminal `ExecutionJob` states. These variants cover failures that
/// prevent a job from running at all.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Command not found: {name}")]
    CommandNotFound { name: String },

    #[error("Command {name} resolves to a missing script: {path}")]
    OrphanedManifest { name: String, path: PathBuf },

    #[error("Failed to spawn {name}: {reason}")]
    SpawnFailed { name: String, reason: String },

    #[error("Concurrency limit reached ({limit} active), request rejected")]
    Busy { limit: usize },

    #[error("Execution queue full ({capacity} waiting), request rejected")]
    QueueFull { capacity: usize },

    #[error("Daemon is shutting down")]
    ShuttingDown,
}

/// Scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Invalid cron expression '{expr}': {message}")]
    InvalidCron { expr: String, message: String },

    #[error("Scheduled job {id} not found")]
    JobNotFound { id: Uuid },

    #[error("Job store error: {0}")]
    Store(#[from] ManifestError),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
