//! Configuration types.
//!
//! Every component takes its config as a plain struct built either from
//! `Default` or `from_env()`. There are no ambient singletons; `main`
//! constructs one of each and hands them down.

use std::path::PathBuf;
use std::time::Duration;

/// What to do with an execute request once the concurrency limit is hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Fail the request immediately with a busy error.
    Reject,
    /// Queue up to `capacity` waiting requests (FIFO); reject beyond that.
    Queue { capacity: usize },
}

impl BackpressurePolicy {
    fn from_env() -> Self {
        match std::env::var("SCRIPTHUB_BACKPRESSURE").as_deref() {
            Ok("queue") => {
                let capacity = env_parse("SCRIPTHUB_QUEUE_CAPACITY", 32usize);
                BackpressurePolicy::Queue { capacity }
            }
            _ => BackpressurePolicy::Reject,
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Host to bind the HTTP listener on.
    pub host: String,
    /// Port to bind. Startup is fatal if already bound.
    pub port: u16,
    /// Maximum number of concurrently running execution jobs.
    pub max_concurrent: usize,
    /// Default timeout applied when an execute request carries none.
    pub default_timeout: Duration,
    /// Grace period between terminate and kill on timeout/shutdown.
    pub kill_grace: Duration,
    /// Execution-history ring buffer capacity (FIFO eviction).
    pub history_capacity: usize,
    /// Behavior at the concurrency limit.
    pub backpressure: BackpressurePolicy,
    /// Directory for daemon-owned state (scheduler job store, logs).
    pub data_dir: PathBuf,
    /// Root of the user's script tree.
    pub scripts_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7180,
            max_concurrent: 10,
            default_timeout: Duration::from_secs(300), // 5 minutes
            kill_grace: Duration::from_secs(5),
            history_capacity: 1000,
            backpressure: BackpressurePolicy::Reject,
            data_dir: PathBuf::from("./data"),
            scripts_dir: PathBuf::from("./scripts"),
        }
    }
}

impl DaemonConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("SCRIPTHUB_HOST").unwrap_or(defaults.host),
            port: env_parse("SCRIPTHUB_PORT", defaults.port),
            max_concurrent: env_parse("SCRIPTHUB_MAX_CONCURRENT", defaults.max_concurrent),
            default_timeout: Duration::from_secs(env_parse(
                "SCRIPTHUB_EXEC_TIMEOUT_SECS",
                defaults.default_timeout.as_secs(),
            )),
            kill_grace: Duration::from_secs(env_parse(
                "SCRIPTHUB_KILL_GRACE_SECS",
                defaults.kill_grace.as_secs(),
            )),
            history_capacity: env_parse("SCRIPTHUB_HISTORY_CAPACITY", defaults.history_capacity),
            backpressure: BackpressurePolicy::from_env(),
            data_dir: std::env::var("SCRIPTHUB_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            scripts_dir: std::env::var("SCRIPTHUB_SCRIPTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.scripts_dir),
        }
    }

    /// The daemon's HTTP base URL as clients should reach it.
    pub fn base_url(&self) -> String {
        let host = if self.host == "0.0.0.0" {
            "127.0.0.1"
        } else {
            &self.host
        };
        format!("http://{}:{}", host, self.port)
    }
}

/// Execution router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// When false, everything runs locally and the daemon is never probed.
    pub routing_enabled: bool,
    /// When the daemon is unreachable, run in the calling process instead
    /// of failing.
    pub fallback_to_local: bool,
    /// Timeout for the daemon health probe.
    pub probe_timeout: Duration,
    /// How long a probe result stays cached before re-probing.
    pub probe_cache_ttl: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            routing_enabled: true,
            fallback_to_local: true,
            probe_timeout: Duration::from_millis(500),
            probe_cache_ttl: Duration::from_secs(3),
        }
    }
}

impl RouterConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            routing_enabled: env_bool("SCRIPTHUB_ROUTING_ENABLED", defaults.routing_enabled),
            fallback_to_local: env_bool("SCRIPTHUB_FALLBACK_LOCAL", defaults.fallback_to_local),
            probe_timeout: Duration::from_millis(env_parse(
                "SCRIPTHUB_PROBE_TIMEOUT_MS",
                defaults.probe_timeout.as_millis() as u64,
            )),
            probe_cache_ttl: Duration::from_secs(env_parse(
                "SCRIPTHUB_PROBE_TTL_SECS",
                defaults.probe_cache_ttl.as_secs(),
            )),
        }
    }
}

/// File watcher configuration.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Whether the daemon starts the watcher at all.
    pub enabled: bool,
    /// Quiet period before a burst of events collapses into one sync.
    pub debounce: Duration,
    /// Bounded event channel capacity; events beyond this are dropped
    /// with a warning.
    pub channel_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce: Duration::from_millis(400),
            channel_capacity: 256,
        }
    }
}

impl WatchConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_bool("SCRIPTHUB_WATCH_ENABLED", defaults.enabled),
            debounce: Duration::from_millis(env_parse(
                "SCRIPTHUB_DEBOUNCE_MS",
                defaults.debounce.as_millis() as u64,
            )),
            channel_capacity: defaults.channel_capacity,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tick period for the due-job check.
    pub tick_interval: Duration,
    /// Path of the persisted job store.
    pub store_path: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            store_path: PathBuf::from("./data/jobs.json"),
        }
    }
}

impl SchedulerConfig {
    /// Derive scheduler config from the daemon's data dir.
    pub fn from_env(data_dir: &std::path::Path) -> Self {
        let defaults = Self::default();
        Self {
            tick_interval: Duration::from_secs(env_parse(
                "SCRIPTHUB_TICK_INTERVAL_SECS",
                defaults.tick_interval.as_secs(),
            )),
            store_path: data_dir.join("jobs.json"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key).as_deref() {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}
