//! Execution router — decides whether a command runs in this process or
//! on the daemon.
//!
//! The daemon's reachability is established by a short health probe whose
//! result is cached for a few seconds, so a burst of invocations costs one
//! probe. When the daemon is down and fallback is enabled, execution
//! proceeds locally through the same registry resolution the daemon would
//! use — identical behavior modulo the process boundary.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::{DaemonConfig, RouterConfig};
use crate::daemon::client::DaemonClient;
use crate::daemon::exec::{self, ExecOrigin, ExecutionJob};
use crate::error::{Error, ExecutionError, RouterError};
use crate::registry::SyncManager;

/// Where an invocation should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Local,
    Daemon,
}

/// Anything that can run a command to completion. Implemented by the
/// router (CLI side) and by the daemon state (in-process side); the
/// scheduler dispatches through this seam.
#[async_trait]
pub trait ExecuteTarget: Send + Sync {
    async fn dispatch(
        &self,
        command: &str,
        args: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<ExecutionJob, Error>;
}

/// Routes invocations between local execution and the daemon HTTP API.
pub struct ExecutionRouter {
    config: RouterConfig,
    daemon_config: DaemonConfig,
    client: DaemonClient,
    sync: Arc<SyncManager>,
    /// Cached probe result: when it was taken and whether the daemon
    /// answered.
    probe_cache: RwLock<Option<(Instant, bool)>>,
}

impl ExecutionRouter {
    pub fn new(config: RouterConfig, daemon_config: DaemonConfig, sync: Arc<SyncManager>) -> Self {
        let client = DaemonClient::new(daemon_config.base_url());
        Self {
            config,
            daemon_config,
            client,
            sync,
            probe_cache: RwLock::new(None),
        }
    }

    pub fn client(&self) -> &DaemonClient {
        &self.client
    }

    /// Decide where the next invocation should run.
    pub async fn decide(&self) -> Result<Route, RouterError> {
        if !self.config.routing_enabled {
            return Ok(Route::Local);
        }

        if self.daemon_reachable().await {
            return Ok(Route::Daemon);
        }

        if self.config.fallback_to_local {
            tracing::debug!("Daemon unreachable, falling back to local execution");
            Ok(Route::Local)
        } else {
            Err(RouterError::DaemonUnavailable {
                url: self.client.base_url().to_string(),
                reason: "health probe failed and fallback_to_local is disabled".to_string(),
            })
        }
    }

    /// Execute a command wherever `decide` points.
    pub async fn execute(
        &self,
        command: &str,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecutionJob, Error> {
        match self.decide().await? {
            Route::Daemon => {
                let job = self.client.execute(command, args, timeout).await?;
                Ok(job)
            }
            Route::Local => self.execute_local(command, args, timeout).await,
        }
    }

    /// Run in the calling process using the same registry resolution the
    /// daemon applies.
    async fn execute_local(
        &self,
        command: &str,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecutionJob, Error> {
        let record = self
            .sync
            .store()
            .resolve(command)
            .await
            .map_err(|e| {
                Error::Execution(ExecutionError::SpawnFailed {
                    name: command.to_string(),
                    reason: format!("manifest store error: {e}"),
                })
            })?
            .ok_or_else(|| {
                Error::Execution(ExecutionError::CommandNotFound {
                    name: command.to_string(),
                })
            })?;

        let timeout = timeout.unwrap_or(self.daemon_config.default_timeout);
        let job = exec::run_script(
            &record,
            args,
            timeout,
            self.daemon_config.kill_grace,
            ExecOrigin::Local,
        )
        .await?;
        Ok(job)
    }

    /// Cached daemon reachability.
    async fn daemon_reachable(&self) -> bool {
        {
            let cache = self.probe_cache.read().await;
            if let Some((taken, reachable)) = *cache
                && taken.elapsed() < self.config.probe_cache_ttl
            {
                return reachable;
            }
        }

        let reachable = self.client.probe(self.config.probe_timeout).await;
        *self.probe_cache.write().await = Some((Instant::now(), reachable));
        tracing::debug!(reachable, "Daemon health probe");
        reachable
    }

    /// Drop the cached probe result (next decide re-probes).
    pub async fn invalidate_probe_cache(&self) {
        *self.probe_cache.write().await = None;
    }
}

#[async_trait]
impl ExecuteTarget for ExecutionRouter {
    async fn dispatch(
        &self,
        command: &str,
        args: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<ExecutionJob, Error> {
        self.execute(command, &args, timeout).await
    }
}
