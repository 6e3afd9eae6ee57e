//! HTTP client for a running command daemon.
//!
//! Used by the execution router's health probe and by CLI-side calls.
//! Read-only requests retry with a short delay; `execute` never retries
//! (it is not idempotent).

use std::time::Duration;

use serde_json::Value;

use crate::daemon::exec::ExecutionJob;
use crate::error::RouterError;
use crate::registry::ManifestRecord;

/// Client for the daemon's HTTP API.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    base_url: String,
    http: reqwest::Client,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl DaemonClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into(),
            http,
            retry_attempts: 3,
            retry_delay: Duration::from_millis(500),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Quick liveness probe with an explicit timeout. Never retries —
    /// the router caches the result instead.
    pub async fn probe(&self, timeout: Duration) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.http.get(&url).timeout(timeout).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    pub async fn health(&self) -> Result<Value, RouterError> {
        self.get_json("/health").await
    }

    pub async fn status(&self) -> Result<Value, RouterError> {
        self.get_json("/status").await
    }

    /// List resolvable commands from the daemon's manifest view.
    pub async fn commands(&self) -> Result<Vec<ManifestRecord>, RouterError> {
        let value = self.get_json("/commands").await?;
        serde_json::from_value(value.get("commands").cloned().unwrap_or(Value::Null))
            .map_err(|e| RouterError::Request(format!("bad /commands payload: {e}")))
    }

    /// Execute a command on the daemon and wait for its terminal record.
    pub async fn execute(
        &self,
        command: &str,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecutionJob, RouterError> {
        let url = format!("{}/execute", self.base_url);
        let mut body = serde_json::json!({
            "command_name": command,
            "args": args,
        });
        if let Some(t) = timeout {
            body["timeout"] = Value::from(t.as_secs());
        }

        // The request itself must outlive the job's own timeout.
        let http_timeout = timeout
            .map(|t| t + Duration::from_secs(30))
            .unwrap_or(Duration::from_secs(600));

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .timeout(http_timeout)
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;

        if resp.status().is_success() {
            resp.json::<ExecutionJob>()
                .await
                .map_err(|e| RouterError::Request(format!("bad /execute payload: {e}")))
        } else {
            let status = resp.status();
            let detail = resp
                .json::<Value>()
                .await
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
                .unwrap_or_else(|| status.to_string());
            Err(RouterError::Request(format!("{status}: {detail}")))
        }
    }

    pub async fn stop(&self) -> Result<Value, RouterError> {
        let url = format!("{}/daemon/stop", self.base_url);
        let resp = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;
        resp.json()
            .await
            .map_err(|e| RouterError::Request(e.to_string()))
    }

    /// Poll until the daemon answers its health check or `timeout` passes.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if self.probe(Duration::from_millis(500)).await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        false
    }

    async fn get_json(&self, path: &str) -> Result<Value, RouterError> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_err = None;

        for attempt in 0..self.retry_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json()
                        .await
                        .map_err(|e| RouterError::Request(e.to_string()));
                }
                Ok(resp) => {
                    last_err = Some(RouterError::Request(resp.status().to_string()));
                }
                Err(e) => {
                    tracing::debug!(url = %url, attempt, error = %e, "Daemon request failed");
                    last_err = Some(self.unavailable(e));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| RouterError::Request("no attempts made".to_string())))
    }

    fn unavailable(&self, e: reqwest::Error) -> RouterError {
        RouterError::DaemonUnavailable {
            url: self.base_url.clone(),
            reason: e.to_string(),
        }
    }
}
