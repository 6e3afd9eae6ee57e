//! HTTP API for the command daemon.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::daemon::state::DaemonState;
use crate::error::{ExecutionError, SchedulerError};
use crate::scheduler::Scheduler;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub daemon: Arc<DaemonState>,
    pub scheduler: Arc<Scheduler>,
    /// Signals the serve loop to begin graceful shutdown.
    pub shutdown: tokio::sync::mpsc::Sender<()>,
}

/// Build the Axum router for the daemon API.
pub fn daemon_routes(
    daemon: Arc<DaemonState>,
    scheduler: Arc<Scheduler>,
    shutdown: tokio::sync::mpsc::Sender<()>,
) -> Router {
    let state = AppState {
        daemon,
        scheduler,
        shutdown,
    };

    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/commands", get(commands))
        .route("/execute", post(execute))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/schedule", get(list_schedule).post(add_schedule))
        .route("/schedule/{id}", delete(remove_schedule))
        .route("/schedule/{id}/enable", post(enable_schedule))
        .route("/schedule/{id}/disable", post(disable_schedule))
        .route("/daemon/start", post(daemon_start))
        .route("/daemon/stop", post(daemon_stop))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Read-only ───────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "scripthub",
        "timestamp": chrono::Utc::now(),
    }))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let daemon = state.daemon.status().await;
    let scheduled = state.scheduler.list_jobs().await.len();
    Json(serde_json::json!({
        "daemon": daemon,
        "scheduled_jobs": scheduled,
    }))
}

async fn commands(State(state): State<AppState>) -> impl IntoResponse {
    match state.daemon.sync().store().list().await {
        Ok(records) => {
            let resolvable: Vec<_> = records.into_iter().filter(|r| !r.is_orphaned()).collect();
            Json(serde_json::json!({
                "total": resolvable.len(),
                "commands": resolvable,
            }))
            .into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    50
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let jobs = state.daemon.history(query.limit).await;
    Json(serde_json::json!({
        "total": jobs.len(),
        "jobs": jobs,
    }))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.daemon.job(id).await {
        Some(job) => Json(job).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "job not found"),
    }
}

// ── Execution ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    command_name: String,
    #[serde(default)]
    args: Vec<String>,
    /// Seconds; the daemon default applies when omitted.
    timeout: Option<u64>,
}

async fn execute(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> impl IntoResponse {
    let timeout = req.timeout.map(Duration::from_secs);
    match state.daemon.execute(&req.command_name, req.args, timeout).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => execution_error_response(e),
    }
}

fn execution_error_response(e: ExecutionError) -> axum::response::Response {
    let status = match &e {
        ExecutionError::CommandNotFound { .. } | ExecutionError::OrphanedManifest { .. } => {
            StatusCode::NOT_FOUND
        }
        ExecutionError::Busy { .. } | ExecutionError::QueueFull { .. } => {
            StatusCode::TOO_MANY_REQUESTS
        }
        ExecutionError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        ExecutionError::SpawnFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &e.to_string())
}

// ── Scheduler ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AddScheduleRequest {
    name: String,
    cron: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

async fn list_schedule(State(state): State<AppState>) -> impl IntoResponse {
    let jobs = state.scheduler.list_jobs().await;
    Json(serde_json::json!({
        "total": jobs.len(),
        "jobs": jobs,
    }))
}

async fn add_schedule(
    State(state): State<AppState>,
    Json(req): Json<AddScheduleRequest>,
) -> impl IntoResponse {
    match state
        .scheduler
        .add_job(&req.name, &req.cron, &req.command, req.args)
        .await
    {
        Ok(job) => (StatusCode::CREATED, Json(job)).into_response(),
        Err(e) => scheduler_error_response(e),
    }
}

async fn remove_schedule(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.scheduler.remove_job(id).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => scheduler_error_response(e),
    }
}

async fn enable_schedule(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.scheduler.set_enabled(id, true).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => scheduler_error_response(e),
    }
}

async fn disable_schedule(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.scheduler.set_enabled(id, false).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => scheduler_error_response(e),
    }
}

fn scheduler_error_response(e: SchedulerError) -> axum::response::Response {
    let status = match &e {
        SchedulerError::InvalidCron { .. } => StatusCode::BAD_REQUEST,
        SchedulerError::JobNotFound { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &e.to_string())
}

// ── Lifecycle ───────────────────────────────────────────────────────────

async fn daemon_start(State(state): State<AppState>) -> impl IntoResponse {
    // The listener was bound when the process started; if this handler
    // runs at all, the daemon is already up.
    let _ = &state;
    Json(serde_json::json!({ "status": "already_running" }))
}

async fn daemon_stop(State(state): State<AppState>) -> impl IntoResponse {
    if state.daemon.is_shutting_down() {
        return Json(serde_json::json!({ "status": "already_stopping" }));
    }
    info!("Shutdown requested over HTTP");
    let _ = state.shutdown.send(()).await;
    Json(serde_json::json!({ "status": "stopping" }))
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DaemonConfig, SchedulerConfig};
    use crate::registry::SyncManager;
    use crate::router::ExecuteTarget;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    async fn test_app(root: &std::path::Path, scripts: &[(&str, &str)]) -> Router {
        for (name, body) in scripts {
            tokio::fs::write(root.join(name), body).await.unwrap();
        }
        let sync = Arc::new(SyncManager::new(root.to_path_buf()));
        sync.sync_all().await;

        let config = DaemonConfig {
            data_dir: root.join("data"),
            kill_grace: Duration::from_millis(200),
            ..DaemonConfig::default()
        };
        let daemon = DaemonState::new(config.clone(), sync);
        let scheduler = Scheduler::new(
            SchedulerConfig::from_env(&config.data_dir),
            Arc::clone(&daemon) as Arc<dyn ExecuteTarget>,
        );
        let (shutdown_tx, _shutdown_rx) = tokio::sync::mpsc::channel(1);
        daemon_routes(daemon, scheduler, shutdown_tx)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_request(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    fn post_json(path: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test_app(tmp.path(), &[]).await;

        let response = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["service"], "scripthub");
    }

    #[tokio::test]
    async fn commands_lists_synced_scripts() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test_app(
            tmp.path(),
            &[("greet.sh", "# @description: says hi\necho hi\n")],
        )
        .await;

        let response = app.oneshot(get_request("/commands")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["total"], 1);
        assert_eq!(json["commands"][0]["name"], "greet");
        assert_eq!(json["commands"][0]["description"], "says hi");
    }

    #[tokio::test]
    async fn execute_runs_a_command() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test_app(tmp.path(), &[("greet.sh", "echo hi there\n")]).await;

        let response = app
            .oneshot(post_json(
                "/execute",
                serde_json::json!({ "command_name": "greet" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "succeeded");
        assert_eq!(json["origin"], "daemon");
        assert!(json["stdout"].as_str().unwrap().contains("hi there"));
    }

    #[tokio::test]
    async fn execute_unknown_command_is_404() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test_app(tmp.path(), &[]).await;

        let response = app
            .oneshot(post_json(
                "/execute",
                serde_json::json!({ "command_name": "ghost" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn execute_timeout_yields_timeout_status() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test_app(tmp.path(), &[("sleepy.sh", "sleep 5\n")]).await;

        let response = app
            .oneshot(post_json(
                "/execute",
                serde_json::json!({ "command_name": "sleepy", "timeout": 1 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "timeout");
    }

    #[tokio::test]
    async fn schedule_rejects_invalid_cron() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test_app(tmp.path(), &[]).await;

        let response = app
            .oneshot(post_json(
                "/schedule",
                serde_json::json!({
                    "name": "bad",
                    "cron": "whenever",
                    "command": "greet",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("cron"));
    }

    #[tokio::test]
    async fn schedule_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test_app(tmp.path(), &[("greet.sh", "echo hi\n")]).await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/schedule",
                serde_json::json!({
                    "name": "hourly-greet",
                    "cron": "0 * * * *",
                    "command": "greet",
                    "args": ["--loud"],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        let id = created["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(get_request("/schedule"))
            .await
            .unwrap();
        let listed = body_json(response).await;
        assert_eq!(listed["total"], 1);

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/schedule/{id}/disable"),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        let disabled = body_json(response).await;
        assert_eq!(disabled["enabled"], false);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/schedule/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn jobs_history_endpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test_app(tmp.path(), &[("greet.sh", "echo hi\n")]).await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/execute",
                serde_json::json!({ "command_name": "greet" }),
            ))
            .await
            .unwrap();
        let job = body_json(response).await;
        let id = job["id"].as_str().unwrap().to_string();

        let response = app.clone().oneshot(get_request("/jobs")).await.unwrap();
        let json = body_json(response).await;
        assert_eq!(json["total"], 1);

        let response = app.oneshot(get_request(&format!("/jobs/{id}"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let fetched = body_json(response).await;
        assert_eq!(fetched["command"], "greet");
    }

    #[tokio::test]
    async fn daemon_start_reports_already_running() {
        let tmp = tempfile::tempdir().unwrap();
        let app = test_app(tmp.path(), &[]).await;

        let response = app
            .oneshot(post_json("/daemon/start", serde_json::json!({})))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["status"], "already_running");
    }
}
