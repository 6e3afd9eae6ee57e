//! Integration tests for the daemon HTTP API.
//!
//! Each test spins up an Axum server on a random port and exercises the
//! real HTTP contract through the daemon client and the execution router.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use scripthub::config::{DaemonConfig, RouterConfig, SchedulerConfig};
use scripthub::daemon::routes::daemon_routes;
use scripthub::daemon::{DaemonClient, DaemonState, ExecOrigin, JobStatus};
use scripthub::registry::SyncManager;
use scripthub::router::{ExecuteTarget, ExecutionRouter, Route};
use scripthub::scheduler::Scheduler;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(20);

struct TestDaemon {
    port: u16,
    daemon: Arc<DaemonState>,
    serve_task: JoinHandle<()>,
}

/// Start a daemon over a temp script tree; returns once the listener is
/// bound.
async fn start_daemon(root: &Path, scripts: &[(&str, &str)]) -> TestDaemon {
    for (name, body) in scripts {
        tokio::fs::write(root.join(name), body).await.unwrap();
    }

    let sync = Arc::new(SyncManager::new(root.to_path_buf()));
    sync.sync_all().await;

    let config = DaemonConfig {
        data_dir: root.join("data"),
        scripts_dir: root.to_path_buf(),
        kill_grace: Duration::from_millis(300),
        ..DaemonConfig::default()
    };
    let daemon = DaemonState::new(config.clone(), sync);
    let scheduler = Scheduler::new(
        SchedulerConfig::from_env(&config.data_dir),
        Arc::clone(&daemon) as Arc<dyn ExecuteTarget>,
    );

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let app = daemon_routes(Arc::clone(&daemon), scheduler, shutdown_tx);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let serve_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
            .unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestDaemon {
        port,
        daemon,
        serve_task,
    }
}

fn client_for(port: u16) -> DaemonClient {
    DaemonClient::new(format!("http://127.0.0.1:{port}"))
}

fn router_for(port: u16, root: &Path, fallback: bool) -> ExecutionRouter {
    let sync = Arc::new(SyncManager::new(root.to_path_buf()));
    let daemon_config = DaemonConfig {
        port,
        scripts_dir: root.to_path_buf(),
        ..DaemonConfig::default()
    };
    ExecutionRouter::new(
        RouterConfig {
            routing_enabled: true,
            fallback_to_local: fallback,
            probe_timeout: Duration::from_millis(500),
            probe_cache_ttl: Duration::from_secs(2),
        },
        daemon_config,
        sync,
    )
}

#[tokio::test]
async fn health_and_status_respond() {
    timeout(TEST_TIMEOUT, async {
        let tmp = tempfile::tempdir().unwrap();
        let td = start_daemon(tmp.path(), &[]).await;
        let client = client_for(td.port);

        let health = client.health().await.unwrap();
        assert_eq!(health["status"], "ok");

        let status = client.status().await.unwrap();
        assert_eq!(status["daemon"]["active_jobs"], 0);
        assert_eq!(status["scheduled_jobs"], 0);

        td.serve_task.abort();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn commands_reflect_synced_scripts() {
    timeout(TEST_TIMEOUT, async {
        let tmp = tempfile::tempdir().unwrap();
        let td = start_daemon(
            tmp.path(),
            &[
                ("greet.sh", "# @description: says hi\necho hi\n"),
                ("train.py", "# @tags: ml, nightly\nprint('train')\n"),
            ],
        )
        .await;
        let client = client_for(td.port);

        let commands = client.commands().await.unwrap();
        let names: Vec<_> = commands.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["greet", "train"]);

        td.serve_task.abort();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn execute_roundtrip_over_http() {
    timeout(TEST_TIMEOUT, async {
        let tmp = tempfile::tempdir().unwrap();
        let td = start_daemon(tmp.path(), &[("greet.sh", "echo hello \"$1\"\n")]).await;
        let client = client_for(td.port);

        let job = client
            .execute("greet", &["world".to_string()], None)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.origin, ExecOrigin::Daemon);
        assert!(job.stdout.contains("hello world"));
        assert_eq!(job.exit_code, Some(0));

        // The run shows up in execution history.
        let history = td.daemon.history(10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].command, "greet");

        td.serve_task.abort();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn execute_timeout_stops_the_process() {
    timeout(TEST_TIMEOUT, async {
        let tmp = tempfile::tempdir().unwrap();
        let td = start_daemon(tmp.path(), &[("sleepy.sh", "sleep 10\n")]).await;
        let client = client_for(td.port);

        let clock = std::time::Instant::now();
        let job = client
            .execute("sleepy", &[], Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Timeout);
        assert!(clock.elapsed() < Duration::from_secs(5));

        td.serve_task.abort();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn execute_unknown_command_surfaces_404() {
    timeout(TEST_TIMEOUT, async {
        let tmp = tempfile::tempdir().unwrap();
        let td = start_daemon(tmp.path(), &[]).await;
        let client = client_for(td.port);

        let err = client.execute("ghost", &[], None).await.unwrap_err();
        assert!(err.to_string().contains("404"), "got: {err}");

        td.serve_task.abort();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn router_prefers_live_daemon() {
    timeout(TEST_TIMEOUT, async {
        let tmp = tempfile::tempdir().unwrap();
        let td = start_daemon(tmp.path(), &[("greet.sh", "echo routed\n")]).await;
        let router = router_for(td.port, tmp.path(), true);

        assert_eq!(router.decide().await.unwrap(), Route::Daemon);

        let job = router.execute("greet", &[], None).await.unwrap();
        assert_eq!(job.origin, ExecOrigin::Daemon);
        assert!(job.stdout.contains("routed"));

        td.serve_task.abort();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn router_falls_back_to_local_when_daemon_dies() {
    timeout(TEST_TIMEOUT, async {
        let tmp = tempfile::tempdir().unwrap();
        let td = start_daemon(tmp.path(), &[("greet.sh", "echo local run\n")]).await;
        let router = router_for(td.port, tmp.path(), true);

        assert_eq!(router.decide().await.unwrap(), Route::Daemon);

        td.serve_task.abort();
        tokio::time::sleep(Duration::from_millis(100)).await;
        router.invalidate_probe_cache().await;

        // Same registry, same command — now in the calling process.
        let job = router.execute("greet", &[], None).await.unwrap();
        assert_eq!(job.origin, ExecOrigin::Local);
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.stdout.contains("local run"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn stop_endpoint_shuts_the_server_down() {
    timeout(TEST_TIMEOUT, async {
        let tmp = tempfile::tempdir().unwrap();
        let td = start_daemon(tmp.path(), &[]).await;
        let client = client_for(td.port);

        let reply = client.stop().await.unwrap();
        assert_eq!(reply["status"], "stopping");

        // Graceful shutdown lets the serve task finish on its own.
        timeout(Duration::from_secs(5), td.serve_task)
            .await
            .expect("server did not stop")
            .unwrap();

        assert!(!client.probe(Duration::from_millis(300)).await);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn scheduled_jobs_survive_a_daemon_restart() {
    timeout(TEST_TIMEOUT, async {
        let tmp = tempfile::tempdir().unwrap();
        let store_path = tmp.path().join("data/jobs.json");

        {
            let td = start_daemon(tmp.path(), &[("tick.sh", "echo ticked\n")]).await;
            let scheduler = Scheduler::new(
                SchedulerConfig {
                    tick_interval: Duration::from_secs(60),
                    store_path: store_path.clone(),
                },
                Arc::clone(&td.daemon) as Arc<dyn ExecuteTarget>,
            );
            scheduler
                .add_job("often", "*/5 * * * *", "tick", vec![])
                .await
                .unwrap();
            td.serve_task.abort();
        }

        // A fresh daemon + scheduler over the same store sees the job.
        let td = start_daemon(tmp.path(), &[]).await;
        let scheduler = Scheduler::new(
            SchedulerConfig {
                tick_interval: Duration::from_secs(60),
                store_path,
            },
            Arc::clone(&td.daemon) as Arc<dyn ExecuteTarget>,
        );
        assert_eq!(scheduler.load().await, 1);
        let jobs = scheduler.list_jobs().await;
        assert_eq!(jobs[0].name, "often");
        assert_eq!(jobs[0].command, "tick");
        assert!(jobs[0].next_run.is_some());

        td.serve_task.abort();
    })
    .await
    .expect("test timed out");
}
