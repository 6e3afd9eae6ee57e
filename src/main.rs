use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use scripthub::config::{DaemonConfig, RouterConfig, SchedulerConfig, WatchConfig};
use scripthub::daemon::client::DaemonClient;
use scripthub::daemon::routes::daemon_routes;
use scripthub::daemon::state::DaemonState;
use scripthub::daemon::{ExecOrigin, JobStatus};
use scripthub::error::{Error, ExecutionError, SyncError};
use scripthub::registry::SyncManager;
use scripthub::router::{ExecuteTarget, ExecutionRouter};
use scripthub::scheduler::{Scheduler, spawn_ticker};
use scripthub::watcher::FileWatcher;

/// Exit codes at the CLI boundary: 0 success, 1 sync/execution failure,
/// 2 command or manifest not found.
const EXIT_FAILURE: u8 = 1;
const EXIT_NOT_FOUND: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    match args.as_slice() {
        [] | ["serve"] => match serve().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {e:#}");
                ExitCode::from(EXIT_FAILURE)
            }
        },
        ["sync", rest @ ..] => sync_command(rest).await,
        ["run", command, cmd_args @ ..] => run_command(command, cmd_args).await,
        ["daemon", "status"] => daemon_status().await,
        ["daemon", "stop"] => daemon_stop().await,
        _ => {
            print_usage();
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn print_usage() {
    eprintln!("scripthub v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  scripthub [serve]             start the command daemon");
    eprintln!("  scripthub sync all            sync every script to the manifest store");
    eprintln!("  scripthub sync one <path>     sync a single script");
    eprintln!("  scripthub sync status         report in-sync / stale / orphaned counts");
    eprintln!("  scripthub sync cleanup        remove manifests for deleted scripts");
    eprintln!("  scripthub sync watch          watch the script tree and sync on change");
    eprintln!("  scripthub run <cmd> [args..]  execute a command (daemon or local)");
    eprintln!("  scripthub daemon status       query a running daemon");
    eprintln!("  scripthub daemon stop         stop a running daemon");
}

fn init_cli_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();
}

// ── Daemon process ──────────────────────────────────────────────────────

async fn serve() -> anyhow::Result<()> {
    let config = DaemonConfig::from_env();

    // Stdout plus a daily-rolling file under the data dir. The guard must
    // outlive the process so buffered lines get flushed.
    let file_appender =
        tracing_appender::rolling::daily(config.data_dir.join("logs"), "scripthub.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    let watch_config = WatchConfig::from_env();
    let scheduler_config = SchedulerConfig::from_env(&config.data_dir);

    eprintln!("scripthub v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Scripts: {}", config.scripts_dir.display());
    eprintln!("   API: http://{}:{}", config.host, config.port);
    eprintln!(
        "   Concurrency: {} ({})",
        config.max_concurrent,
        match config.backpressure {
            scripthub::config::BackpressurePolicy::Reject => "reject when busy".to_string(),
            scripthub::config::BackpressurePolicy::Queue { capacity } =>
                format!("queue up to {capacity}"),
        }
    );

    tokio::fs::create_dir_all(&config.scripts_dir)
        .await
        .with_context(|| format!("creating scripts dir {}", config.scripts_dir.display()))?;

    // Initial full sync so the API starts with a complete manifest view.
    let sync = Arc::new(SyncManager::new(config.scripts_dir.clone()));
    let report = sync.sync_all().await;
    eprintln!(
        "   Synced: {} ({} unchanged, {} failed)",
        report.synced, report.unchanged, report.failed
    );

    let daemon = DaemonState::new(config.clone(), Arc::clone(&sync));

    // Scheduler dispatches straight into the daemon state, so scheduled
    // jobs share the same concurrency limit as API requests.
    let scheduler = Scheduler::new(
        scheduler_config.clone(),
        Arc::clone(&daemon) as Arc<dyn ExecuteTarget>,
    );
    let loaded = scheduler.load().await;
    eprintln!(
        "   Scheduler: {} job(s), tick every {}s",
        loaded,
        scheduler_config.tick_interval.as_secs()
    );
    let ticker = spawn_ticker(Arc::clone(&scheduler), scheduler_config.tick_interval);

    let watcher = if watch_config.enabled {
        match FileWatcher::start(&watch_config, Arc::clone(&sync)) {
            Ok(w) => {
                eprintln!(
                    "   Watcher: enabled ({}ms debounce)",
                    watch_config.debounce.as_millis()
                );
                Some(w)
            }
            Err(e) => {
                tracing::warn!(error = %e, "File watcher unavailable, continuing without it");
                None
            }
        }
    } else {
        eprintln!("   Watcher: disabled");
        None
    };

    // Fatal if the port is taken — two daemons on one manifest store is
    // exactly what we don't want.
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr} (is another daemon running?)"))?;
    tracing::info!(addr = %addr, "Daemon listening");

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let app = daemon_routes(Arc::clone(&daemon), Arc::clone(&scheduler), shutdown_tx);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Interrupt received"),
                _ = shutdown_rx.recv() => {}
            }
        })
        .await
        .context("serving HTTP")?;

    // Teardown order: stop producing work (watcher, ticker) before
    // terminating what is in flight.
    if let Some(watcher) = watcher {
        watcher.stop().await;
    }
    ticker.abort();
    daemon.stop(config.kill_grace).await;
    tracing::info!("Daemon exited cleanly");
    Ok(())
}

// ── Sync CLI ────────────────────────────────────────────────────────────

async fn sync_command(args: &[&str]) -> ExitCode {
    init_cli_tracing();
    let config = DaemonConfig::from_env();
    let sync = SyncManager::new(config.scripts_dir.clone());

    match args {
        ["all"] => {
            let report = sync.sync_all().await;
            println!(
                "synced {}, unchanged {}, failed {}",
                report.synced, report.unchanged, report.failed
            );
            if report.failed > 0 {
                ExitCode::from(EXIT_FAILURE)
            } else {
                ExitCode::SUCCESS
            }
        }
        ["one", path] => match sync.sync_one(&PathBuf::from(path)).await {
            Ok(outcome) => {
                println!("{path}: {outcome:?}");
                ExitCode::SUCCESS
            }
            Err(SyncError::Unreadable { .. }) => {
                eprintln!("Error: script not found or unreadable: {path}");
                ExitCode::from(EXIT_NOT_FOUND)
            }
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::from(EXIT_FAILURE)
            }
        },
        ["status"] => match sync.status().await {
            Ok(status) => {
                println!(
                    "in_sync {}, stale {}, orphaned {}, untracked {}",
                    status.in_sync, status.stale, status.orphaned, status.untracked
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::from(EXIT_FAILURE)
            }
        },
        ["cleanup"] => match sync.cleanup().await {
            Ok(removed) => {
                println!("removed {removed} orphaned manifest(s)");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::from(EXIT_FAILURE)
            }
        },
        ["watch"] => {
            let watch_config = WatchConfig::from_env();
            let sync = Arc::new(sync);
            // Catch up first so the watcher only has deltas to handle.
            sync.sync_all().await;
            match FileWatcher::start(&watch_config, Arc::clone(&sync)) {
                Ok(watcher) => {
                    eprintln!(
                        "watching {} (Ctrl-C to stop)",
                        config.scripts_dir.display()
                    );
                    let _ = tokio::signal::ctrl_c().await;
                    watcher.stop().await;
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Error: {e}");
                    ExitCode::from(EXIT_FAILURE)
                }
            }
        }
        _ => {
            print_usage();
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

// ── Execution CLI ───────────────────────────────────────────────────────

async fn run_command(command: &str, args: &[&str]) -> ExitCode {
    init_cli_tracing();
    let daemon_config = DaemonConfig::from_env();
    let router_config = RouterConfig::from_env();
    let sync = Arc::new(SyncManager::new(daemon_config.scripts_dir.clone()));

    let router = ExecutionRouter::new(router_config, daemon_config, sync);
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();

    match router.execute(command, &args, None).await {
        Ok(job) => {
            if !job.stdout.is_empty() {
                print!("{}", job.stdout);
            }
            if !job.stderr.is_empty() {
                eprint!("{}", job.stderr);
            }
            if job.origin == ExecOrigin::Local {
                tracing::debug!("Executed locally");
            }
            match job.status {
                JobStatus::Succeeded => ExitCode::SUCCESS,
                _ => {
                    eprintln!("job {}: {}", job.id, job.status);
                    ExitCode::from(EXIT_FAILURE)
                }
            }
        }
        Err(Error::Execution(ExecutionError::CommandNotFound { name })) => {
            eprintln!("Error: command not found: {name}");
            ExitCode::from(EXIT_NOT_FOUND)
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

// ── Daemon CLI ──────────────────────────────────────────────────────────

async fn daemon_status() -> ExitCode {
    init_cli_tracing();
    let config = DaemonConfig::from_env();
    let client = DaemonClient::new(config.base_url());

    match client.status().await {
        Ok(status) => {
            println!("{}", serde_json::to_string_pretty(&status).unwrap_or_default());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn daemon_stop() -> ExitCode {
    init_cli_tracing();
    let config = DaemonConfig::from_env();
    let client = DaemonClient::new(config.base_url());

    match client.stop().await {
        Ok(reply) => {
            println!("{reply}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}
