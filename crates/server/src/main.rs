use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jobflow_core::notify::SYSTEM_NOTIFICATION;
use jobflow_core::recovery::ResettableResource;
use jobflow_core::{
    builtin_strategies, load_config, validate_config, ApprovalGate, InMemoryJobStore,
    NotificationHub, Orchestrator, PipelineRegistry, RecoveryCoordinator, Snapshotter,
    SqliteSnapshotStore,
};
use jobflow_server::api::create_router;
use jobflow_server::state::AppState;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    let json = std::env::var("JOBFLOW_LOG_FORMAT").is_ok_and(|format| format == "json");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// `JOBFLOW_CONFIG` if set, else `config.toml` when present, else defaults.
fn config_path() -> Option<PathBuf> {
    match std::env::var("JOBFLOW_CONFIG") {
        Ok(path) => Some(PathBuf::from(path)),
        Err(_) => {
            let default = PathBuf::from("config.toml");
            default.exists().then_some(default)
        }
    }
}

async fn run() -> Result<()> {
    init_logging();

    // Load configuration
    let config_path = config_path();
    match &config_path {
        Some(path) => info!("Loading configuration from {:?}", path),
        None => info!("No configuration file, using defaults and environment"),
    }
    let config = load_config(config_path.as_deref())
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    // Validate configuration
    validate_config(&config).context("Configuration validation failed")?;

    info!("Configuration loaded successfully");
    info!("Snapshot path: {:?}", config.storage.snapshot_path);
    info!("Pipelines: {}", config.pipelines.len());

    // Core components
    let store = Arc::new(InMemoryJobStore::new());
    let hub = Arc::new(NotificationHub::new(config.notifications.listener_buffer));
    let gate = ApprovalGate::new(store.clone(), hub.clone(), config.approval.default_timeout());

    let snapshot_store = Arc::new(
        SqliteSnapshotStore::new(&config.storage.snapshot_path)
            .context("Failed to open snapshot store")?,
    );
    let snapshotter = Arc::new(Snapshotter::new(
        store.clone(),
        gate.clone(),
        snapshot_store.clone(),
    ));
    info!("Snapshot store initialized");

    let resettable: Arc<dyn ResettableResource> = snapshot_store;
    let strategies = builtin_strategies(
        store.clone(),
        hub.clone(),
        config.orchestrator.work_dir.clone(),
        Some(resettable),
    );
    let recovery = Arc::new(
        RecoveryCoordinator::new(config.recovery.clone(), store.clone(), hub.clone())
            .with_strategies(strategies),
    );

    let pipelines = PipelineRegistry::from_config(&config.pipelines);
    let orchestrator = Arc::new(Orchestrator::new(
        config.orchestrator.clone(),
        store,
        hub.clone(),
        gate,
        recovery,
        pipelines,
    ));

    // Restore the previous process's state and settle what it left running
    let (jobs, approvals) = snapshotter
        .restore()
        .context("Failed to restore snapshot")?;
    info!("Restored {} jobs and {} approvals", jobs, approvals);

    let summary = orchestrator
        .recover_interrupted()
        .context("Failed to recover interrupted jobs")?;
    info!(
        "Interrupted work settled: {} approvals cancelled, {} jobs failed, {} jobs requeued",
        summary.approvals_cancelled, summary.jobs_failed, summary.jobs_requeued
    );

    // Background loops
    orchestrator.spawn_maintenance(config.storage.retention(), config.storage.cleanup_interval());

    let shutdown = CancellationToken::new();
    let snapshot_handle = {
        let snapshotter = snapshotter.clone();
        let interval = config.storage.snapshot_interval();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { snapshotter.run(interval, shutdown).await })
    };

    // Create app state
    let state = Arc::new(AppState::new(config.clone(), orchestrator.clone()));
    let app = create_router(state);

    // Start server
    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Starting jobflow {} on {}", VERSION, addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    hub.broadcast(
        SYSTEM_NOTIFICATION,
        json!({ "message": "server started", "version": VERSION }),
    );

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutting down...");
    hub.broadcast(
        SYSTEM_NOTIFICATION,
        json!({ "message": "server shutting down" }),
    );

    orchestrator.stop();

    // The snapshot loop writes once more before exiting
    shutdown.cancel();
    if let Err(e) = snapshot_handle.await {
        error!("Snapshot task failed: {}", e);
    }
    info!("Shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
