//! AppForge build server.
//!
//! Runs the build engine behind a small HTTP API: submit a build, poll its
//! status and log, cancel it, and download the finished packages.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use appforge_builder::config::EngineConfig;
use appforge_builder::metrics;
use appforge_builder::routes::{self, AppState};
use appforge_builder::services::scheduler::Scheduler;
use appforge_builder::store::{MemoryStore, RecordStore};

#[derive(Parser)]
#[command(name = "appforge-builder", about = "AppForge mobile build engine")]
struct Cli {
    /// Server port
    #[arg(short, long, env = "APPFORGE_PORT", default_value = "9090")]
    port: u16,

    /// Keep job workspaces after they finish, for diagnostics
    #[arg(long)]
    retain_workspaces: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();

    tracing::info!("Starting AppForge build server...");

    let mut config = EngineConfig::from_env();
    if cli.retain_workspaces && !config.retain_workspaces {
        tracing::warn!("Workspace retention enabled -- job directories will not be cleaned up");
        config.retain_workspaces = true;
    }

    tokio::fs::create_dir_all(&config.jobs_dir).await?;
    tokio::fs::create_dir_all(&config.artifacts_dir).await?;

    tracing::info!(
        template = %config.template_dir.display(),
        jobs = %config.jobs_dir.display(),
        artifacts = %config.artifacts_dir.display(),
        max_concurrent = config.max_concurrent_builds,
        timeout_secs = config.job_timeout.as_secs(),
        "Engine configuration loaded"
    );

    // Initialize metrics
    metrics::init_metrics();

    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::from_config(&config, store);

    let app = routes::build_router(AppState {
        scheduler: scheduler.clone(),
    })
    .layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    tracing::info!("AppForge build server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Stopping build scheduler...");
    scheduler.shutdown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
