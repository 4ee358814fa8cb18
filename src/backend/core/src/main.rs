//! dsq Server - Main entry point
//!
//! Applies migrations, starts the maintenance tasks (lease reclaim, periodic
//! backfill, autoscaler gauges) and serves the HTTP API.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use dsq_core::{
    api::{self, AppState},
    config::Config,
    jobs::{
        DepthPublishTask, IntervalSchedule, LeaseReclaimTask, MaintenanceScheduler,
        PeriodicBackfillTask,
    },
    service::{JobService, ServiceBackends},
    telemetry,
};

#[derive(Debug, Parser)]
#[command(name = "dsq-server", version, about = "dsq job queue and results cache server")]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "DSQ_CONFIG_FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    let metrics = telemetry::init_telemetry(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.observability.environment,
        "Starting dsq server"
    );

    // Stores first: migrations must be applied before anything dispatches
    let backends = ServiceBackends::from_config(&config).await?;
    let service = JobService::new(&config, backends)?;

    let shutdown = CancellationToken::new();
    let mut scheduler = MaintenanceScheduler::new();
    scheduler.schedule(
        Arc::new(LeaseReclaimTask::new(service.dispatcher().clone())),
        IntervalSchedule::new(config.queue.reclaim_interval).with_immediate(),
    );
    if config.backfill.enabled {
        scheduler.schedule(
            Arc::new(PeriodicBackfillTask::new(service.backfill_controller().clone())),
            IntervalSchedule::new(config.backfill.interval),
        );
    }
    scheduler.schedule(
        Arc::new(DepthPublishTask::new(service.depth_emitter().clone())),
        IntervalSchedule::new(config.autoscaler.refresh_interval).with_immediate(),
    );
    tracing::info!(tasks = ?scheduler.list(), "Maintenance tasks scheduled");
    let scheduler = scheduler.start(shutdown.clone());

    let app = api::build_router(AppState {
        service: service.clone(),
        metrics,
    });

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(address = %addr, "Starting HTTP server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup
    shutdown.cancel();
    service.shutdown();
    scheduler.shutdown().await;
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
