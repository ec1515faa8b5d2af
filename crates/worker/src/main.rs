use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spektra_db::store::PgJobStore;
use spektra_queue::PgTaskBroker;
use spektra_telemetry::{PgTelemetryBackend, TelemetryChannel};
use spektra_worker::artifact::LocalArtifactStore;
use spektra_worker::config::WorkerConfig;
use spektra_worker::inputs::LocalInputResolver;
use spektra_worker::process::CommandRoutine;
use spektra_worker::{Executor, ExecutorSettings, Worker, WorkerSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "spektra_worker=debug".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // --- Configuration ---
    let config = WorkerConfig::from_env()?;
    tracing::info!(
        concurrency = config.concurrency,
        artifact_root = %config.artifact_root.display(),
        "Loaded worker configuration",
    );

    // --- Database ---
    let pool = spektra_db::create_pool(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    spektra_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database ready");

    // --- Collaborators ---
    let store = Arc::new(PgJobStore::new(pool.clone()));
    let telemetry = TelemetryChannel::new(Arc::new(
        PgTelemetryBackend::connect(pool.clone(), config.telemetry_ttl)
            .await
            .context("Failed to start telemetry listener")?,
    ));
    let broker = Arc::new(PgTaskBroker::new(pool));
    let artifacts = Arc::new(LocalArtifactStore::new(config.artifact_root.clone()));
    let inputs = Arc::new(LocalInputResolver::new(artifacts.clone()));
    let routine = Arc::new(CommandRoutine::new(
        config.train_command.clone(),
        config.predict_command.clone(),
    ));

    let executor = Arc::new(Executor::new(
        store,
        telemetry,
        artifacts,
        inputs,
        routine,
        ExecutorSettings {
            progress_every_batches: config.progress_every_batches,
            progress_tick_batches: config.progress_tick_batches,
            scratch_root: config.scratch_root.clone(),
        },
    ));
    let worker = Worker::new(
        broker,
        executor,
        WorkerSettings {
            queues: config.queues.clone(),
            concurrency: config.concurrency,
            poll_interval: config.poll_interval,
            lease: config.task_lease,
            shutdown_timeout: config.shutdown_timeout,
        },
    );

    // --- Run ---
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    worker.run(shutdown).await.context("Worker loop failed")?;
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
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
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
