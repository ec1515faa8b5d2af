use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spektra_api::background;
use spektra_api::config::ServerConfig;
use spektra_api::engine::JobSubmitter;
use spektra_api::router::build_app_router;
use spektra_api::state::AppState;
use spektra_db::store::PgJobStore;
use spektra_queue::PgTaskBroker;
use spektra_telemetry::{PgTelemetryBackend, TelemetryChannel};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "spektra_api=debug,tower_http=debug".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // --- Configuration ---
    let config = ServerConfig::from_env()?;
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Database ---
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = spektra_db::create_pool(&database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection pool created");

    spektra_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    spektra_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    // --- Collaborators ---
    let telemetry = TelemetryChannel::new(Arc::new(
        PgTelemetryBackend::connect(pool.clone(), config.telemetry_ttl)
            .await
            .context("Failed to start telemetry listener")?,
    ));
    let submitter = Arc::new(JobSubmitter::new(
        Arc::new(PgJobStore::new(pool.clone())),
        Arc::new(PgTaskBroker::new(pool)),
        telemetry.clone(),
    ));

    // --- Background tasks ---
    let background_cancel = CancellationToken::new();
    let sweeper_handle = tokio::spawn(background::telemetry_sweeper(
        telemetry,
        config.telemetry_sweep_interval(),
        background_cancel.clone(),
    ));
    let recovery_handle = tokio::spawn(background::orphan_recovery::run(
        Arc::clone(&submitter),
        config.orphan_recovery_after(),
        config.orphan_recovery_after().max(Duration::from_secs(1)),
        background_cancel.clone(),
    ));

    // --- Router ---
    let state = AppState {
        config: Arc::new(config.clone()),
        submitter,
    };
    let app = build_app_router(state, &config);

    // --- Start server ---
    let host: IpAddr = config.host.parse().context("Invalid HOST address")?;
    let addr = SocketAddr::new(host, config.port);
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");
    background_cancel.cancel();
    let grace = config.shutdown_timeout();
    let _ = tokio::time::timeout(grace, sweeper_handle).await;
    let _ = tokio::time::timeout(grace, recovery_handle).await;
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
