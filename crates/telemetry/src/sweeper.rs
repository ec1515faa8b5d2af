//! Periodic removal of expired telemetry.
//!
//! Reads already ignore expired rows; the sweeper only reclaims space.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::channel::TelemetryChannel;

/// Default interval between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Run the sweep loop until `cancel` is triggered.
pub async fn run(telemetry: TelemetryChannel, interval: Duration, cancel: CancellationToken) {
    tracing::info!(interval_secs = interval.as_secs(), "Telemetry sweeper started");

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Telemetry sweeper stopping");
                break;
            }
            _ = ticker.tick() => {
                match telemetry.sweep_expired().await {
                    Ok(0) => tracing::debug!("Telemetry sweep: nothing expired"),
                    Ok(removed) => tracing::info!(removed, "Telemetry sweep: purged expired rows"),
                    Err(e) => tracing::error!(error = %e, "Telemetry sweep failed"),
                }
            }
        }
    }
}
