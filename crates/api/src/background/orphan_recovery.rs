//! Re-enqueue jobs lost between persist and enqueue.
//!
//! A submitter that crashes (or whose broker call fails) after creating
//! the row leaves a PENDING job with no task handle. This loop picks those
//! up once they are older than the recovery threshold.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::engine::JobSubmitter;

/// Run the recovery loop until `cancel` is triggered. The first pass runs
/// immediately.
pub async fn run(
    submitter: Arc<JobSubmitter>,
    older_than: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        older_than_secs = older_than.as_secs(),
        interval_secs = interval.as_secs(),
        "Orphan recovery started"
    );

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Orphan recovery stopping");
                break;
            }
            _ = ticker.tick() => {
                match submitter.recover_orphans(older_than).await {
                    Ok(0) => tracing::debug!("Orphan recovery: nothing to recover"),
                    Ok(recovered) => tracing::info!(recovered, "Orphan recovery: jobs re-enqueued"),
                    Err(e) => tracing::error!(error = %e, "Orphan recovery failed"),
                }
            }
        }
    }
}
