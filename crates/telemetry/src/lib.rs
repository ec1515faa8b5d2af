//! Telemetry Channel: per-job pub/sub plus a TTL-bounded log buffer and a
//! single-slot latest-progress cache.
//!
//! The buffer and cache live in an external store with expiry (Postgres in
//! production), never in process globals, so either side of the submit /
//! execute split can restart without losing recent history.

pub mod channel;
mod fanout;
pub mod memory;
pub mod postgres;
pub mod subscription;
pub mod sweeper;

use std::time::Duration;

use async_trait::async_trait;
use spektra_core::channel::ChannelName;
use spektra_core::progress::Progress;
use spektra_core::telemetry::LogEntry;

pub use channel::{BlockingPublisher, TelemetryChannel};
pub use memory::MemoryTelemetryBackend;
pub use postgres::PgTelemetryBackend;
pub use subscription::Subscription;

/// Default retention of the ephemeral log buffer: 7 days.
pub const DEFAULT_LOG_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Default retention of the latest-progress slot: 24 hours.
pub const DEFAULT_PROGRESS_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Telemetry store error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Telemetry payload error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Telemetry listener unavailable")]
    ListenerClosed,
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Expiry windows for the buffer and the progress slot.
#[derive(Debug, Clone, Copy)]
pub struct TelemetryTtl {
    pub log: Duration,
    pub progress: Duration,
}

impl Default for TelemetryTtl {
    fn default() -> Self {
        Self {
            log: DEFAULT_LOG_TTL,
            progress: DEFAULT_PROGRESS_TTL,
        }
    }
}

/// Storage and transport behind a [`TelemetryChannel`].
#[async_trait]
pub trait TelemetryBackend: Send + Sync + 'static {
    /// Publish a log line (and optional progress) in one atomic step:
    /// live frames, buffer append and progress-slot overwrite.
    async fn publish(
        &self,
        channel: &ChannelName,
        entry: &LogEntry,
        progress: Option<&Progress>,
    ) -> TelemetryResult<()>;

    /// Publish progress only. The log buffer is untouched.
    async fn publish_progress(&self, channel: &ChannelName, progress: &Progress) -> TelemetryResult<()>;

    /// The unexpired log buffer in emission order. Non-destructive.
    async fn drain(&self, channel: &ChannelName) -> TelemetryResult<Vec<LogEntry>>;

    async fn latest_progress(&self, channel: &ChannelName) -> TelemetryResult<Option<Progress>>;

    /// Delete the channel's log buffer.
    async fn clear(&self, channel: &ChannelName) -> TelemetryResult<()>;

    async fn subscribe(&self, channel: &ChannelName) -> TelemetryResult<Subscription>;

    /// Remove expired buffer entries and progress slots. Returns rows removed.
    async fn sweep_expired(&self) -> TelemetryResult<u64>;
}
