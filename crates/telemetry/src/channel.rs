//! [`TelemetryChannel`]: the facade both processes publish and read through.

use std::sync::Arc;

use spektra_core::channel::ChannelName;
use spektra_core::progress::Progress;
use spektra_core::telemetry::LogEntry;
use tokio::runtime::Handle;

use crate::memory::MemoryTelemetryBackend;
use crate::subscription::Subscription;
use crate::{TelemetryBackend, TelemetryResult};

/// Cheaply cloneable handle over a shared [`TelemetryBackend`].
#[derive(Clone)]
pub struct TelemetryChannel {
    backend: Arc<dyn TelemetryBackend>,
}

impl TelemetryChannel {
    pub fn new(backend: Arc<dyn TelemetryBackend>) -> Self {
        Self { backend }
    }

    /// A channel over a fresh in-process backend.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryTelemetryBackend::default()))
    }

    /// Publish a timestamped log line, optionally with a progress payload.
    pub async fn publish(
        &self,
        channel: &ChannelName,
        line: impl Into<String>,
        progress: Option<&Progress>,
    ) -> TelemetryResult<()> {
        let entry = LogEntry::now(line);
        self.backend.publish(channel, &entry, progress).await
    }

    pub async fn publish_progress(&self, channel: &ChannelName, progress: &Progress) -> TelemetryResult<()> {
        self.backend.publish_progress(channel, progress).await
    }

    /// [`publish`](Self::publish), logging and swallowing failures.
    pub async fn publish_or_warn(
        &self,
        channel: &ChannelName,
        line: impl Into<String>,
        progress: Option<&Progress>,
    ) {
        if let Err(e) = self.publish(channel, line, progress).await {
            tracing::warn!(channel = %channel, error = %e, "Telemetry publish failed");
        }
    }

    /// [`publish_progress`](Self::publish_progress), logging and swallowing failures.
    pub async fn publish_progress_or_warn(&self, channel: &ChannelName, progress: &Progress) {
        if let Err(e) = self.publish_progress(channel, progress).await {
            tracing::warn!(channel = %channel, error = %e, "Telemetry progress publish failed");
        }
    }

    pub async fn drain(&self, channel: &ChannelName) -> TelemetryResult<Vec<LogEntry>> {
        self.backend.drain(channel).await
    }

    pub async fn latest_progress(&self, channel: &ChannelName) -> TelemetryResult<Option<Progress>> {
        self.backend.latest_progress(channel).await
    }

    pub async fn clear(&self, channel: &ChannelName) -> TelemetryResult<()> {
        self.backend.clear(channel).await
    }

    pub async fn subscribe(&self, channel: &ChannelName) -> TelemetryResult<Subscription> {
        self.backend.subscribe(channel).await
    }

    pub async fn sweep_expired(&self) -> TelemetryResult<u64> {
        self.backend.sweep_expired().await
    }

    /// A publisher for synchronous code running off the runtime, such as a
    /// routine on a `spawn_blocking` thread.
    pub fn blocking(&self, handle: Handle) -> BlockingPublisher {
        BlockingPublisher {
            channel: self.clone(),
            handle,
        }
    }
}

/// Blocking twin of the [`TelemetryChannel`] publish operations.
///
/// Must not be used from a runtime worker thread: `block_on` would panic.
#[derive(Clone)]
pub struct BlockingPublisher {
    channel: TelemetryChannel,
    handle: Handle,
}

impl BlockingPublisher {
    pub fn publish(
        &self,
        channel: &ChannelName,
        line: impl Into<String>,
        progress: Option<&Progress>,
    ) -> TelemetryResult<()> {
        self.handle.block_on(self.channel.publish(channel, line, progress))
    }

    pub fn publish_progress(&self, channel: &ChannelName, progress: &Progress) -> TelemetryResult<()> {
        self.handle.block_on(self.channel.publish_progress(channel, progress))
    }

    pub fn publish_or_warn(&self, channel: &ChannelName, line: impl Into<String>, progress: Option<&Progress>) {
        self.handle
            .block_on(self.channel.publish_or_warn(channel, line, progress));
    }

    pub fn publish_progress_or_warn(&self, channel: &ChannelName, progress: &Progress) {
        self.handle
            .block_on(self.channel.publish_progress_or_warn(channel, progress));
    }
}

#[cfg(test)]
mod tests {
    use spektra_core::progress::Phase;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn blocking_and_async_publish_look_the_same() {
        let telemetry = TelemetryChannel::in_memory();
        let ch = ChannelName::for_job(uuid::Uuid::new_v4());
        let mut sub = telemetry.subscribe(&ch).await.unwrap();

        telemetry
            .publish(&ch, "from async", Some(&Progress::phase_only(Phase::Training)))
            .await
            .unwrap();

        let publisher = telemetry.blocking(Handle::current());
        let ch2 = ch.clone();
        tokio::task::spawn_blocking(move || {
            publisher
                .publish(&ch2, "from blocking", Some(&Progress::phase_only(Phase::Training)))
                .unwrap();
        })
        .await
        .unwrap();

        let mut frames = Vec::new();
        for _ in 0..4 {
            frames.push(sub.next().await.unwrap());
        }
        assert_eq!(frames[0], "from async");
        assert_eq!(frames[2], "from blocking");
        assert_eq!(frames[1], frames[3]);

        let lines: Vec<String> = telemetry
            .drain(&ch)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.line)
            .collect();
        assert_eq!(lines, vec!["from async", "from blocking"]);
        sub.close();
    }

    #[tokio::test]
    async fn drain_is_idempotent_and_clear_empties() {
        let telemetry = TelemetryChannel::in_memory();
        let ch = ChannelName::for_job(uuid::Uuid::new_v4());
        telemetry.publish(&ch, "a", None).await.unwrap();
        telemetry.publish(&ch, "b", None).await.unwrap();

        let first = telemetry.drain(&ch).await.unwrap();
        let second = telemetry.drain(&ch).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);

        telemetry.clear(&ch).await.unwrap();
        assert!(telemetry.drain(&ch).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn late_subscriber_sees_only_new_events() {
        let telemetry = TelemetryChannel::in_memory();
        let ch = ChannelName::for_job(uuid::Uuid::new_v4());
        telemetry.publish(&ch, "before", None).await.unwrap();

        let mut sub = telemetry.subscribe(&ch).await.unwrap();
        telemetry.publish(&ch, "after", None).await.unwrap();
        assert_eq!(sub.next().await.unwrap(), "after");
    }
}
