//! In-process telemetry backend.
//!
//! Same externally observed behaviour as the Postgres backend, including
//! expiry, but confined to one process. Used by tests and single-process
//! development setups.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use spektra_core::channel::ChannelName;
use spektra_core::progress::Progress;
use spektra_core::telemetry::{encode_progress, LogEntry};
use tokio::time::Instant;

use crate::fanout::FanOut;
use crate::subscription::Subscription;
use crate::{TelemetryBackend, TelemetryResult, TelemetryTtl};

#[derive(Default)]
struct State {
    logs: HashMap<String, Vec<(LogEntry, Instant)>>,
    progress: HashMap<String, (Progress, Instant)>,
}

pub struct MemoryTelemetryBackend {
    ttl: TelemetryTtl,
    state: Mutex<State>,
    fanout: Arc<FanOut>,
}

impl Default for MemoryTelemetryBackend {
    fn default() -> Self {
        Self::new(TelemetryTtl::default())
    }
}

impl MemoryTelemetryBackend {
    pub fn new(ttl: TelemetryTtl) -> Self {
        Self {
            ttl,
            state: Mutex::new(State::default()),
            fanout: Arc::new(FanOut::default()),
        }
    }

    /// Number of open subscriptions on `channel`.
    pub fn live_subscribers(&self, channel: &ChannelName) -> usize {
        self.fanout.receiver_count(channel.as_str())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn put_progress(&self, state: &mut State, channel: &ChannelName, progress: &Progress) {
        state.progress.insert(
            channel.to_string(),
            (progress.clone(), Instant::now() + self.ttl.progress),
        );
        self.fanout.send(channel.as_str(), encode_progress(progress));
    }
}

#[async_trait]
impl TelemetryBackend for MemoryTelemetryBackend {
    async fn publish(
        &self,
        channel: &ChannelName,
        entry: &LogEntry,
        progress: Option<&Progress>,
    ) -> TelemetryResult<()> {
        // One lock for the whole publish keeps frames and buffer in the same order.
        let mut state = self.lock();
        self.fanout.send(channel.as_str(), entry.line.clone());
        state
            .logs
            .entry(channel.to_string())
            .or_default()
            .push((entry.clone(), Instant::now() + self.ttl.log));
        if let Some(progress) = progress {
            self.put_progress(&mut state, channel, progress);
        }
        Ok(())
    }

    async fn publish_progress(&self, channel: &ChannelName, progress: &Progress) -> TelemetryResult<()> {
        let mut state = self.lock();
        self.put_progress(&mut state, channel, progress);
        Ok(())
    }

    async fn drain(&self, channel: &ChannelName) -> TelemetryResult<Vec<LogEntry>> {
        let now = Instant::now();
        Ok(self
            .lock()
            .logs
            .get(channel.as_str())
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, expires)| *expires > now)
                    .map(|(entry, _)| entry.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn latest_progress(&self, channel: &ChannelName) -> TelemetryResult<Option<Progress>> {
        let now = Instant::now();
        Ok(self
            .lock()
            .progress
            .get(channel.as_str())
            .filter(|(_, expires)| *expires > now)
            .map(|(progress, _)| progress.clone()))
    }

    async fn clear(&self, channel: &ChannelName) -> TelemetryResult<()> {
        self.lock().logs.remove(channel.as_str());
        Ok(())
    }

    async fn subscribe(&self, channel: &ChannelName) -> TelemetryResult<Subscription> {
        let receiver = self.fanout.join(channel.as_str(), |_| {});
        let fanout = Arc::clone(&self.fanout);
        let name = channel.to_string();
        Ok(Subscription::new(channel.clone(), receiver, move || {
            fanout.leave(&name, |_| {});
        }))
    }

    async fn sweep_expired(&self) -> TelemetryResult<u64> {
        let now = Instant::now();
        let mut state = self.lock();
        let mut removed = 0u64;

        for entries in state.logs.values_mut() {
            let before = entries.len();
            entries.retain(|(_, expires)| *expires > now);
            removed += (before - entries.len()) as u64;
        }
        state.logs.retain(|_, entries| !entries.is_empty());

        let before = state.progress.len();
        state.progress.retain(|_, (_, expires)| *expires > now);
        removed += (before - state.progress.len()) as u64;

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use spektra_core::progress::Phase;

    use super::*;

    fn channel() -> ChannelName {
        ChannelName::for_job(uuid::Uuid::new_v4())
    }

    #[tokio::test]
    async fn publish_appends_and_fans_out() {
        let backend = MemoryTelemetryBackend::default();
        let ch = channel();
        let mut sub = backend.subscribe(&ch).await.unwrap();

        let progress = Progress::phase_only(Phase::Training);
        backend
            .publish(&ch, &LogEntry::now("Epoch 1/3"), Some(&progress))
            .await
            .unwrap();

        assert_eq!(sub.next().await.unwrap(), "Epoch 1/3");
        assert!(sub.next().await.unwrap().contains("\"type\":\"progress\""));
        assert_eq!(backend.drain(&ch).await.unwrap().len(), 1);
        assert_eq!(backend.latest_progress(&ch).await.unwrap(), Some(progress));
        sub.close();
    }

    #[tokio::test]
    async fn progress_only_skips_buffer() {
        let backend = MemoryTelemetryBackend::default();
        let ch = channel();
        backend
            .publish_progress(&ch, &Progress::preparing(3))
            .await
            .unwrap();
        assert!(backend.drain(&ch).await.unwrap().is_empty());
        assert_eq!(
            backend.latest_progress(&ch).await.unwrap().map(|p| p.phase),
            Some(Phase::Preparing)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_invisible_and_swept() {
        let backend = MemoryTelemetryBackend::new(TelemetryTtl {
            log: Duration::from_secs(60),
            progress: Duration::from_secs(10),
        });
        let ch = channel();
        backend
            .publish(&ch, &LogEntry::now("line"), Some(&Progress::default()))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(backend.latest_progress(&ch).await.unwrap(), None);
        assert_eq!(backend.drain(&ch).await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(backend.drain(&ch).await.unwrap().is_empty());
        assert_eq!(backend.sweep_expired().await.unwrap(), 2);
    }
}
