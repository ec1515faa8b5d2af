//! Live feed handle returned by `subscribe`.

use spektra_core::channel::ChannelName;
use tokio::sync::broadcast::{self, error::RecvError};

type Release = Box<dyn FnOnce() + Send + Sync>;

/// A live feed of every frame published on one channel after subscribing.
///
/// Release with [`Subscription::close`]. Dropping the handle releases it too,
/// so every exit path of a consumer unsubscribes.
pub struct Subscription {
    channel: ChannelName,
    receiver: Option<broadcast::Receiver<String>>,
    release: Option<Release>,
}

impl Subscription {
    pub(crate) fn new(
        channel: ChannelName,
        receiver: broadcast::Receiver<String>,
        release: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            channel,
            receiver: Some(receiver),
            release: Some(Box::new(release)),
        }
    }

    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    /// Wait for the next frame, verbatim. `None` once the feed is closed.
    ///
    /// A subscriber that falls too far behind skips the frames it missed.
    pub async fn next(&mut self) -> Option<String> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(frame) => return Some(frame),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(channel = %self.channel, skipped, "Telemetry subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Unsubscribe and release the feed.
    pub fn close(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        // The receiver must be gone before the release hook counts receivers.
        self.receiver.take();
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("open", &self.receiver.is_some())
            .finish()
    }
}
