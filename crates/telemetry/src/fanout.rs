//! Process-local fan-out of channel frames to live subscribers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::broadcast;

/// Frames buffered per channel before a slow subscriber starts lagging.
const DEFAULT_CAPACITY: usize = 1024;

pub(crate) struct FanOut {
    senders: Mutex<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl Default for FanOut {
    fn default() -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl FanOut {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<String>>> {
        self.senders.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a receiver for `channel`. `on_first` runs under the registry
    /// lock when this is the channel's first live receiver.
    pub(crate) fn join(
        &self,
        channel: &str,
        on_first: impl FnOnce(&str),
    ) -> broadcast::Receiver<String> {
        let mut senders = self.lock();
        if let Some(sender) = senders.get(channel) {
            return sender.subscribe();
        }
        let (sender, receiver) = broadcast::channel(self.capacity);
        senders.insert(channel.to_string(), sender);
        on_first(channel);
        receiver
    }

    /// Drop the channel's sender once no receivers remain. `on_last` runs
    /// under the registry lock when the channel is removed.
    pub(crate) fn leave(&self, channel: &str, on_last: impl FnOnce(&str)) {
        let mut senders = self.lock();
        let idle = senders
            .get(channel)
            .is_some_and(|sender| sender.receiver_count() == 0);
        if idle {
            senders.remove(channel);
            on_last(channel);
        }
    }

    /// Deliver a frame to current receivers. Dropped when nobody listens.
    pub(crate) fn send(&self, channel: &str, frame: String) {
        if let Some(sender) = self.lock().get(channel) {
            // Zero receivers is not an error.
            let _ = sender.send(frame);
        }
    }

    /// Live receivers on `channel`.
    pub(crate) fn receiver_count(&self, channel: &str) -> usize {
        self.lock()
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    #[cfg(test)]
    pub(crate) fn is_tracked(&self, channel: &str) -> bool {
        self.lock().contains_key(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_join_and_last_leave_fire_callbacks() {
        let fanout = FanOut::default();
        let mut fired = Vec::new();

        let a = fanout.join("c", |_| fired.push("listen"));
        let b = fanout.join("c", |_| fired.push("listen-again"));
        drop(a);
        fanout.leave("c", |_| fired.push("unlisten"));
        assert!(fanout.is_tracked("c"));
        drop(b);
        fanout.leave("c", |_| fired.push("unlisten"));

        assert_eq!(fired, vec!["listen", "unlisten"]);
        assert!(!fanout.is_tracked("c"));
    }

    #[tokio::test]
    async fn send_reaches_every_receiver() {
        let fanout = FanOut::default();
        let mut a = fanout.join("c", |_| {});
        let mut b = fanout.join("c", |_| {});
        fanout.send("c", "hello".into());
        fanout.send("other", "ignored".into());
        assert_eq!(a.recv().await.unwrap(), "hello");
        assert_eq!(b.recv().await.unwrap(), "hello");
    }
}
