//! [`TelemetryHooks`]: routine callbacks that publish to the job's channel.
//!
//! Runs on the routine's blocking thread, so it publishes through the
//! blocking publisher. Publish failures are logged and swallowed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use spektra_core::channel::ChannelName;
use spektra_core::job_events::LINE_TRAINING_CANCELLED;
use spektra_core::progress::{BatchUpdate, ProgressTracker};
use spektra_telemetry::BlockingPublisher;
use tokio_util::sync::CancellationToken;

use crate::routine::{RoutineError, TrainingHooks};

/// Validation metrics shown in the `val` summary line, in display order.
const VALIDATION_KEYS: [(&str, &str); 4] = [
    ("mAP50", "mAP50"),
    ("mAP50_95", "mAP50-95"),
    ("precision", "P"),
    ("recall", "R"),
];

pub struct TelemetryHooks {
    publisher: BlockingPublisher,
    channel: ChannelName,
    tracker: Mutex<ProgressTracker>,
    started: Instant,
    stop: CancellationToken,
    /// A stop raised while this is cancelled is not announced as a user
    /// cancellation.
    quiet: Option<CancellationToken>,
    announced: AtomicBool,
}

impl TelemetryHooks {
    pub fn new(
        publisher: BlockingPublisher,
        channel: ChannelName,
        tracker: ProgressTracker,
        stop: CancellationToken,
    ) -> Self {
        Self {
            publisher,
            channel,
            tracker: Mutex::new(tracker),
            started: Instant::now(),
            stop,
            quiet: None,
            announced: AtomicBool::new(false),
        }
    }

    pub fn with_quiet_stop(mut self, quiet: CancellationToken) -> Self {
        self.quiet = Some(quiet);
        self
    }

    fn tracker(&self) -> std::sync::MutexGuard<'_, ProgressTracker> {
        self.tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TrainingHooks for TelemetryHooks {
    fn check_cancelled(&self) -> Result<(), RoutineError> {
        if !self.stop.is_cancelled() {
            return Ok(());
        }
        let quiet = self.quiet.as_ref().is_some_and(CancellationToken::is_cancelled);
        if !quiet && !self.announced.swap(true, Ordering::SeqCst) {
            self.publisher
                .publish_or_warn(&self.channel, LINE_TRAINING_CANCELLED, None);
        }
        Err(RoutineError::Cancelled)
    }

    fn on_batch_end(&self, epoch: u32, total_epochs: u32, total_batches: u32) {
        let update = self
            .tracker()
            .on_batch_end(epoch, total_epochs, total_batches, self.started.elapsed());
        match update {
            BatchUpdate::Silent => {}
            BatchUpdate::Progress(progress) => {
                self.publisher.publish_progress_or_warn(&self.channel, &progress);
            }
            BatchUpdate::Line { line, progress } => {
                self.publisher
                    .publish_or_warn(&self.channel, line, Some(&progress));
            }
        }
    }

    fn on_epoch_end(&self, epoch: u32, total_epochs: u32, losses: &BTreeMap<String, f64>) {
        let (line, progress) =
            self.tracker()
                .on_epoch_end(epoch, total_epochs, losses, self.started.elapsed());
        self.publisher
            .publish_or_warn(&self.channel, line, Some(&progress));
    }

    fn on_validation_end(&self, metrics: &BTreeMap<String, f64>) {
        let parts: Vec<String> = VALIDATION_KEYS
            .iter()
            .filter_map(|(key, label)| metrics.get(*key).map(|v| format!("{label}={v:.4}")))
            .collect();
        if parts.is_empty() {
            return;
        }
        self.publisher
            .publish_or_warn(&self.channel, format!("  val  {}", parts.join("  ")), None);
    }

    fn log(&self, line: &str) {
        self.publisher.publish_or_warn(&self.channel, line, None);
    }
}
