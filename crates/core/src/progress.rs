//! Structured progress snapshots and the math that produces them.
//!
//! Percent-complete and ETA are estimates. Within one execution the
//! reported percent never decreases and stays inside `[0, 100]`. The ETA
//! is withheld until at least [`MIN_ETA_FRACTION`] of the work is done and
//! is smoothed afterwards, because linear extrapolation from a tiny
//! fraction swings wildly during the first batches.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fraction of work below which no ETA is reported.
pub const MIN_ETA_FRACTION: f64 = 0.01;

/// Weight of the newest ETA sample in the exponential moving average.
const ETA_SMOOTHING: f64 = 0.3;

/// Lifecycle phase shown to clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Pending,
    Preparing,
    Training,
    Completed,
    Failed,
    Cancelled,
}

/// A point-in-time progress snapshot for one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub epoch: u32,
    pub total_epochs: u32,
    pub batch: u32,
    pub total_batches: u32,
    pub percent: f64,
    pub elapsed_seconds: f64,
    pub eta_seconds: f64,
    pub phase: Phase,
}

impl Progress {
    /// A snapshot carrying only a phase, all counters zero.
    pub fn phase_only(phase: Phase) -> Self {
        Self {
            phase,
            ..Self::default()
        }
    }

    /// Emitted when an execution starts resolving its inputs.
    pub fn preparing(total_epochs: u32) -> Self {
        Self {
            total_epochs,
            phase: Phase::Preparing,
            ..Self::default()
        }
    }

    /// Terminal snapshot for a successful execution.
    pub fn completed(total_epochs: u32, elapsed: Duration) -> Self {
        Self {
            epoch: total_epochs,
            total_epochs,
            percent: 100.0,
            elapsed_seconds: round1(elapsed.as_secs_f64()),
            phase: Phase::Completed,
            ..Self::default()
        }
    }
}

/// Overall percent complete for a position inside the epoch/batch grid.
///
/// `epoch` is 1-based. The result is clamped to `[0, 100]`.
pub fn overall_percent(epoch: u32, total_epochs: u32, batch: u32, total_batches: u32) -> f64 {
    let done_epochs = f64::from(epoch.saturating_sub(1));
    let within = f64::from(batch) / f64::from(total_batches.max(1));
    let fraction = (done_epochs + within.min(1.0)) / f64::from(total_epochs.max(1));
    (fraction * 100.0).clamp(0.0, 100.0)
}

/// Round to one decimal place.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// What a minor-iteration (batch) hook should publish.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchUpdate {
    /// Rate-limited away.
    Silent,
    /// Structured progress only.
    Progress(Progress),
    /// A log line with an attached progress payload.
    Line { line: String, progress: Progress },
}

/// Per-execution progress state driven by the routine's hooks.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total_epochs: u32,
    every_batches: u32,
    tick_batches: u32,
    batch_in_epoch: u32,
    last_percent: f64,
    smoothed_eta: Option<f64>,
}

impl ProgressTracker {
    /// Create a tracker.
    ///
    /// Every `every_batches` batches (and on an epoch's last batch) a log
    /// line plus progress is produced; every `tick_batches` batches in
    /// between a progress-only update is produced.
    pub fn new(total_epochs: u32, every_batches: u32, tick_batches: u32) -> Self {
        Self {
            total_epochs,
            every_batches: every_batches.max(1),
            tick_batches: tick_batches.max(1),
            batch_in_epoch: 0,
            last_percent: 0.0,
            smoothed_eta: None,
        }
    }

    pub fn total_epochs(&self) -> u32 {
        self.total_epochs
    }

    /// Highest percent reported so far.
    pub fn last_percent(&self) -> f64 {
        self.last_percent
    }

    /// Record the end of one batch.
    pub fn on_batch_end(
        &mut self,
        epoch: u32,
        total_epochs: u32,
        total_batches: u32,
        elapsed: Duration,
    ) -> BatchUpdate {
        self.observe_total(total_epochs);
        self.batch_in_epoch += 1;
        let batch = self.batch_in_epoch;

        let with_line = batch % self.every_batches == 0 || batch == total_batches;
        let tick = batch % self.tick_batches == 0;
        if !with_line && !tick {
            return BatchUpdate::Silent;
        }

        let raw = overall_percent(epoch, self.total_epochs, batch, total_batches);
        let progress = self.snapshot(epoch, batch, total_batches, raw, elapsed);

        if with_line {
            let epoch_pct = (100.0 * f64::from(batch) / f64::from(total_batches.max(1))).round();
            BatchUpdate::Line {
                line: format!(
                    "Epoch {epoch}/{}  batch {batch}/{total_batches}  ({epoch_pct}%)",
                    self.total_epochs
                ),
                progress,
            }
        } else {
            BatchUpdate::Progress(progress)
        }
    }

    /// Record the end of one epoch and reset the batch window.
    ///
    /// Returns the human-readable summary line and the full snapshot.
    pub fn on_epoch_end(
        &mut self,
        epoch: u32,
        total_epochs: u32,
        losses: &BTreeMap<String, f64>,
        elapsed: Duration,
    ) -> (String, Progress) {
        self.observe_total(total_epochs);
        self.batch_in_epoch = 0;

        let raw = 100.0 * f64::from(epoch) / f64::from(self.total_epochs.max(1));
        let progress = self.snapshot(epoch, 0, 0, raw, elapsed);

        let mut line = format!("Epoch {epoch}/{}", self.total_epochs);
        for (name, value) in losses {
            line.push_str(&format!("  {name}={value:.4}"));
        }
        (line, progress)
    }

    /// Build a training-phase snapshot, enforcing monotonic percent and
    /// a clamped, smoothed ETA.
    pub fn snapshot(
        &mut self,
        epoch: u32,
        batch: u32,
        total_batches: u32,
        raw_percent: f64,
        elapsed: Duration,
    ) -> Progress {
        let percent = raw_percent.clamp(0.0, 100.0).max(self.last_percent);
        self.last_percent = percent;

        let elapsed_secs = elapsed.as_secs_f64();
        let fraction = percent / 100.0;
        let eta = if fraction < MIN_ETA_FRACTION {
            0.0
        } else {
            let sample = (elapsed_secs / fraction * (1.0 - fraction)).max(0.0);
            let smoothed = match self.smoothed_eta {
                Some(prev) => ETA_SMOOTHING * sample + (1.0 - ETA_SMOOTHING) * prev,
                None => sample,
            };
            self.smoothed_eta = Some(smoothed);
            if fraction >= 1.0 {
                0.0
            } else {
                smoothed
            }
        };

        Progress {
            epoch,
            total_epochs: self.total_epochs,
            batch,
            total_batches,
            percent: round1(percent),
            elapsed_seconds: round1(elapsed_secs),
            eta_seconds: round1(eta),
            phase: Phase::Training,
        }
    }

    fn observe_total(&mut self, total_epochs: u32) {
        if total_epochs > 0 {
            self.total_epochs = total_epochs;
        }
    }
}
