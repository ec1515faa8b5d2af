//! Per-execution state machine.
//!
//! ```text
//! mark RUNNING -> preparing -> resolve inputs -> routine -> finalize
//!                                   |               |
//!                                   +--> FAILED <---+--> CANCELLED
//! ```
//!
//! Only a PENDING job is claimed. A redelivered task that finds its job
//! RUNNING belongs to an execution that lost its lease, so the job is failed
//! instead of run twice. Every terminal write is conditional on the job
//! still being active, so a cancellation recorded by the submitter is never
//! overwritten. Scratch space is a [`TempDir`] dropped on every exit path.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use spektra_core::artifact::artifact_key;
use spektra_core::channel::ChannelName;
use spektra_core::job::{Hyperparams, JobParameters};
use spektra_core::job_events::{ERROR_LINE_PREFIX, LINE_CANCELLED_BEFORE_START, LINE_TRAINING_STOPPED};
use spektra_core::progress::{Phase, Progress, ProgressTracker};
use spektra_core::types::JobId;
use spektra_db::models::status::JobStatus;
use spektra_db::store::{JobStore, StoreError};
use spektra_queue::TaskPayload;
use spektra_telemetry::TelemetryChannel;
use tempfile::TempDir;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::artifact::ArtifactStore;
use crate::hooks::TelemetryHooks;
use crate::inputs::{InputResolver, ResolvedInputs};
use crate::metrics::collect_train_metrics;
use crate::routine::{PredictOutcome, Routine, RoutineContext, RoutineError, TrainOutcome};

// ---------------------------------------------------------------------------
// Control and settings
// ---------------------------------------------------------------------------

/// The stop signals of one execution.
///
/// `cancel` is the cooperative flag seen by the hooks. `interrupt` is the
/// hard signal: routines release external resources (kill child
/// processes) when it fires. `abandoned` marks a stop caused by losing the
/// task lease, which fails the job rather than cancelling it.
#[derive(Debug, Clone, Default)]
pub struct ExecutionControl {
    pub cancel: CancellationToken,
    pub interrupt: CancellationToken,
    pub abandoned: CancellationToken,
}

impl ExecutionControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the cooperative flag, and the hard interrupt when `terminate`.
    pub fn stop(&self, terminate: bool) {
        self.cancel.cancel();
        if terminate {
            self.interrupt.cancel();
        }
    }

    /// Hard stop after the task lease was lost to another claim.
    pub fn abandon(&self) {
        self.abandoned.cancel();
        self.stop(true);
    }

    fn stop_requested(&self) -> bool {
        self.cancel.is_cancelled() || self.interrupt.is_cancelled()
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Batches between log lines with progress.
    pub progress_every_batches: u32,
    /// Batches between progress-only updates.
    pub progress_tick_batches: u32,
    /// Parent of per-execution scratch directories.
    pub scratch_root: Option<PathBuf>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            progress_every_batches: 10,
            progress_tick_batches: 5,
            scratch_root: None,
        }
    }
}

/// Published when a stop was caused by the lost lease.
const LINE_LEASE_LOST: &str = "Execution abandoned: task lease lost";

/// Failure recorded when a redelivered task finds its job already RUNNING.
const LINE_PREVIOUS_RUN_LOST: &str = "Execution interrupted: the previous run lost its task lease";

/// How an execution ended. Failures of the job itself are an outcome,
/// not an [`ExecutionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Failed,
    Cancelled,
    /// The job was already terminal when the task arrived.
    Skipped,
}

/// Infrastructure failure. The task is left unacknowledged so the broker
/// redelivers it.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

enum RoutineOutput {
    Train(TrainOutcome),
    Predict(PredictOutcome),
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor {
    store: Arc<dyn JobStore>,
    telemetry: TelemetryChannel,
    artifacts: Arc<dyn ArtifactStore>,
    inputs: Arc<dyn InputResolver>,
    routine: Arc<dyn Routine>,
    settings: ExecutorSettings,
}

impl Executor {
    pub fn new(
        store: Arc<dyn JobStore>,
        telemetry: TelemetryChannel,
        artifacts: Arc<dyn ArtifactStore>,
        inputs: Arc<dyn InputResolver>,
        routine: Arc<dyn Routine>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            telemetry,
            artifacts,
            inputs,
            routine,
            settings,
        }
    }

    /// Run one execution of the job named by `payload` to a terminal state.
    pub async fn execute(
        &self,
        payload: &TaskPayload,
        control: ExecutionControl,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let job_id = payload.job_id;
        let channel = &payload.channel;
        let job_type = payload.parameters.job_type();
        let started = Instant::now();

        if self.store.mark_running(job_id).await?.is_none() {
            let status = self.store.find(job_id).await?.map(|job| job.status);
            if status == Some(JobStatus::Running) {
                tracing::warn!(job_id = %job_id, "Job already RUNNING under a lapsed lease");
                return self.finish_failed(payload, LINE_PREVIOUS_RUN_LOST).await;
            }
            tracing::info!(job_id = %job_id, status = ?status, "Job is no longer pending, skipping execution");
            return Ok(ExecutionOutcome::Skipped);
        }
        tracing::info!(job_id = %job_id, job_type = %job_type, "Execution started");

        let total_epochs = payload.parameters.total_epochs();
        self.telemetry
            .publish_or_warn(
                channel,
                format!("Preparing {job_type} job"),
                Some(&Progress::preparing(total_epochs)),
            )
            .await;

        let scratch = match self.scratch_dir() {
            Ok(dir) => dir,
            Err(e) => {
                return self
                    .finish_failed(payload, &format!("Failed to create scratch directory: {e}"))
                    .await;
            }
        };

        let inputs = match self.inputs.resolve(payload, scratch.path()).await {
            Ok(inputs) => inputs,
            Err(e) => return self.finish_failed(payload, &e.to_string()).await,
        };

        if control.stop_requested() {
            return self.finish_stopped(payload, &control, LINE_CANCELLED_BEFORE_START).await;
        }

        let result = self.run_routine(inputs, channel, total_epochs, &control).await;
        let outcome = match result {
            Ok(RoutineOutput::Train(out)) => self.finish_train(payload, out, started).await,
            Ok(RoutineOutput::Predict(out)) => self.finish_predict(payload, out, started).await,
            Err(RoutineError::Cancelled) => self.finish_stopped(payload, &control, LINE_TRAINING_STOPPED).await,
            Err(RoutineError::Failed(_)) if control.stop_requested() => {
                self.finish_stopped(payload, &control, LINE_TRAINING_STOPPED).await
            }
            Err(RoutineError::Failed(message)) => self.finish_failed(payload, &message).await,
        };

        drop(scratch);
        outcome
    }

    fn scratch_dir(&self) -> std::io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("spektra-");
        match &self.settings.scratch_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
    }

    async fn run_routine(
        &self,
        inputs: ResolvedInputs,
        channel: &ChannelName,
        total_epochs: u32,
        control: &ExecutionControl,
    ) -> Result<RoutineOutput, RoutineError> {
        let runtime = Handle::current();
        let hooks = TelemetryHooks::new(
            self.telemetry.blocking(runtime.clone()),
            channel.clone(),
            ProgressTracker::new(
                total_epochs,
                self.settings.progress_every_batches,
                self.settings.progress_tick_batches,
            ),
            control.cancel.clone(),
        )
        .with_quiet_stop(control.abandoned.clone());
        let ctx = RoutineContext {
            hooks: Arc::new(hooks),
            interrupt: control.interrupt.clone(),
            runtime,
        };
        let routine = Arc::clone(&self.routine);

        let joined = tokio::task::spawn_blocking(move || match inputs {
            ResolvedInputs::Train(request) => routine.train(&request, &ctx).map(RoutineOutput::Train),
            ResolvedInputs::Predict(request) => routine.predict(&request, &ctx).map(RoutineOutput::Predict),
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(e) => Err(RoutineError::Failed(format!("Routine aborted: {e}"))),
        }
    }

    // -----------------------------------------------------------------------
    // Terminal paths
    // -----------------------------------------------------------------------

    async fn finish_train(
        &self,
        payload: &TaskPayload,
        outcome: TrainOutcome,
        started: Instant,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let hyperparams = match &payload.parameters {
            JobParameters::Train(params) => params.hyperparams,
            JobParameters::Predict(_) => Hyperparams::default(),
        };
        let metrics = collect_train_metrics(&outcome.metrics, &hyperparams, outcome.save_dir.as_deref());

        let Some(weights) = outcome.weights else {
            return self.finish_failed(payload, "Training finished without producing weights").await;
        };
        let file_name = weights
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("best.pt");
        let key = artifact_key(payload.job_id, Uuid::new_v4(), chrono::Utc::now(), file_name);
        if let Err(e) = self.artifacts.store(&key, &weights).await {
            return self
                .finish_failed(payload, &format!("Failed to store artifact: {e}"))
                .await;
        }

        self.finish_completed(payload, Some(key), metrics, started).await
    }

    async fn finish_predict(
        &self,
        payload: &TaskPayload,
        outcome: PredictOutcome,
        started: Instant,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let auto_annotate = match &payload.parameters {
            JobParameters::Predict(params) => params.auto_annotate,
            JobParameters::Train(_) => false,
        };
        let mut metrics = json!({
            "images": outcome.images,
            "detections": outcome.detections,
            "auto_annotate": auto_annotate,
        });
        if let Value::Object(map) = &mut metrics {
            for (key, value) in &outcome.metrics {
                if let Some(number) = serde_json::Number::from_f64(*value) {
                    map.entry(key.clone()).or_insert(Value::Number(number));
                }
            }
        }
        self.telemetry
            .publish_or_warn(
                &payload.channel,
                format!(
                    "Processed {} images, {} detections",
                    outcome.images, outcome.detections
                ),
                None,
            )
            .await;

        self.finish_completed(payload, None, metrics, started).await
    }

    async fn finish_completed(
        &self,
        payload: &TaskPayload,
        artifact: Option<String>,
        metrics: Value,
        started: Instant,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let job_id = payload.job_id;
        let completed = match self.store.complete(job_id, artifact.as_deref(), &metrics).await {
            Ok(completed) => completed,
            Err(e) => {
                self.discard_artifact(artifact.as_deref()).await;
                self.persist_logs(job_id, &payload.channel).await;
                return Err(e.into());
            }
        };

        if !completed {
            // Someone else (the cancel path) finalized the job first.
            self.discard_artifact(artifact.as_deref()).await;
            tracing::info!(job_id = %job_id, "Job finalized elsewhere, result discarded");
            self.flush_logs(job_id, &payload.channel).await;
            return self.current_outcome(job_id).await;
        }

        let total_epochs = payload.parameters.total_epochs();
        let line = match payload.parameters {
            JobParameters::Train(_) => "Training complete",
            JobParameters::Predict(_) => "Prediction complete",
        };
        self.telemetry
            .publish_or_warn(
                &payload.channel,
                line,
                Some(&Progress::completed(total_epochs, started.elapsed())),
            )
            .await;
        self.flush_logs(job_id, &payload.channel).await;

        tracing::info!(job_id = %job_id, artifact = ?artifact, "Execution completed");
        Ok(ExecutionOutcome::Completed)
    }

    /// A stopped execution is cancelled, unless it was abandoned after
    /// losing its lease.
    async fn finish_stopped(
        &self,
        payload: &TaskPayload,
        control: &ExecutionControl,
        line: &str,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        if control.abandoned.is_cancelled() {
            return self.finish_failed(payload, LINE_LEASE_LOST).await;
        }
        self.finish_cancelled(payload, line).await
    }

    async fn finish_cancelled(
        &self,
        payload: &TaskPayload,
        line: &str,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let job_id = payload.job_id;
        self.telemetry.publish_or_warn(&payload.channel, line, None).await;

        let cancelled = match self.store.cancel(job_id).await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                self.persist_logs(job_id, &payload.channel).await;
                return Err(e.into());
            }
        };
        if cancelled.is_none() {
            tracing::debug!(job_id = %job_id, "Job already terminal, cancellation not written");
        }
        self.telemetry
            .publish_progress_or_warn(&payload.channel, &Progress::phase_only(Phase::Cancelled))
            .await;
        self.flush_logs(job_id, &payload.channel).await;

        tracing::info!(job_id = %job_id, "Execution cancelled");
        Ok(ExecutionOutcome::Cancelled)
    }

    async fn finish_failed(
        &self,
        payload: &TaskPayload,
        message: &str,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let job_id = payload.job_id;
        tracing::error!(job_id = %job_id, error = %message, "Execution failed");
        self.telemetry
            .publish_or_warn(&payload.channel, format!("{ERROR_LINE_PREFIX}{message}"), None)
            .await;

        let failed = match self.store.fail(job_id).await {
            Ok(failed) => failed,
            Err(e) => {
                self.persist_logs(job_id, &payload.channel).await;
                return Err(e.into());
            }
        };
        if !failed {
            tracing::info!(job_id = %job_id, "Job already terminal, failure not written");
            self.flush_logs(job_id, &payload.channel).await;
            return self.current_outcome(job_id).await;
        }
        self.telemetry
            .publish_progress_or_warn(&payload.channel, &Progress::phase_only(Phase::Failed))
            .await;
        self.flush_logs(job_id, &payload.channel).await;
        Ok(ExecutionOutcome::Failed)
    }

    /// Outcome matching the terminal status some other writer recorded.
    async fn current_outcome(&self, job_id: JobId) -> Result<ExecutionOutcome, ExecutionError> {
        let status = self.store.find(job_id).await?.map(|job| job.status);
        Ok(match status {
            Some(JobStatus::Completed) => ExecutionOutcome::Completed,
            Some(JobStatus::Failed) => ExecutionOutcome::Failed,
            _ => ExecutionOutcome::Cancelled,
        })
    }

    /// Copy the log buffer into the job row, then delete the buffer.
    /// Failures are logged and swallowed.
    async fn flush_logs(&self, job_id: JobId, channel: &ChannelName) {
        if !self.persist_logs(job_id, channel).await {
            return;
        }
        if let Err(e) = self.telemetry.clear(channel).await {
            tracing::debug!(job_id = %job_id, error = %e, "Failed to clear log buffer");
        }
    }

    /// Copy the log buffer into the job row and keep the buffer. Used when
    /// the terminal write failed and the task will be redelivered.
    async fn persist_logs(&self, job_id: JobId, channel: &ChannelName) -> bool {
        let entries = match self.telemetry.drain(channel).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to drain log buffer");
                return false;
            }
        };
        if let Err(e) = self.store.store_logs(job_id, &entries).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to persist logs");
            return false;
        }
        true
    }

    async fn discard_artifact(&self, key: Option<&str>) {
        if let Some(key) = key {
            if let Err(e) = self.artifacts.remove(key).await {
                tracing::warn!(key, error = %e, "Failed to remove discarded artifact");
            }
        }
    }
}
