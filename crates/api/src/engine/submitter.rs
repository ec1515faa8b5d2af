//! The job submitter.
//!
//! Validates requests, persists jobs, hands them to the task broker and
//! answers read, cancel and stream requests. Nothing here waits on a job
//! to finish.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use spektra_core::error::CoreError;
use spektra_core::job::{
    CheckpointSelector, CreateJobRequest, JobParameters, ModelSource, ParsedJobRequest, PredictParams,
    TrainParams,
};
use spektra_core::job_events::LINE_CANCELLED_BY_USER;
use spektra_core::progress::{Phase, Progress};
use spektra_core::telemetry::LogEntry;
use spektra_core::types::{JobId, ProjectId};
use spektra_db::models::job::{Job, JobListQuery, NewJob, UpdateModelMetadata};
use spektra_db::models::status::JobStatus;
use spektra_db::store::JobStore;
use spektra_queue::{TaskBroker, TaskHandle, TaskMessage};
use spektra_telemetry::{Subscription, TelemetryChannel};

use crate::error::{AppError, AppResult};

#[derive(Clone)]
pub struct JobSubmitter {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn TaskBroker>,
    telemetry: TelemetryChannel,
}

impl JobSubmitter {
    pub fn new(store: Arc<dyn JobStore>, broker: Arc<dyn TaskBroker>, telemetry: TelemetryChannel) -> Self {
        Self {
            store,
            broker,
            telemetry,
        }
    }

    pub fn telemetry(&self) -> &TelemetryChannel {
        &self.telemetry
    }

    /// Whether the job record store answers.
    pub async fn store_healthy(&self) -> bool {
        self.store.ping().await.is_ok()
    }

    // -----------------------------------------------------------------------
    // Submit
    // -----------------------------------------------------------------------

    /// Validate, persist as PENDING, enqueue, then record the task handle.
    ///
    /// Validation failures return before any row exists. Once the row is
    /// persisted the job is accepted: if the enqueue fails the job stays
    /// PENDING without a handle and orphan recovery enqueues it later.
    pub async fn create_job(&self, request: CreateJobRequest) -> AppResult<Job> {
        let project_id = request.project_id;
        let parameters = self.resolve(request.parse()?).await?;
        self.submit(project_id, parameters).await
    }

    /// Persist and dispatch already-resolved parameters.
    pub async fn submit(&self, project_id: ProjectId, parameters: JobParameters) -> AppResult<Job> {
        let job = self.store.create(&NewJob::new(project_id, parameters)).await?;
        tracing::info!(
            job_id = %job.id,
            project_id = %job.project_id,
            job_type = %job.job_type,
            "Job created",
        );

        match self.dispatch(&job).await {
            Ok(Some(dispatched)) => Ok(dispatched),
            Ok(None) => Ok(self.store.find(job.id).await?.unwrap_or(job)),
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to enqueue job, left for orphan recovery");
                Ok(job)
            }
        }
    }

    /// Enqueue a persisted job under its own handle and claim that handle
    /// on the job row.
    ///
    /// Concurrent dispatches of one job enqueue a single task. `None` means
    /// another dispatcher recorded the handle first.
    async fn dispatch(&self, job: &Job) -> AppResult<Option<Job>> {
        let (queue, message) = TaskMessage::for_job(job.id, job.project_id, job.parameters.0.clone());
        let handle = TaskHandle::for_job(job.id);
        if self.broker.enqueue_as(handle, &queue, &message).await? {
            tracing::info!(job_id = %job.id, task = %handle, queue = %queue, "Job enqueued");
        }

        let claimed = self
            .store
            .claim_task(job.id, message.payload.channel.as_str(), &handle.to_string())
            .await?;
        if claimed.is_none() {
            tracing::debug!(job_id = %job.id, task = %handle, "Task handle already recorded");
        }
        Ok(claimed)
    }

    /// Turn a parsed request into final parameters using stored jobs.
    async fn resolve(&self, parsed: ParsedJobRequest) -> AppResult<JobParameters> {
        match parsed {
            ParsedJobRequest::Train {
                model_arch,
                hyperparams,
                checkpoint,
                dataset_version_id,
                ..
            } => {
                let model_arch = self.inherit_architecture(&checkpoint, model_arch).await?;
                let params = TrainParams::new(model_arch, hyperparams, checkpoint, dataset_version_id)?;
                Ok(JobParameters::Train(params))
            }
            ParsedJobRequest::Predict {
                project_id,
                source,
                target,
                auto_annotate,
            } => {
                let model_path = self.resolve_model(project_id, source).await?;
                Ok(JobParameters::Predict(PredictParams {
                    model_path,
                    target,
                    auto_annotate,
                }))
            }
        }
    }

    /// A checkpoint taken from an earlier training job keeps that job's
    /// architecture.
    async fn inherit_architecture(
        &self,
        checkpoint: &CheckpointSelector,
        requested: String,
    ) -> AppResult<String> {
        let CheckpointSelector::Artifact(key) = checkpoint else {
            return Ok(requested);
        };
        let Some(source) = self.store.find_by_artifact(key).await? else {
            return Ok(requested);
        };
        match &source.parameters.0 {
            JobParameters::Train(params) if params.model_architecture != requested => {
                tracing::debug!(
                    checkpoint = %key,
                    inherited = %params.model_architecture,
                    requested = %requested,
                    "Using checkpoint architecture",
                );
                Ok(params.model_architecture.clone())
            }
            _ => Ok(requested),
        }
    }

    /// Resolve a model source to an artifact key or catalog architecture.
    pub async fn resolve_model(&self, project_id: ProjectId, source: ModelSource) -> AppResult<String> {
        match source {
            ModelSource::Latest => self.store.latest_artifact(project_id).await?.ok_or_else(|| {
                AppError::Core(CoreError::Validation(
                    "No trained model found for this project. Train a model first.".into(),
                ))
            }),
            ModelSource::Artifact(key) | ModelSource::Pretrained(key) => Ok(key),
        }
    }

    // -----------------------------------------------------------------------
    // Read
    // -----------------------------------------------------------------------

    pub async fn get_job(&self, id: JobId) -> AppResult<Job> {
        self.store
            .find(id)
            .await?
            .ok_or_else(|| AppError::not_found("Job", id))
    }

    pub async fn list_jobs(&self, query: &JobListQuery) -> AppResult<Vec<Job>> {
        Ok(self.store.list(query).await?)
    }

    /// Point-in-time progress for a job.
    pub async fn get_progress(&self, id: JobId) -> AppResult<Progress> {
        let job = self.get_job(id).await?;
        let total_epochs = job.parameters.0.total_epochs();

        let progress = match job.status {
            JobStatus::Completed => {
                let elapsed = match (job.started_at, job.finished_at) {
                    (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
                    _ => Duration::ZERO,
                };
                Progress::completed(total_epochs, elapsed)
            }
            JobStatus::Failed => Progress::phase_only(Phase::Failed),
            JobStatus::Cancelled => Progress::phase_only(Phase::Cancelled),
            JobStatus::Pending | JobStatus::Running => {
                let cached = match self.telemetry.latest_progress(&job.channel()).await {
                    Ok(cached) => cached,
                    Err(e) => {
                        tracing::warn!(job_id = %id, error = %e, "Failed to read cached progress");
                        None
                    }
                };
                cached.unwrap_or_else(|| {
                    let phase = if job.status == JobStatus::Running {
                        Phase::Preparing
                    } else {
                        Phase::Pending
                    };
                    Progress {
                        total_epochs,
                        ..Progress::phase_only(phase)
                    }
                })
            }
        };
        Ok(progress)
    }

    /// Durable logs once flushed, otherwise the live buffer.
    pub async fn get_logs(&self, id: JobId) -> AppResult<Vec<LogEntry>> {
        let job = self.get_job(id).await?;
        if !job.logs.0.is_empty() {
            return Ok(job.logs.0);
        }
        Ok(self.telemetry.drain(&job.channel()).await?)
    }

    /// Open a live feed on an existing job's channel.
    pub async fn subscribe(&self, id: JobId) -> AppResult<Subscription> {
        let job = self.get_job(id).await?;
        Ok(self.telemetry.subscribe(&job.channel()).await?)
    }

    // -----------------------------------------------------------------------
    // Cancel
    // -----------------------------------------------------------------------

    /// Cancel a PENDING or RUNNING job.
    ///
    /// The status is flipped first and conditionally, so a cancel that
    /// loses to a terminal write publishes nothing and revokes nothing.
    /// Fire-and-forget towards the worker: the task is then revoked with
    /// terminate without waiting for the executor.
    pub async fn cancel_job(&self, id: JobId) -> AppResult<Job> {
        let job = self.get_job(id).await?;
        if !job.status.is_active() {
            return Err(not_cancellable(job.status));
        }

        let Some(cancelled) = self.store.cancel(id).await? else {
            // Reached a terminal status between the read and the write.
            let current = self.get_job(id).await?;
            return Err(not_cancellable(current.status));
        };

        let channel = cancelled.channel();
        self.telemetry
            .publish_or_warn(&channel, LINE_CANCELLED_BY_USER, None)
            .await;
        self.telemetry
            .publish_progress_or_warn(&channel, &Progress::phase_only(Phase::Cancelled))
            .await;

        match cancelled.task_handle.as_deref().map(str::parse::<TaskHandle>) {
            Some(Ok(handle)) => {
                if let Err(e) = self.broker.revoke(handle, true).await {
                    tracing::warn!(job_id = %id, task = %handle, error = %e, "Failed to revoke task");
                }
            }
            Some(Err(e)) => tracing::warn!(job_id = %id, error = %e, "Stored task handle is malformed"),
            None => tracing::debug!(job_id = %id, "Job has no task handle yet"),
        }

        tracing::info!(job_id = %id, "Job cancelled");
        Ok(cancelled)
    }

    // -----------------------------------------------------------------------
    // Trained models
    // -----------------------------------------------------------------------

    pub async fn list_trained_models(&self, project_id: ProjectId) -> AppResult<Vec<Job>> {
        Ok(self.store.list_trained_models(project_id).await?)
    }

    /// Merge user display metadata into a trained model's metrics.
    pub async fn update_model_metadata(
        &self,
        project_id: ProjectId,
        id: JobId,
        update: &UpdateModelMetadata,
    ) -> AppResult<Job> {
        let patch = update.to_patch();
        self.store
            .merge_metrics(project_id, id, &patch)
            .await?
            .ok_or_else(|| AppError::not_found("Model", id))
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Enqueue PENDING jobs that never received a task handle.
    ///
    /// Returns the number of jobs this call dispatched. A job another
    /// replica recovers at the same time is counted once overall.
    pub async fn recover_orphans(&self, older_than: Duration) -> AppResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        let orphans = self.store.find_orphans(cutoff).await?;

        let mut recovered = 0;
        for job in orphans {
            match self.dispatch(&job).await {
                Ok(Some(_)) => {
                    tracing::info!(job_id = %job.id, "Recovered orphaned job");
                    recovered += 1;
                }
                Ok(None) => tracing::debug!(job_id = %job.id, "Orphaned job dispatched elsewhere"),
                Err(e) => tracing::warn!(job_id = %job.id, error = %e, "Failed to recover orphaned job"),
            }
        }
        Ok(recovered)
    }
}

fn not_cancellable(status: JobStatus) -> AppError {
    AppError::Core(CoreError::Conflict(format!(
        "Job is {status} and cannot be cancelled"
    )))
}
