//! The [`JobStore`] seam: everything the submitter and executor need from
//! the Job Record Store.
//!
//! [`PgJobStore`] delegates to [`JobRepo`]. [`MemoryJobStore`] applies the
//! same conditional-transition rules to an in-process map and backs the
//! scenario tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use spektra_core::telemetry::LogEntry;
use spektra_core::types::{JobId, ProjectId, Timestamp};
use tokio::sync::RwLock;

use crate::models::job::{merge_metrics, Job, JobListQuery, NewJob};
use crate::models::status::JobStatus;
use crate::repositories::JobRepo;
use crate::DbPool;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Verify the store is reachable.
    async fn ping(&self) -> StoreResult<()>;

    async fn create(&self, input: &NewJob) -> StoreResult<Job>;

    /// Record the channel and task handle unless a handle is already
    /// recorded. `None` if another dispatcher got there first.
    async fn claim_task(
        &self,
        id: JobId,
        channel_name: &str,
        task_handle: &str,
    ) -> StoreResult<Option<Job>>;

    async fn find(&self, id: JobId) -> StoreResult<Option<Job>>;

    async fn list(&self, query: &JobListQuery) -> StoreResult<Vec<Job>>;

    /// PENDING -> RUNNING. `None` if the job is missing or not PENDING.
    async fn mark_running(&self, id: JobId) -> StoreResult<Option<Job>>;

    /// RUNNING -> COMPLETED. `false` if the job was no longer RUNNING.
    async fn complete(
        &self,
        id: JobId,
        artifact_path: Option<&str>,
        metrics: &serde_json::Value,
    ) -> StoreResult<bool>;

    /// Non-terminal -> FAILED. `false` if already terminal.
    async fn fail(&self, id: JobId) -> StoreResult<bool>;

    /// PENDING/RUNNING -> CANCELLED. `None` if terminal or missing.
    async fn cancel(&self, id: JobId) -> StoreResult<Option<Job>>;

    async fn store_logs(&self, id: JobId, logs: &[LogEntry]) -> StoreResult<()>;

    async fn latest_artifact(&self, project_id: ProjectId) -> StoreResult<Option<String>>;

    async fn find_by_artifact(&self, artifact_path: &str) -> StoreResult<Option<Job>>;

    async fn list_trained_models(&self, project_id: ProjectId) -> StoreResult<Vec<Job>>;

    async fn merge_metrics(
        &self,
        project_id: ProjectId,
        id: JobId,
        patch: &serde_json::Value,
    ) -> StoreResult<Option<Job>>;

    async fn find_orphans(&self, older_than: Timestamp) -> StoreResult<Vec<Job>>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgJobStore {
    pool: DbPool,
}

impl PgJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(crate::health_check(&self.pool).await?)
    }

    async fn create(&self, input: &NewJob) -> StoreResult<Job> {
        Ok(JobRepo::create(&self.pool, input).await?)
    }

    async fn claim_task(
        &self,
        id: JobId,
        channel_name: &str,
        task_handle: &str,
    ) -> StoreResult<Option<Job>> {
        Ok(JobRepo::claim_task(&self.pool, id, channel_name, task_handle).await?)
    }

    async fn find(&self, id: JobId) -> StoreResult<Option<Job>> {
        Ok(JobRepo::find_by_id(&self.pool, id).await?)
    }

    async fn list(&self, query: &JobListQuery) -> StoreResult<Vec<Job>> {
        Ok(JobRepo::list(&self.pool, query).await?)
    }

    async fn mark_running(&self, id: JobId) -> StoreResult<Option<Job>> {
        Ok(JobRepo::mark_running(&self.pool, id).await?)
    }

    async fn complete(
        &self,
        id: JobId,
        artifact_path: Option<&str>,
        metrics: &serde_json::Value,
    ) -> StoreResult<bool> {
        Ok(JobRepo::complete(&self.pool, id, artifact_path, metrics).await?)
    }

    async fn fail(&self, id: JobId) -> StoreResult<bool> {
        Ok(JobRepo::fail(&self.pool, id).await?)
    }

    async fn cancel(&self, id: JobId) -> StoreResult<Option<Job>> {
        Ok(JobRepo::cancel(&self.pool, id).await?)
    }

    async fn store_logs(&self, id: JobId, logs: &[LogEntry]) -> StoreResult<()> {
        Ok(JobRepo::store_logs(&self.pool, id, logs).await?)
    }

    async fn latest_artifact(&self, project_id: ProjectId) -> StoreResult<Option<String>> {
        Ok(JobRepo::latest_artifact(&self.pool, project_id).await?)
    }

    async fn find_by_artifact(&self, artifact_path: &str) -> StoreResult<Option<Job>> {
        Ok(JobRepo::find_by_artifact(&self.pool, artifact_path).await?)
    }

    async fn list_trained_models(&self, project_id: ProjectId) -> StoreResult<Vec<Job>> {
        Ok(JobRepo::list_trained_models(&self.pool, project_id).await?)
    }

    async fn merge_metrics(
        &self,
        project_id: ProjectId,
        id: JobId,
        patch: &serde_json::Value,
    ) -> StoreResult<Option<Job>> {
        Ok(JobRepo::merge_metrics(&self.pool, project_id, id, patch).await?)
    }

    async fn find_orphans(&self, older_than: Timestamp) -> StoreResult<Vec<Job>> {
        Ok(JobRepo::find_orphans(&self.pool, older_than).await?)
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `f` to a job if its current status satisfies `allowed`.
    async fn transition<F>(&self, id: JobId, allowed: &[JobStatus], f: F) -> Option<Job>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id)?;
        if !allowed.contains(&job.status) {
            return None;
        }
        f(job);
        job.updated_at = Utc::now();
        Some(job.clone())
    }

    fn newest_first(jobs: &mut [Job]) {
        jobs.sort_by(|a, b| {
            b.finished_at
                .cmp(&a.finished_at)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
    }
}

const ACTIVE: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Running];

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn create(&self, input: &NewJob) -> StoreResult<Job> {
        let now = Utc::now();
        let job = Job {
            id: input.id,
            project_id: input.project_id,
            job_type: input.parameters.job_type().as_str().to_string(),
            status: JobStatus::Pending,
            channel_name: input.channel_name.to_string(),
            task_handle: None,
            parameters: Json(input.parameters.clone()),
            artifact_path: None,
            metrics: serde_json::json!({}),
            logs: Json(Vec::new()),
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        };
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_task(
        &self,
        id: JobId,
        channel_name: &str,
        task_handle: &str,
    ) -> StoreResult<Option<Job>> {
        let mut jobs = self.jobs.write().await;
        Ok(jobs.get_mut(&id).filter(|job| job.task_handle.is_none()).map(|job| {
            job.channel_name = channel_name.to_string();
            job.task_handle = Some(task_handle.to_string());
            job.updated_at = Utc::now();
            job.clone()
        }))
    }

    async fn find(&self, id: JobId) -> StoreResult<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn list(&self, query: &JobListQuery) -> StoreResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| query.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.limit() as usize)
            .collect())
    }

    async fn mark_running(&self, id: JobId) -> StoreResult<Option<Job>> {
        Ok(self
            .transition(id, &[JobStatus::Pending], |job| {
                job.status = JobStatus::Running;
                job.started_at = Some(Utc::now());
            })
            .await)
    }

    async fn complete(
        &self,
        id: JobId,
        artifact_path: Option<&str>,
        metrics: &serde_json::Value,
    ) -> StoreResult<bool> {
        Ok(self
            .transition(id, &[JobStatus::Running], |job| {
                job.status = JobStatus::Completed;
                job.artifact_path = artifact_path.map(str::to_string);
                merge_metrics(&mut job.metrics, metrics);
                job.finished_at = Some(Utc::now());
            })
            .await
            .is_some())
    }

    async fn fail(&self, id: JobId) -> StoreResult<bool> {
        Ok(self
            .transition(id, &ACTIVE, |job| {
                job.status = JobStatus::Failed;
                job.finished_at = Some(Utc::now());
            })
            .await
            .is_some())
    }

    async fn cancel(&self, id: JobId) -> StoreResult<Option<Job>> {
        Ok(self
            .transition(id, &ACTIVE, |job| {
                job.status = JobStatus::Cancelled;
                job.finished_at = Some(Utc::now());
            })
            .await)
    }

    async fn store_logs(&self, id: JobId, logs: &[LogEntry]) -> StoreResult<()> {
        if let Some(job) = self.jobs.write().await.get_mut(&id) {
            job.logs = Json(logs.to_vec());
        }
        Ok(())
    }

    async fn latest_artifact(&self, project_id: ProjectId) -> StoreResult<Option<String>> {
        let models = self.list_trained_models(project_id).await?;
        Ok(models.into_iter().next().and_then(|job| job.artifact_path))
    }

    async fn find_by_artifact(&self, artifact_path: &str) -> StoreResult<Option<Job>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .find(|job| job.artifact_path.as_deref() == Some(artifact_path))
            .cloned())
    }

    async fn list_trained_models(&self, project_id: ProjectId) -> StoreResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| {
                job.project_id == project_id
                    && job.job_type == "train"
                    && job.status == JobStatus::Completed
                    && job.artifact_path.is_some()
            })
            .cloned()
            .collect();
        Self::newest_first(&mut jobs);
        Ok(jobs)
    }

    async fn merge_metrics(
        &self,
        project_id: ProjectId,
        id: JobId,
        patch: &serde_json::Value,
    ) -> StoreResult<Option<Job>> {
        let mut jobs = self.jobs.write().await;
        Ok(jobs
            .get_mut(&id)
            .filter(|job| job.project_id == project_id && job.job_type == "train")
            .map(|job| {
                merge_metrics(&mut job.metrics, patch);
                job.updated_at = Utc::now();
                job.clone()
            }))
    }

    async fn find_orphans(&self, older_than: Timestamp) -> StoreResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| {
                job.status == JobStatus::Pending
                    && job.task_handle.is_none()
                    && job.created_at < older_than
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spektra_core::job::{CheckpointSelector, Hyperparams, JobParameters, TrainParams};
    use uuid::Uuid;

    fn train_job(project_id: ProjectId) -> NewJob {
        let params = TrainParams::new(
            "yolo11n.pt",
            Hyperparams::default(),
            CheckpointSelector::Coco,
            None,
        )
        .unwrap();
        NewJob::new(project_id, JobParameters::Train(params))
    }

    #[tokio::test]
    async fn terminal_status_is_never_overwritten() {
        let store = MemoryJobStore::new();
        let job = store.create(&train_job(Uuid::new_v4())).await.unwrap();

        store.mark_running(job.id).await.unwrap().unwrap();
        assert!(store.cancel(job.id).await.unwrap().is_some());

        assert!(!store.fail(job.id).await.unwrap());
        assert!(!store.complete(job.id, Some("models/x"), &serde_json::json!({})).await.unwrap());
        assert!(store.mark_running(job.id).await.unwrap().is_none());
        assert!(store.cancel(job.id).await.unwrap().is_none());

        let stored = store.find(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(stored.artifact_path, None);
    }

    #[tokio::test]
    async fn only_a_pending_job_can_be_marked_running() {
        let store = MemoryJobStore::new();
        let job = store.create(&train_job(Uuid::new_v4())).await.unwrap();

        let running = store.mark_running(job.id).await.unwrap().unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(store.mark_running(job.id).await.unwrap().is_none());
        assert!(store.mark_running(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_requires_running() {
        let store = MemoryJobStore::new();
        let job = store.create(&train_job(Uuid::new_v4())).await.unwrap();
        assert!(!store.complete(job.id, None, &serde_json::json!({})).await.unwrap());
        assert_eq!(store.find(job.id).await.unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn latest_artifact_prefers_most_recent_completion() {
        let store = MemoryJobStore::new();
        let project = Uuid::new_v4();
        assert_eq!(store.latest_artifact(project).await.unwrap(), None);

        for path in ["models/a", "models/b"] {
            let job = store.create(&train_job(project)).await.unwrap();
            store.mark_running(job.id).await.unwrap();
            store.complete(job.id, Some(path), &serde_json::json!({})).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(store.latest_artifact(project).await.unwrap().as_deref(), Some("models/b"));
        assert_eq!(store.latest_artifact(Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn metric_merge_preserves_user_keys() {
        let store = MemoryJobStore::new();
        let project = Uuid::new_v4();
        let job = store.create(&train_job(project)).await.unwrap();
        store
            .merge_metrics(project, job.id, &serde_json::json!({ "_display_name": "v1" }))
            .await
            .unwrap()
            .unwrap();
        store.mark_running(job.id).await.unwrap();
        store
            .complete(job.id, Some("models/a"), &serde_json::json!({ "mAP50": 0.7 }))
            .await
            .unwrap();

        let stored = store.find(job.id).await.unwrap().unwrap();
        assert_eq!(stored.metrics["_display_name"], "v1");
        assert_eq!(stored.metrics["mAP50"], 0.7);
    }

    #[tokio::test]
    async fn orphans_are_pending_jobs_without_handles() {
        let store = MemoryJobStore::new();
        let project = Uuid::new_v4();
        let orphan = store.create(&train_job(project)).await.unwrap();
        let queued = store.create(&train_job(project)).await.unwrap();
        store
            .claim_task(queued.id, queued.channel_name.as_str(), "handle-1")
            .await
            .unwrap();
        let reclaimed = store
            .claim_task(queued.id, queued.channel_name.as_str(), "handle-2")
            .await
            .unwrap();
        assert!(reclaimed.is_none());

        let found = store.find_orphans(Utc::now() + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, orphan.id);
        assert!(store.find_orphans(Utc::now() - chrono::Duration::hours(1)).await.unwrap().is_empty());
    }
}
