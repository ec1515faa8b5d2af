//! Repository for the `jobs` table.
//!
//! Every status write is conditional on the current status, so a terminal
//! status is never overwritten and the first terminal write wins.

use sqlx::types::Json;
use sqlx::PgPool;
use spektra_core::telemetry::LogEntry;
use spektra_core::types::{JobId, ProjectId, Timestamp};

use crate::models::job::{Job, JobListQuery, NewJob};
use crate::models::status::{JobStatus, StatusId, TERMINAL_STATUSES};

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, project_id, job_type, status_id, channel_name, task_handle, \
    parameters, artifact_path, metrics, logs, \
    created_at, updated_at, started_at, finished_at";

/// PENDING and RUNNING.
const ACTIVE_STATUSES: [StatusId; 2] = [JobStatus::Pending as StatusId, JobStatus::Running as StatusId];

/// Provides persistence operations for jobs.
pub struct JobRepo;

impl JobRepo {
    /// Insert a new PENDING job with its provisional channel name.
    pub async fn create(pool: &PgPool, input: &NewJob) -> Result<Job, sqlx::Error> {
        let query = format!(
            "INSERT INTO jobs (id, project_id, job_type, status_id, channel_name, parameters) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(input.id)
            .bind(input.project_id)
            .bind(input.parameters.job_type().as_str())
            .bind(JobStatus::Pending.id())
            .bind(input.channel_name.as_str())
            .bind(Json(&input.parameters))
            .fetch_one(pool)
            .await
    }

    /// Second phase of submission: record the real channel and task handle.
    ///
    /// Only the first dispatcher to get here records its handle; `None`
    /// means the job is missing or already has one.
    pub async fn claim_task(
        pool: &PgPool,
        id: JobId,
        channel_name: &str,
        task_handle: &str,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs SET channel_name = $2, task_handle = $3 \
             WHERE id = $1 AND task_handle IS NULL \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(channel_name)
            .bind(task_handle)
            .fetch_optional(pool)
            .await
    }

    /// Find a job by its ID.
    pub async fn find_by_id(pool: &PgPool, id: JobId) -> Result<Option<Job>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// List jobs newest first with optional filters and pagination.
    pub async fn list(pool: &PgPool, params: &JobListQuery) -> Result<Vec<Job>, sqlx::Error> {
        // Build the WHERE clause and track the next bind parameter index.
        let mut conditions: Vec<String> = Vec::new();
        let mut bind_idx: u32 = 1;

        if params.project_id.is_some() {
            conditions.push(format!("project_id = ${bind_idx}"));
            bind_idx += 1;
        }
        if params.job_type.is_some() {
            conditions.push(format!("job_type = ${bind_idx}"));
            bind_idx += 1;
        }
        if params.status.is_some() {
            conditions.push(format!("status_id = ${bind_idx}"));
            bind_idx += 1;
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             {where_clause} \
             ORDER BY created_at DESC \
             LIMIT ${bind_idx} OFFSET ${}",
            bind_idx + 1,
        );

        let mut q = sqlx::query_as::<_, Job>(&query);
        if let Some(project_id) = params.project_id {
            q = q.bind(project_id);
        }
        if let Some(job_type) = params.job_type {
            q = q.bind(job_type.as_str());
        }
        if let Some(status) = params.status {
            q = q.bind(status.id());
        }
        q.bind(params.limit()).bind(params.offset()).fetch_all(pool).await
    }

    /// Claim a PENDING job for an execution by flipping it to RUNNING.
    ///
    /// Returns `None` when the job is missing or not PENDING, so two
    /// deliveries of one task never both run it.
    pub async fn mark_running(pool: &PgPool, id: JobId) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs SET status_id = $2, started_at = NOW() \
             WHERE id = $1 AND status_id = $3 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(JobStatus::Running.id())
            .bind(JobStatus::Pending.id())
            .fetch_optional(pool)
            .await
    }

    /// Mark a RUNNING job COMPLETED, merging `metrics` into the stored bag.
    ///
    /// Returns `false` when the job was no longer RUNNING (e.g. cancelled).
    pub async fn complete(
        pool: &PgPool,
        id: JobId,
        artifact_path: Option<&str>,
        metrics: &serde_json::Value,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs \
             SET status_id = $2, artifact_path = $3, metrics = metrics || $4, finished_at = NOW() \
             WHERE id = $1 AND status_id = $5",
        )
        .bind(id)
        .bind(JobStatus::Completed.id())
        .bind(artifact_path)
        .bind(metrics)
        .bind(JobStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark a non-terminal job FAILED. Returns `false` if already terminal.
    pub async fn fail(pool: &PgPool, id: JobId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs SET status_id = $2, finished_at = NOW() \
             WHERE id = $1 AND status_id <> ALL($3)",
        )
        .bind(id)
        .bind(JobStatus::Failed.id())
        .bind(&TERMINAL_STATUSES[..])
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Cancel a PENDING or RUNNING job.
    ///
    /// Returns the updated row, or `None` if the job is missing or already
    /// terminal.
    pub async fn cancel(pool: &PgPool, id: JobId) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs SET status_id = $2, finished_at = NOW() \
             WHERE id = $1 AND status_id = ANY($3) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(JobStatus::Cancelled.id())
            .bind(&ACTIVE_STATUSES[..])
            .fetch_optional(pool)
            .await
    }

    /// Persist the flushed log buffer.
    pub async fn store_logs(pool: &PgPool, id: JobId, logs: &[LogEntry]) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE jobs SET logs = $2 WHERE id = $1")
            .bind(id)
            .bind(Json(logs))
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Artifact of the most recent COMPLETED training job for a project.
    pub async fn latest_artifact(
        pool: &PgPool,
        project_id: ProjectId,
    ) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>(
            "SELECT artifact_path FROM jobs \
             WHERE project_id = $1 AND job_type = 'train' AND status_id = $2 \
               AND artifact_path IS NOT NULL \
             ORDER BY finished_at DESC NULLS LAST, created_at DESC \
             LIMIT 1",
        )
        .bind(project_id)
        .bind(JobStatus::Completed.id())
        .fetch_optional(pool)
        .await
    }

    /// The job that produced a given artifact, if any.
    pub async fn find_by_artifact(pool: &PgPool, artifact_path: &str) -> Result<Option<Job>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE artifact_path = $1");
        sqlx::query_as::<_, Job>(&query)
            .bind(artifact_path)
            .fetch_optional(pool)
            .await
    }

    /// COMPLETED training jobs with artifacts, newest first.
    pub async fn list_trained_models(
        pool: &PgPool,
        project_id: ProjectId,
    ) -> Result<Vec<Job>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE project_id = $1 AND job_type = 'train' AND status_id = $2 \
               AND artifact_path IS NOT NULL \
             ORDER BY finished_at DESC NULLS LAST, created_at DESC"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(project_id)
            .bind(JobStatus::Completed.id())
            .fetch_all(pool)
            .await
    }

    /// Merge user-owned keys into a trained model's metrics.
    pub async fn merge_metrics(
        pool: &PgPool,
        project_id: ProjectId,
        id: JobId,
        patch: &serde_json::Value,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs SET metrics = metrics || $3 \
             WHERE id = $1 AND project_id = $2 AND job_type = 'train' \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(project_id)
            .bind(patch)
            .fetch_optional(pool)
            .await
    }

    /// PENDING jobs that never received a task handle, created before
    /// `older_than`.
    pub async fn find_orphans(pool: &PgPool, older_than: Timestamp) -> Result<Vec<Job>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE status_id = $1 AND task_handle IS NULL AND created_at < $2 \
             ORDER BY created_at ASC"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(JobStatus::Pending.id())
            .bind(older_than)
            .fetch_all(pool)
            .await
    }
}
