//! Job entity models and DTOs.

use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use spektra_core::channel::ChannelName;
use spektra_core::job::{JobParameters, JobType};
use spektra_core::telemetry::LogEntry;
use spektra_core::types::{JobId, ProjectId, Timestamp};

use super::status::JobStatus;

/// Metric keys owned by users rather than the executor.
pub const DISPLAY_NAME_KEY: &str = "_display_name";
pub const NOTES_KEY: &str = "_notes";

/// A row from the `jobs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: JobId,
    pub project_id: ProjectId,
    pub job_type: String,
    #[sqlx(rename = "status_id")]
    pub status: JobStatus,
    pub channel_name: String,
    pub task_handle: Option<String>,
    pub parameters: Json<JobParameters>,
    pub artifact_path: Option<String>,
    pub metrics: serde_json::Value,
    pub logs: Json<Vec<LogEntry>>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

impl Job {
    /// The job's channel. Always derivable from the id, even when the
    /// stored name was never patched after a crash.
    pub fn channel(&self) -> ChannelName {
        ChannelName::for_job(self.id)
    }

    pub fn kind(&self) -> JobType {
        self.parameters.0.job_type()
    }
}

/// Values needed to persist a new PENDING job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub project_id: ProjectId,
    pub parameters: JobParameters,
    /// Provisional name written with the row; patched after enqueue.
    pub channel_name: ChannelName,
}

impl NewJob {
    pub fn new(project_id: ProjectId, parameters: JobParameters) -> Self {
        let id = uuid::Uuid::now_v7();
        Self {
            id,
            project_id,
            parameters,
            channel_name: ChannelName::for_job(id),
        }
    }
}

/// Query parameters for `GET /api/v1/jobs`.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct JobListQuery {
    pub project_id: Option<ProjectId>,
    pub job_type: Option<JobType>,
    pub status: Option<JobStatus>,
    /// Maximum number of results. Defaults to 50, capped at 100.
    pub limit: Option<i64>,
    /// Number of results to skip. Defaults to 0.
    pub offset: Option<i64>,
}

/// Maximum page size for job listing.
pub const MAX_LIMIT: i64 = 100;

/// Default page size for job listing.
pub const DEFAULT_LIMIT: i64 = 50;

impl JobListQuery {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.project_id.map_or(true, |p| p == job.project_id)
            && self.job_type.map_or(true, |t| t.as_str() == job.job_type)
            && self.status.map_or(true, |s| s == job.status)
    }
}

/// Body of `PATCH /api/v1/models/projects/{project_id}/{job_id}`.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct UpdateModelMetadata {
    pub display_name: Option<String>,
    pub notes: Option<String>,
}

impl UpdateModelMetadata {
    /// The metrics patch to merge, restricted to user-owned keys.
    pub fn to_patch(&self) -> serde_json::Value {
        let mut patch = serde_json::Map::new();
        if let Some(name) = &self.display_name {
            patch.insert(DISPLAY_NAME_KEY.into(), name.trim().into());
        }
        if let Some(notes) = &self.notes {
            patch.insert(NOTES_KEY.into(), notes.clone().into());
        }
        serde_json::Value::Object(patch)
    }
}

/// Shallow-merge `patch` into `metrics`, keys in `patch` winning.
pub fn merge_metrics(metrics: &mut serde_json::Value, patch: &serde_json::Value) {
    let Some(patch) = patch.as_object() else {
        return;
    };
    if !metrics.is_object() {
        *metrics = serde_json::Value::Object(serde_json::Map::new());
    }
    if let Some(target) = metrics.as_object_mut() {
        for (key, value) in patch {
            target.insert(key.clone(), value.clone());
        }
    }
}
