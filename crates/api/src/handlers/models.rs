//! Handlers for the trained-model registry.
//!
//! A trained model is a COMPLETED train job with an artifact. Users may
//! attach a display name and notes; those live in the job's metrics under
//! keys the executor never writes.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use spektra_core::job::JobParameters;
use spektra_core::types::{JobId, ProjectId, Timestamp};
use spektra_db::models::job::{Job, UpdateModelMetadata, DISPLAY_NAME_KEY, NOTES_KEY};
use validator::Validate;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct TrainedModel {
    pub job_id: JobId,
    pub project_id: ProjectId,
    pub artifact_path: Option<String>,
    pub model_architecture: Option<String>,
    pub display_name: Option<String>,
    pub notes: Option<String>,
    pub metrics: serde_json::Value,
    pub created_at: Timestamp,
    pub finished_at: Option<Timestamp>,
}

impl From<Job> for TrainedModel {
    fn from(job: Job) -> Self {
        let text = |key: &str| job.metrics.get(key).and_then(|v| v.as_str()).map(str::to_string);
        let display_name = text(DISPLAY_NAME_KEY);
        let notes = text(NOTES_KEY);
        let model_architecture = match &job.parameters.0 {
            JobParameters::Train(params) => Some(params.model_architecture.clone()),
            JobParameters::Predict(_) => None,
        };
        Self {
            job_id: job.id,
            project_id: job.project_id,
            artifact_path: job.artifact_path,
            model_architecture,
            display_name,
            notes,
            metrics: job.metrics,
            created_at: job.created_at,
            finished_at: job.finished_at,
        }
    }
}

/// Body of `PATCH /api/v1/models/projects/{project_id}/{job_id}`.
#[derive(Debug, Deserialize, Validate)]
pub struct UpdateModelRequest {
    #[validate(length(min = 1, max = 200))]
    pub display_name: Option<String>,
    #[validate(length(max = 5000))]
    pub notes: Option<String>,
}

/// GET /api/v1/models/projects/{project_id}
///
/// Newest first.
pub async fn list_models(
    State(state): State<AppState>,
    Path(project_id): Path<ProjectId>,
) -> AppResult<impl IntoResponse> {
    let models: Vec<TrainedModel> = state
        .submitter
        .list_trained_models(project_id)
        .await?
        .into_iter()
        .map(TrainedModel::from)
        .collect();
    Ok(Json(DataResponse { data: models }))
}

/// PATCH /api/v1/models/projects/{project_id}/{job_id}
pub async fn update_model(
    State(state): State<AppState>,
    Path((project_id, job_id)): Path<(ProjectId, JobId)>,
    Json(input): Json<UpdateModelRequest>,
) -> AppResult<impl IntoResponse> {
    input.validate()?;
    let update = UpdateModelMetadata {
        display_name: input.display_name,
        notes: input.notes,
    };
    let job = state
        .submitter
        .update_model_metadata(project_id, job_id, &update)
        .await?;
    Ok(Json(DataResponse {
        data: TrainedModel::from(job),
    }))
}
