//! Handlers for the `/jobs` resource.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use spektra_core::catalog::MODEL_ARCHITECTURES;
use spektra_core::job::{
    predict_target, CreateJobRequest, JobParameters, ModelSource, PredictParams, PredictTarget,
    MAX_PREDICT_LIMIT, MODEL_SOURCE_LATEST,
};
use spektra_core::types::{JobId, ProjectId};
use spektra_db::models::job::JobListQuery;
use uuid::Uuid;
use validator::Validate;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs
///
/// Submit a train or predict job. Returns 201 with the PENDING job.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(input): Json<CreateJobRequest>,
) -> AppResult<impl IntoResponse> {
    let job = state.submitter.create_job(input).await?;
    Ok((StatusCode::CREATED, Json(DataResponse { data: job })))
}

fn default_model_path() -> String {
    MODEL_SOURCE_LATEST.to_string()
}

/// Body of `POST /api/v1/jobs/auto-annotate`.
#[derive(Debug, Deserialize, Validate)]
pub struct AutoAnnotateRequest {
    pub project_id: ProjectId,
    #[serde(default = "default_model_path")]
    #[validate(length(min = 1))]
    pub model_path: String,
    #[validate(range(min = 1, max = MAX_PREDICT_LIMIT))]
    pub limit: Option<u32>,
}

/// POST /api/v1/jobs/auto-annotate
///
/// Predict on up to `limit` unlabeled images and store the results as
/// suggestions.
pub async fn auto_annotate(
    State(state): State<AppState>,
    Json(input): Json<AutoAnnotateRequest>,
) -> AppResult<impl IntoResponse> {
    input.validate()?;
    let source: ModelSource = input.model_path.parse()?;
    let target = predict_target(None, input.limit)?;
    submit_predict(&state, input.project_id, source, target, true).await
}

/// Body of `POST /api/v1/jobs/predict-image`.
#[derive(Debug, Deserialize, Validate)]
pub struct PredictImageRequest {
    pub project_id: ProjectId,
    pub image_id: Uuid,
    #[serde(default = "default_model_path")]
    #[validate(length(min = 1))]
    pub model_path: String,
    #[serde(default)]
    pub auto_annotate: bool,
}

/// POST /api/v1/jobs/predict-image
///
/// Predict a single image.
pub async fn predict_image(
    State(state): State<AppState>,
    Json(input): Json<PredictImageRequest>,
) -> AppResult<impl IntoResponse> {
    input.validate()?;
    let source: ModelSource = input.model_path.parse()?;
    let target = PredictTarget::Images {
        image_ids: vec![input.image_id],
    };
    submit_predict(&state, input.project_id, source, target, input.auto_annotate).await
}

async fn submit_predict(
    state: &AppState,
    project_id: ProjectId,
    source: ModelSource,
    target: PredictTarget,
    auto_annotate: bool,
) -> AppResult<impl IntoResponse> {
    let model_path = state.submitter.resolve_model(project_id, source).await?;
    let parameters = JobParameters::Predict(PredictParams {
        model_path,
        target,
        auto_annotate,
    });
    let job = state.submitter.submit(project_id, parameters).await?;
    Ok((StatusCode::CREATED, Json(DataResponse { data: job })))
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs
///
/// Supports optional `project_id`, `job_type`, `status`, `limit` and
/// `offset` query parameters. Newest first.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<JobListQuery>,
) -> AppResult<impl IntoResponse> {
    let jobs = state.submitter.list_jobs(&params).await?;
    Ok(Json(DataResponse { data: jobs }))
}

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let job = state.submitter.get_job(job_id).await?;
    Ok(Json(DataResponse { data: job }))
}

/// GET /api/v1/jobs/{id}/progress
pub async fn get_progress(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let progress = state.submitter.get_progress(job_id).await?;
    Ok(Json(DataResponse { data: progress }))
}

/// GET /api/v1/jobs/{id}/logs
///
/// Ordered `{timestamp, line}` entries.
pub async fn get_logs(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let logs = state.submitter.get_logs(job_id).await?;
    Ok(Json(DataResponse { data: logs }))
}

/// GET /api/v1/jobs/model-architectures
pub async fn list_architectures() -> impl IntoResponse {
    Json(DataResponse {
        data: MODEL_ARCHITECTURES,
    })
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs/{id}/cancel
///
/// Returns the CANCELLED job, or 409 if the job is already terminal.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let job = state.submitter.cancel_job(job_id).await?;
    Ok(Json(DataResponse { data: job }))
}
