//! Route definitions for the `/jobs` resource.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::jobs;
use crate::state::AppState;

/// Routes mounted at `/jobs`.
///
/// ```text
/// GET    /                       -> list_jobs
/// POST   /                       -> submit_job
/// GET    /model-architectures    -> list_architectures
/// POST   /auto-annotate          -> auto_annotate
/// POST   /predict-image          -> predict_image
/// GET    /{id}                   -> get_job
/// POST   /{id}/cancel            -> cancel_job
/// GET    /{id}/progress          -> get_progress
/// GET    /{id}/logs              -> get_logs
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(jobs::list_jobs).post(jobs::submit_job))
        .route("/model-architectures", get(jobs::list_architectures))
        .route("/auto-annotate", post(jobs::auto_annotate))
        .route("/predict-image", post(jobs::predict_image))
        .route("/{id}", get(jobs::get_job))
        .route("/{id}/cancel", post(jobs::cancel_job))
        .route("/{id}/progress", get(jobs::get_progress))
        .route("/{id}/logs", get(jobs::get_logs))
}
