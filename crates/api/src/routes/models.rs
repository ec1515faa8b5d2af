//! Route definitions for the trained-model registry.

use axum::routing::{get, patch};
use axum::Router;

use crate::handlers::models;
use crate::state::AppState;

/// Routes mounted at `/models`.
///
/// ```text
/// GET    /projects/{project_id}              -> list_models
/// PATCH  /projects/{project_id}/{job_id}     -> update_model
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/projects/{project_id}", get(models::list_models))
        .route("/projects/{project_id}/{job_id}", patch(models::update_model))
}
