pub mod health;
pub mod jobs;
pub mod models;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::ws;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /ws/jobs/{id}                                    live telemetry (WebSocket)
///
/// /jobs                                            list, submit
/// /jobs/model-architectures                        architecture catalog
/// /jobs/auto-annotate                              predict unlabeled images
/// /jobs/predict-image                              predict one image
/// /jobs/{id}                                       get
/// /jobs/{id}/cancel                                cancel (POST)
/// /jobs/{id}/progress                              latest progress
/// /jobs/{id}/logs                                  log entries
///
/// /models/projects/{project_id}                    trained models
/// /models/projects/{project_id}/{job_id}           update display metadata (PATCH)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws/jobs/{id}", get(ws::stream_job))
        .nest("/jobs", jobs::router())
        .nest("/models", models::router())
}
