#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use spektra_api::config::ServerConfig;
use spektra_api::engine::JobSubmitter;
use spektra_api::router::build_app_router;
use spektra_api::state::AppState;
use spektra_core::artifact::artifact_key;
use spektra_core::job::{CheckpointSelector, Hyperparams, JobParameters, TrainParams};
use spektra_core::types::ProjectId;
use spektra_db::models::job::{Job, NewJob};
use spektra_db::store::{JobStore, MemoryJobStore};
use spektra_queue::MemoryTaskBroker;
use spektra_telemetry::{MemoryTelemetryBackend, TelemetryChannel};
use tower::ServiceExt;
use uuid::Uuid;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..ServerConfig::default()
    }
}

/// The application router wired to in-memory collaborators, plus handles
/// on those collaborators for assertions.
pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryJobStore>,
    pub broker: Arc<MemoryTaskBroker>,
    pub backend: Arc<MemoryTelemetryBackend>,
    pub telemetry: TelemetryChannel,
    pub submitter: Arc<JobSubmitter>,
}

/// Build the full application router with all middleware layers.
pub fn build_test_app() -> TestApp {
    let config = test_config();
    let store = Arc::new(MemoryJobStore::new());
    let broker = Arc::new(MemoryTaskBroker::new());
    let backend = Arc::new(MemoryTelemetryBackend::default());
    let telemetry = TelemetryChannel::new(backend.clone());
    let submitter = Arc::new(JobSubmitter::new(store.clone(), broker.clone(), telemetry.clone()));

    let state = AppState {
        config: Arc::new(config.clone()),
        submitter: Arc::clone(&submitter),
    };

    TestApp {
        router: build_app_router(state, &config),
        store,
        broker,
        backend,
        telemetry,
        submitter,
    }
}

impl TestApp {
    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.send(Method::GET, uri, None).await
    }

    pub async fn post_json(&self, uri: &str, body: serde_json::Value) -> Response<Body> {
        self.send(Method::POST, uri, Some(body)).await
    }

    pub async fn post(&self, uri: &str) -> Response<Body> {
        self.send(Method::POST, uri, None).await
    }

    pub async fn patch_json(&self, uri: &str, body: serde_json::Value) -> Response<Body> {
        self.send(Method::PATCH, uri, Some(body)).await
    }

    async fn send(&self, method: Method, uri: &str, body: Option<serde_json::Value>) -> Response<Body> {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Create a COMPLETED train job with a stored artifact.
    pub async fn trained_model(&self, project_id: ProjectId, architecture: &str) -> Job {
        let params = TrainParams::new(architecture, Hyperparams::default(), CheckpointSelector::Coco, None).unwrap();
        let job = self
            .store
            .create(&NewJob::new(project_id, JobParameters::Train(params)))
            .await
            .unwrap();
        let key = artifact_key(job.id, Uuid::new_v4(), chrono::Utc::now(), "best.pt");
        self.store.mark_running(job.id).await.unwrap();
        assert!(self
            .store
            .complete(job.id, Some(&key), &serde_json::json!({ "mAP50": 0.61 }))
            .await
            .unwrap());
        self.store.find(job.id).await.unwrap().unwrap()
    }
}

/// Read a response body as JSON.
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn train_body(project_id: ProjectId) -> serde_json::Value {
    serde_json::json!({
        "project_id": project_id,
        "job_type": "train",
        "model_arch": "yolo11n.pt",
        "hyperparams": { "epochs": 3, "batch": 4, "image_size": 320 },
    })
}
