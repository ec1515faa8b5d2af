//! Input resolution: turn a task payload into a concrete routine request.
//!
//! Failures here are resolution errors. The executor records them as the
//! job's error trace and marks the job FAILED.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use spektra_core::catalog::find_architecture;
use spektra_core::job::{CheckpointSelector, JobParameters, PredictParams, TrainParams};
use spektra_core::types::ProjectId;
use spektra_queue::TaskPayload;
use uuid::Uuid;

use crate::artifact::{ArtifactError, ArtifactStore};
use crate::routine::{PredictRequest, ResolvedCheckpoint, ResolvedModel, TrainRequest};

/// Dataset manifest file the routine reads to export the dataset.
pub const DATASET_MANIFEST: &str = "dataset.json";

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Unsupported model architecture: {0}")]
    UnknownArchitecture(String),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("Failed to prepare inputs: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to write manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedInputs {
    Train(TrainRequest),
    Predict(PredictRequest),
}

#[async_trait]
pub trait InputResolver: Send + Sync + 'static {
    /// Resolve a payload's inputs, materializing files under `scratch`.
    async fn resolve(&self, payload: &TaskPayload, scratch: &Path) -> Result<ResolvedInputs, ResolveError>;
}

#[derive(Serialize)]
struct DatasetManifest {
    project_id: ProjectId,
    dataset_version_id: Option<Uuid>,
}

/// Resolves artifact references through an [`ArtifactStore`] and leaves
/// the dataset export to the routine via a manifest.
pub struct LocalInputResolver {
    artifacts: Arc<dyn ArtifactStore>,
}

impl LocalInputResolver {
    pub fn new(artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { artifacts }
    }

    async fn resolve_train(
        &self,
        payload: &TaskPayload,
        params: &TrainParams,
        scratch: &Path,
    ) -> Result<TrainRequest, ResolveError> {
        if find_architecture(&params.model_architecture).is_none() {
            return Err(ResolveError::UnknownArchitecture(params.model_architecture.clone()));
        }

        let checkpoint = match &params.checkpoint {
            CheckpointSelector::Coco => ResolvedCheckpoint::Pretrained {
                architecture: params.model_architecture.clone(),
            },
            CheckpointSelector::Scratch => ResolvedCheckpoint::Scratch {
                architecture: params.model_architecture.clone(),
            },
            CheckpointSelector::Artifact(key) => match self.artifacts.locate(key).await {
                Ok(path) => ResolvedCheckpoint::Weights { path },
                Err(ArtifactError::NotFound(_)) => return Err(ResolveError::CheckpointNotFound(key.clone())),
                Err(e) => return Err(e.into()),
            },
        };

        let dataset_dir = scratch.join("dataset");
        tokio::fs::create_dir_all(&dataset_dir).await?;
        let manifest = DatasetManifest {
            project_id: payload.project_id,
            dataset_version_id: params.dataset_version_id,
        };
        tokio::fs::write(dataset_dir.join(DATASET_MANIFEST), serde_json::to_vec_pretty(&manifest)?).await?;

        Ok(TrainRequest {
            job_id: payload.job_id,
            project_id: payload.project_id,
            model_architecture: params.model_architecture.clone(),
            hyperparams: params.hyperparams,
            checkpoint,
            dataset_version_id: params.dataset_version_id,
            dataset_dir,
            output_dir: output_dir(scratch).await?,
        })
    }

    async fn resolve_predict(
        &self,
        payload: &TaskPayload,
        params: &PredictParams,
        scratch: &Path,
    ) -> Result<PredictRequest, ResolveError> {
        let model = if find_architecture(&params.model_path).is_some() {
            ResolvedModel::Pretrained {
                architecture: params.model_path.clone(),
            }
        } else {
            match self.artifacts.locate(&params.model_path).await {
                Ok(path) => ResolvedModel::Weights { path },
                Err(ArtifactError::NotFound(_) | ArtifactError::InvalidKey(_)) => {
                    return Err(ResolveError::ModelNotFound(params.model_path.clone()));
                }
                Err(e) => return Err(e.into()),
            }
        };

        Ok(PredictRequest {
            job_id: payload.job_id,
            project_id: payload.project_id,
            model,
            target: params.target.clone(),
            auto_annotate: params.auto_annotate,
            output_dir: output_dir(scratch).await?,
        })
    }
}

async fn output_dir(scratch: &Path) -> std::io::Result<PathBuf> {
    let dir = scratch.join("output");
    tokio::fs::create_dir_all(&dir).await?;
    Ok(dir)
}

#[async_trait]
impl InputResolver for LocalInputResolver {
    async fn resolve(&self, payload: &TaskPayload, scratch: &Path) -> Result<ResolvedInputs, ResolveError> {
        match &payload.parameters {
            JobParameters::Train(params) => self
                .resolve_train(payload, params, scratch)
                .await
                .map(ResolvedInputs::Train),
            JobParameters::Predict(params) => self
                .resolve_predict(payload, params, scratch)
                .await
                .map(ResolvedInputs::Predict),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use spektra_core::job::{Hyperparams, PredictTarget};
    use spektra_queue::TaskMessage;

    use super::*;
    use crate::artifact::LocalArtifactStore;

    fn payload(params: JobParameters) -> TaskPayload {
        TaskMessage::for_job(Uuid::new_v4(), Uuid::new_v4(), params).1.payload
    }

    fn train(checkpoint: CheckpointSelector) -> JobParameters {
        JobParameters::Train(TrainParams::new("yolo11n.pt", Hyperparams::default(), checkpoint, None).unwrap())
    }

    fn predict(model_path: &str) -> JobParameters {
        JobParameters::Predict(PredictParams {
            model_path: model_path.to_string(),
            target: PredictTarget::Unlabeled { limit: 5 },
            auto_annotate: true,
        })
    }

    #[tokio::test]
    async fn train_writes_dataset_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = LocalInputResolver::new(Arc::new(LocalArtifactStore::new(dir.path().join("a"))));
        let payload = payload(train(CheckpointSelector::Coco));

        let resolved = resolver.resolve(&payload, dir.path()).await.unwrap();
        let ResolvedInputs::Train(request) = resolved else {
            panic!("expected a train request");
        };
        assert_eq!(
            request.checkpoint,
            ResolvedCheckpoint::Pretrained { architecture: "yolo11n.pt".into() }
        );
        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(request.dataset_dir.join(DATASET_MANIFEST)).unwrap()).unwrap();
        assert_eq!(manifest["project_id"], serde_json::json!(payload.project_id));
        assert!(request.output_dir.is_dir());
    }

    #[tokio::test]
    async fn missing_checkpoint_artifact_is_a_resolution_error() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = LocalInputResolver::new(Arc::new(LocalArtifactStore::new(dir.path().join("a"))));
        let payload = payload(train(CheckpointSelector::Artifact("models/gone_best.pt".into())));

        assert_matches!(
            resolver.resolve(&payload, dir.path()).await,
            Err(ResolveError::CheckpointNotFound(key)) if key == "models/gone_best.pt"
        );
    }

    #[tokio::test]
    async fn predict_resolves_stored_weights_and_catalog_models() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalArtifactStore::new(dir.path().join("a")));
        let source = dir.path().join("best.pt");
        std::fs::write(&source, b"w").unwrap();
        store.store("models/x_best.pt", &source).await.unwrap();
        let resolver = LocalInputResolver::new(store);

        let stored = resolver.resolve(&payload(predict("models/x_best.pt")), dir.path()).await.unwrap();
        assert_matches!(stored, ResolvedInputs::Predict(PredictRequest { model: ResolvedModel::Weights { .. }, .. }));

        let stock = resolver.resolve(&payload(predict("yolov8n.pt")), dir.path()).await.unwrap();
        assert_matches!(stock, ResolvedInputs::Predict(PredictRequest { model: ResolvedModel::Pretrained { .. }, .. }));

        assert_matches!(
            resolver.resolve(&payload(predict("models/nope.pt")), dir.path()).await,
            Err(ResolveError::ModelNotFound(_))
        );
    }
}
