//! Job request and parameter types.
//!
//! A job is a shared envelope (id, channel, task handle) plus a
//! type-specific payload. The payload is the tagged union
//! [`JobParameters`]: it is what the submitter stores on the job row and
//! what the worker receives inside the task message.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::artifact::is_artifact_key;
use crate::catalog::{find_architecture, DEFAULT_ARCHITECTURE};
use crate::error::CoreError;
use crate::types::ProjectId;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_EPOCHS: u32 = 20;
pub const DEFAULT_BATCH: u32 = 8;
pub const DEFAULT_IMAGE_SIZE: u32 = 640;

/// Number of unlabeled images a predict job processes when no explicit
/// image set is given.
pub const DEFAULT_PREDICT_LIMIT: u32 = 50;

/// Upper bound on unlabeled images per predict job.
pub const MAX_PREDICT_LIMIT: u32 = 10_000;

/// Model source value that resolves to the project's newest trained model.
pub const MODEL_SOURCE_LATEST: &str = "latest";

// ---------------------------------------------------------------------------
// JobType
// ---------------------------------------------------------------------------

/// The kind of work a job performs. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Train,
    Predict,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Predict => "predict",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Self::Train),
            "predict" => Ok(Self::Predict),
            other => Err(CoreError::Validation(format!(
                "Unsupported job_type: {other} (expected train or predict)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Hyperparameters
// ---------------------------------------------------------------------------

/// Training hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Hyperparams {
    #[serde(default = "default_epochs")]
    #[validate(range(min = 1, max = 1000))]
    pub epochs: u32,

    #[serde(default = "default_batch")]
    #[validate(range(min = 1, max = 512))]
    pub batch: u32,

    #[serde(default = "default_image_size", alias = "imgsz")]
    #[validate(range(min = 32, max = 4096))]
    pub image_size: u32,
}

fn default_epochs() -> u32 {
    DEFAULT_EPOCHS
}

fn default_batch() -> u32 {
    DEFAULT_BATCH
}

fn default_image_size() -> u32 {
    DEFAULT_IMAGE_SIZE
}

impl Default for Hyperparams {
    fn default() -> Self {
        Self {
            epochs: DEFAULT_EPOCHS,
            batch: DEFAULT_BATCH,
            image_size: DEFAULT_IMAGE_SIZE,
        }
    }
}

// ---------------------------------------------------------------------------
// Selectors
// ---------------------------------------------------------------------------

/// Where training starts from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CheckpointSelector {
    /// Pretrained COCO weights for the chosen architecture.
    #[default]
    Coco,
    /// Random initialization.
    Scratch,
    /// Weights produced by an earlier training job.
    Artifact(String),
}

impl TryFrom<String> for CheckpointSelector {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "coco" => Ok(Self::Coco),
            "scratch" => Ok(Self::Scratch),
            key if is_artifact_key(key) => Ok(Self::Artifact(value)),
            other => Err(CoreError::Validation(format!(
                "Unsupported checkpoint: {other} (expected coco, scratch or a models/ artifact key)"
            ))),
        }
    }
}

impl From<CheckpointSelector> for String {
    fn from(value: CheckpointSelector) -> Self {
        match value {
            CheckpointSelector::Coco => "coco".to_string(),
            CheckpointSelector::Scratch => "scratch".to_string(),
            CheckpointSelector::Artifact(key) => key,
        }
    }
}

/// Which model a predict job runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// The most recent completed training job's artifact for the project.
    Latest,
    /// An explicit trained-model artifact key.
    Artifact(String),
    /// Stock pretrained weights from the catalog.
    Pretrained(String),
}

impl FromStr for ModelSource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == MODEL_SOURCE_LATEST {
            Ok(Self::Latest)
        } else if is_artifact_key(s) {
            Ok(Self::Artifact(s.to_string()))
        } else if find_architecture(s).is_some() {
            Ok(Self::Pretrained(s.to_string()))
        } else {
            Err(CoreError::Validation(format!(
                "Unsupported model_path: {s} (expected latest, a models/ artifact key or a catalog architecture)"
            )))
        }
    }
}

/// Which images a predict job runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PredictTarget {
    /// An explicit set of images.
    Images { image_ids: Vec<Uuid> },
    /// Up to `limit` images of the project that have no annotations yet.
    Unlabeled { limit: u32 },
}

// ---------------------------------------------------------------------------
// Resolved parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainParams {
    pub model_architecture: String,
    pub hyperparams: Hyperparams,
    pub checkpoint: CheckpointSelector,
    pub dataset_version_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictParams {
    /// Resolved model reference: an artifact key or a catalog architecture.
    pub model_path: String,
    pub target: PredictTarget,
    /// Predictions are stored as reviewable suggestions.
    #[serde(default)]
    pub auto_annotate: bool,
}

/// Type-specific job payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "lowercase")]
pub enum JobParameters {
    Train(TrainParams),
    Predict(PredictParams),
}

impl JobParameters {
    pub fn job_type(&self) -> JobType {
        match self {
            Self::Train(_) => JobType::Train,
            Self::Predict(_) => JobType::Predict,
        }
    }

    /// Total number of major iterations, when known up front.
    pub fn total_epochs(&self) -> u32 {
        match self {
            Self::Train(p) => p.hyperparams.epochs,
            Self::Predict(_) => 0,
        }
    }
}

impl TrainParams {
    /// Build training parameters, rejecting architectures outside the catalog.
    pub fn new(
        model_architecture: impl Into<String>,
        hyperparams: Hyperparams,
        checkpoint: CheckpointSelector,
        dataset_version_id: Option<Uuid>,
    ) -> Result<Self, CoreError> {
        let model_architecture = model_architecture.into();
        if find_architecture(&model_architecture).is_none() {
            return Err(CoreError::Validation(format!(
                "Unsupported model_arch: {model_architecture}"
            )));
        }
        hyperparams
            .validate()
            .map_err(|e| CoreError::Validation(format!("Invalid hyperparams: {e}")))?;
        Ok(Self {
            model_architecture,
            hyperparams,
            checkpoint,
            dataset_version_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Request DTO
// ---------------------------------------------------------------------------

/// Body of `POST /api/v1/jobs`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateJobRequest {
    pub project_id: ProjectId,
    #[serde(default = "default_job_type")]
    pub job_type: JobType,
    pub model_arch: Option<String>,
    #[serde(default)]
    pub hyperparams: Hyperparams,
    pub checkpoint: Option<String>,
    pub model_path: Option<String>,
    pub image_ids: Option<Vec<Uuid>>,
    pub limit: Option<u32>,
    #[serde(default)]
    pub auto_annotate: bool,
    pub dataset_version_id: Option<Uuid>,
}

fn default_job_type() -> JobType {
    JobType::Train
}

/// A request that passed the checks that need no stored state.
///
/// The submitter still has to resolve `latest` model sources and inherit
/// the architecture of a prior-artifact checkpoint before it has final
/// [`JobParameters`].
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedJobRequest {
    Train {
        project_id: ProjectId,
        model_arch: String,
        hyperparams: Hyperparams,
        checkpoint: CheckpointSelector,
        dataset_version_id: Option<Uuid>,
    },
    Predict {
        project_id: ProjectId,
        source: ModelSource,
        target: PredictTarget,
        auto_annotate: bool,
    },
}

impl CreateJobRequest {
    /// Validate the parts of the request that do not depend on stored jobs.
    pub fn parse(self) -> Result<ParsedJobRequest, CoreError> {
        match self.job_type {
            JobType::Train => {
                self.hyperparams
                    .validate()
                    .map_err(|e| CoreError::Validation(format!("Invalid hyperparams: {e}")))?;
                let checkpoint = match self.checkpoint {
                    Some(raw) => CheckpointSelector::try_from(raw)?,
                    None => CheckpointSelector::default(),
                };
                Ok(ParsedJobRequest::Train {
                    project_id: self.project_id,
                    model_arch: self
                        .model_arch
                        .unwrap_or_else(|| DEFAULT_ARCHITECTURE.to_string()),
                    hyperparams: self.hyperparams,
                    checkpoint,
                    dataset_version_id: self.dataset_version_id,
                })
            }
            JobType::Predict => {
                let source: ModelSource = self
                    .model_path
                    .as_deref()
                    .ok_or_else(|| {
                        CoreError::Validation("model_path required for predict jobs".into())
                    })?
                    .parse()?;
                let target = predict_target(self.image_ids, self.limit)?;
                Ok(ParsedJobRequest::Predict {
                    project_id: self.project_id,
                    source,
                    target,
                    auto_annotate: self.auto_annotate,
                })
            }
        }
    }
}

/// Choose between an explicit image set and an unlabeled-image limit.
pub fn predict_target(
    image_ids: Option<Vec<Uuid>>,
    limit: Option<u32>,
) -> Result<PredictTarget, CoreError> {
    match image_ids {
        Some(ids) if !ids.is_empty() => {
            if limit.is_some() {
                return Err(CoreError::Validation(
                    "Specify either image_ids or limit, not both".into(),
                ));
            }
            Ok(PredictTarget::Images { image_ids: ids })
        }
        Some(_) => Err(CoreError::Validation("image_ids must not be empty".into())),
        None => {
            let limit = limit.unwrap_or(DEFAULT_PREDICT_LIMIT);
            if limit == 0 || limit > MAX_PREDICT_LIMIT {
                return Err(CoreError::Validation(format!(
                    "limit must be between 1 and {MAX_PREDICT_LIMIT}"
                )));
            }
            Ok(PredictTarget::Unlabeled { limit })
        }
    }
}
