//! Durable artifact storage.
//!
//! Keys come from [`spektra_core::artifact::artifact_key`]. An existing key
//! is never overwritten: a second store under the same key is an error.

use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use spektra_core::artifact::is_artifact_key;
use tokio::io::AsyncWriteExt;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Invalid artifact key: {0}")]
    InvalidKey(String),

    #[error("Artifact already exists: {0}")]
    AlreadyExists(String),

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Artifact I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type ArtifactResult<T> = Result<T, ArtifactError>;

#[async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
    /// Copy `source` into durable storage under `key`.
    async fn store(&self, key: &str, source: &Path) -> ArtifactResult<()>;

    /// Local path of a stored artifact. Fails when the key is unknown.
    async fn locate(&self, key: &str) -> ArtifactResult<PathBuf>;

    /// Delete a stored artifact. Missing keys are not an error.
    async fn remove(&self, key: &str) -> ArtifactResult<()>;
}

/// Artifacts as plain files under a root directory.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> ArtifactResult<PathBuf> {
        let relative = Path::new(key);
        let clean = is_artifact_key(key)
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(ArtifactError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn store(&self, key: &str, source: &Path) -> ArtifactResult<()> {
        let dest = self.path_for(key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&dest)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(ArtifactError::AlreadyExists(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let copied = async {
            let mut input = tokio::fs::File::open(source).await?;
            let bytes = tokio::io::copy(&mut input, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<_, io::Error>(bytes)
        }
        .await;

        match copied {
            Ok(bytes) => {
                tracing::info!(key, bytes, "Artifact stored");
                Ok(())
            }
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(&dest).await;
                Err(e.into())
            }
        }
    }

    async fn locate(&self, key: &str) -> ArtifactResult<PathBuf> {
        let path = self.path_for(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            Ok(_) => Err(ArtifactError::NotFound(key.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ArtifactError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, key: &str) -> ArtifactResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!(key, "Artifact removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
