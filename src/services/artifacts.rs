//! Local cache of model artifacts.
//!
//! Artifacts live in the bucket under `models/` and are mirrored into the
//! local model directory by file name. A file that already exists locally is
//! never fetched again.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::services::storage::StorageError;

/// Remote prefix artifacts are stored under.
pub const REMOTE_PREFIX: &str = "models";

#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Failed to download artifact {key}")]
    Download {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("Failed to write artifact {path}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub struct ArtifactStore {
    source: Arc<dyn ArtifactSource>,
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(source: Arc<dyn ArtifactSource>, root: impl Into<PathBuf>) -> Self {
        Self {
            source,
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn local_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Make sure `name` is present locally, downloading it if needed.
    pub async fn fetch(&self, name: &str) -> Result<PathBuf, ArtifactError> {
        let local = self.local_path(name);
        let write_err = |source: std::io::Error| ArtifactError::Write {
            path: local.display().to_string(),
            source,
        };

        if tokio::fs::try_exists(&local).await.map_err(write_err)? {
            tracing::debug!(artifact = %name, "Artifact already cached");
            return Ok(local);
        }

        let remote_key = format!("{}/{}", REMOTE_PREFIX, name);
        tracing::info!(artifact = %name, remote_key = %remote_key, "Downloading artifact");

        let bytes = self
            .source
            .download(&remote_key)
            .await
            .map_err(|source| ArtifactError::Download {
                key: remote_key.clone(),
                source,
            })?;

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }

        // rename into place once complete
        let partial = local.with_file_name(format!("{}.partial", name));
        tokio::fs::write(&partial, &bytes).await.map_err(write_err)?;
        tokio::fs::rename(&partial, &local).await.map_err(write_err)?;

        tracing::info!(artifact = %name, bytes = bytes.len(), "Artifact cached");
        Ok(local)
    }

    pub async fn fetch_all<'a, I>(&self, names: I) -> Result<(), ArtifactError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for name in names {
            self.fetch(name).await?;
        }
        Ok(())
    }
}
