//! Object storage for archived aggregates

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Archive I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Write (or replace) the object at `key`
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<(), ArchiveError>;
}

/// Objects as files under a root directory; keys map to relative paths
pub struct FsArchiveStore {
    root: PathBuf,
}

impl FsArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ArchiveError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(ArchiveError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ArchiveStore for FsArchiveStore {
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<(), ArchiveError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write then rename so readers never see a partial object
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(key, bytes = body.len(), "Archived object");
        Ok(())
    }
}
