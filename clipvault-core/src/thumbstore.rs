use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum ThumbStoreError {
    #[error("io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("upload rejected for {0}")]
    Rejected(String),
}

/// Object store for finished thumbnails: named-blob upload with overwrite
/// semantics, plus a one-shot listing of stored ids used to build the
/// processor's idempotency cache at startup.
#[async_trait]
pub trait ThumbnailStore: Send + Sync {
    async fn upload(&self, name: &str, source: &Path) -> Result<(), ThumbStoreError>;
    async fn list_ids(&self) -> Result<HashSet<String>, ThumbStoreError>;
}

/// Filesystem-backed implementation, one file per thumbnail under `root`.
#[derive(Debug, Clone)]
pub struct LocalThumbnailStore {
    root: PathBuf,
}

impl LocalThumbnailStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ThumbnailStore for LocalThumbnailStore {
    async fn upload(&self, name: &str, source: &Path) -> Result<(), ThumbStoreError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| ThumbStoreError::Io {
                source,
                path: self.root.clone(),
            })?;
        let destination = self.root.join(name);
        fs::copy(source, &destination)
            .await
            .map(|_| ())
            .map_err(|source| ThumbStoreError::Io {
                source,
                path: destination,
            })
    }

    async fn list_ids(&self) -> Result<HashSet<String>, ThumbStoreError> {
        let mut ids = HashSet::new();
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(ids),
            Err(source) => {
                return Err(ThumbStoreError::Io {
                    source,
                    path: self.root.clone(),
                })
            }
        };
        while let Some(entry) = dir.next_entry().await.map_err(|source| ThumbStoreError::Io {
            source,
            path: self.root.clone(),
        })? {
            let path = entry.path();
            let is_image = matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("png") | Some("jpg")
            );
            if !is_image {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                ids.insert(stem.to_string());
            }
        }
        Ok(ids)
    }
}
