use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("download failed: {0}")]
    Download(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("probe failed for {path}: {reason}")]
    Probe { path: PathBuf, reason: String },
    #[error("thumbnail extraction failed for {path}: {reason}")]
    Extract { path: PathBuf, reason: String },
    #[error("external tool timed out after {0:?}")]
    ToolTimeout(Duration),
    #[error("thumbnail store error: {0}")]
    ThumbStore(#[from] crate::thumbstore::ThumbStoreError),
    #[error("archive error: {0}")]
    Archive(#[from] crate::archive::ArchiveError),
}

impl From<reqwest::Error> for ProcessorError {
    fn from(error: reqwest::Error) -> Self {
        ProcessorError::Network(error.to_string())
    }
}

pub type ProcessorResult<T> = Result<T, ProcessorError>;
