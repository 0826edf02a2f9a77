use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("invalid repository: {0}")]
    InvalidRepository(String),

    #[error("invalid plugin: {0}")]
    InvalidPlugin(String),

    #[error("checksum mismatch for {file} (got {actual}, want {expected})")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("download failed: {0}")]
    DownloadFailure(String),

    #[error("extraction failed: {0}")]
    ExtractionFailure(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("{0}")]
    Msg(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Net(#[from] reqwest::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Flat classification of [`StoreError`], cheap to copy into status results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidManifest,
    InvalidRepository,
    InvalidPlugin,
    ChecksumMismatch,
    DownloadFailure,
    ExtractionFailure,
    PermissionDenied,
    Io,
    Other,
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::InvalidManifest(_) => ErrorKind::InvalidManifest,
            StoreError::InvalidRepository(_) => ErrorKind::InvalidRepository,
            StoreError::InvalidPlugin(_) => ErrorKind::InvalidPlugin,
            StoreError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            StoreError::DownloadFailure(_) | StoreError::Net(_) => ErrorKind::DownloadFailure,
            StoreError::ExtractionFailure(_) | StoreError::Zip(_) => ErrorKind::ExtractionFailure,
            StoreError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            StoreError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorKind::PermissionDenied
            }
            StoreError::Io(_) => ErrorKind::Io,
            StoreError::Msg(_) | StoreError::Serde(_) => ErrorKind::Other,
        }
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(e: anyhow::Error) -> Self {
        StoreError::Msg(format!("{e:#}"))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_errors_map_onto_taxonomy() {
        let zip = StoreError::from(zip::result::ZipError::FileNotFound);
        assert_eq!(zip.kind(), ErrorKind::ExtractionFailure);

        let denied = StoreError::from(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert_eq!(denied.kind(), ErrorKind::PermissionDenied);

        let missing = StoreError::from(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(missing.kind(), ErrorKind::Io);
    }

    #[test]
    fn anyhow_context_is_kept_in_message() {
        let err = anyhow::anyhow!("disk full").context("write repositories.json");
        let store: StoreError = err.into();
        assert_eq!(store.to_string(), "write repositories.json: disk full");
    }
}
