//! Remote storage seam.

use crate::errors::UploadErrorKind;
use async_trait::async_trait;
use std::fmt::Debug;
use thiserror::Error;

/// Failure reported by an [`Uploader`].
///
/// Uploaders speak in error strings; the bridge classifies them by substring
/// (see [`UploadErrorKind::classify`]) because that is all remote protocols
/// reliably give us.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct UploadError {
    /// The uploader's description of what went wrong.
    pub message: String,
}

impl UploadError {
    /// Wrap an error string.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Classify this failure for retry/backoff purposes.
    pub fn kind(&self) -> UploadErrorKind {
        UploadErrorKind::classify(&self.message)
    }
}

/// Ships stamped images to the remote weather-image server.
#[async_trait]
pub trait Uploader: Debug + Send + Sync {
    /// Store `bytes` under `remote_path`. The path is relative to whatever
    /// root the uploader was configured with.
    async fn upload(&self, remote_path: &str, bytes: &[u8]) -> Result<(), UploadError>;

    /// Cheap reachability/credential check.
    async fn test_connection(&self) -> Result<(), UploadError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_error_classifies_through_kind() {
        assert_eq!(
            UploadError::new("401 Unauthorized").kind(),
            UploadErrorKind::Auth
        );
        assert_eq!(
            UploadError::new("connection refused").kind(),
            UploadErrorKind::Transient
        );
    }
}
