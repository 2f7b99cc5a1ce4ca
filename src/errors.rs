use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by [`Camera`](crate::camera::Camera) implementations.
///
/// Capture errors drive per-camera backoff in the capture worker; they are
/// never fatal to it.
#[derive(Debug, Error)]
pub enum CameraError {
    /// The capture did not produce a frame within its deadline.
    #[error("camera {camera_id}: capture timed out after {duration:?}")]
    Timeout {
        /// Camera the capture was issued against.
        camera_id: String,
        /// How long we waited.
        duration: Duration,
    },

    /// The camera rejected our credentials.
    #[error("camera {camera_id}: authentication failed: {message}")]
    Auth {
        /// Camera the capture was issued against.
        camera_id: String,
        /// Device-provided detail.
        message: String,
    },

    /// Any other capture failure.
    #[error("camera {camera_id}: capture failed: {message}")]
    Capture {
        /// Camera the capture was issued against.
        camera_id: String,
        /// Human-readable description.
        message: String,
        /// Underlying error, when one exists.
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl CameraError {
    /// Shorthand for a [`CameraError::Capture`] without an underlying cause.
    pub fn capture(camera_id: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Capture {
            camera_id: camera_id.into(),
            message: message.to_string(),
            cause: None,
        }
    }

    /// The id of the camera that produced this error.
    pub fn camera_id(&self) -> &str {
        match self {
            Self::Timeout { camera_id, .. }
            | Self::Auth { camera_id, .. }
            | Self::Capture { camera_id, .. } => camera_id,
        }
    }
}

/// Errors returned by the per-camera spool queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Nothing is spooled.
    #[error("queue is empty")]
    Empty,

    /// Capture is paused while the queue drains; the image was dropped.
    #[error("capture is paused while the queue drains")]
    CapturePaused,

    /// The payload is too small to be a real image.
    #[error("image rejected: {len} bytes is below the minimum of {min}")]
    InvalidImage {
        /// Rejected payload length.
        len: usize,
        /// Minimum accepted length.
        min: usize,
    },

    /// The observation time is older than the queue allows.
    #[error("image expired: observed {age_seconds}s ago, max age is {max_age_seconds}s")]
    Expired {
        /// Age of the observation at enqueue time.
        age_seconds: i64,
        /// Configured maximum age.
        max_age_seconds: u64,
    },

    /// The observation time is ahead of the bridge clock.
    #[error("image observed {ahead_ms}ms in the future")]
    FromFuture {
        /// How far ahead of now the observation claims to be.
        ahead_ms: i64,
    },

    /// A queue with this camera id is already registered.
    #[error("queue for camera {0:?} already exists")]
    AlreadyExists(String),

    /// No queue with this camera id is registered.
    #[error("no queue for camera {0:?}")]
    NotFound(String),

    /// Spool directory I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Machine-matchable code of a non-fatal time warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeWarningCode {
    /// The NTP healthcheck currently reports the bridge clock as untrusted.
    NtpUnhealthy,
    /// The camera clock drifts from the bridge clock but is still usable.
    CameraClockDrift,
    /// The camera clock drifts too far; the bridge clock was used instead.
    CameraClockRejected,
    /// The camera clock is hours off; its time is not credible at all.
    CameraClockInvalid,
}

impl TimeWarningCode {
    /// Stable snake_case name, as embedded in the bridge marker.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NtpUnhealthy => "ntp_unhealthy",
            Self::CameraClockDrift => "camera_clock_drift",
            Self::CameraClockRejected => "camera_clock_rejected",
            Self::CameraClockInvalid => "camera_clock_invalid",
        }
    }
}

impl std::fmt::Display for TimeWarningCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-fatal warning attached to an observation by the time authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeWarning {
    /// Matchable warning code.
    pub code: TimeWarningCode,
    /// Human-readable explanation.
    pub message: String,
    /// Structured context (drift seconds, direction, ...).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl TimeWarning {
    /// The bridge clock cannot currently be trusted per the NTP healthcheck.
    pub fn ntp_unhealthy(offset_ms: Option<i64>) -> Self {
        let mut details = serde_json::Map::new();
        if let Some(offset_ms) = offset_ms {
            let _ = details.insert("offset_ms".to_owned(), offset_ms.into());
        }
        Self {
            code: TimeWarningCode::NtpUnhealthy,
            message: "bridge clock failed its NTP healthcheck".to_owned(),
            details,
        }
    }

    /// Camera clock usable but drifting.
    pub fn camera_clock_drift(drift_seconds: i64, direction: &str) -> Self {
        let mut details = serde_json::Map::new();
        let _ = details.insert("drift_seconds".to_owned(), drift_seconds.into());
        let _ = details.insert("direction".to_owned(), direction.into());
        Self {
            code: TimeWarningCode::CameraClockDrift,
            message: format!("camera clock is {drift_seconds}s {direction} of the bridge clock"),
            details,
        }
    }

    /// Camera clock drifts too far; bridge clock used.
    pub fn camera_clock_rejected(drift_seconds: i64) -> Self {
        let mut details = serde_json::Map::new();
        let _ = details.insert("drift_seconds".to_owned(), drift_seconds.into());
        Self {
            code: TimeWarningCode::CameraClockRejected,
            message: format!("camera clock rejected: {drift_seconds}s from the bridge clock"),
            details,
        }
    }

    /// Camera clock hours off; not credible.
    pub fn camera_clock_invalid(drift_hours: i64) -> Self {
        let mut details = serde_json::Map::new();
        let _ = details.insert("drift_hours".to_owned(), drift_hours.into());
        Self {
            code: TimeWarningCode::CameraClockInvalid,
            message: format!("camera clock invalid: about {drift_hours}h from the bridge clock"),
            details,
        }
    }
}

impl std::fmt::Display for TimeWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Substrings that mark an upload error as a credential failure.
///
/// Matched case-insensitively against the uploader's error string. Auth
/// failures bypass the retry and impose the long auth backoff so the remote
/// side never sees a burst of bad logins.
const AUTH_ERROR_MARKERS: &[&str] = &[
    "auth",
    "401",
    "403",
    "login",
    "credential",
    "permission",
    "access denied",
];

/// Coarse classification of an upload failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadErrorKind {
    /// Credential failure; never retried.
    Auth,
    /// The attempt exceeded its size-aware deadline.
    Timeout,
    /// Anything retryable.
    Transient,
    /// The upload task panicked; surfaced as a failure result.
    Panic,
}

impl UploadErrorKind {
    /// Classify an uploader error string.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if AUTH_ERROR_MARKERS
            .iter()
            .any(|marker| lower.contains(marker))
        {
            Self::Auth
        } else if lower.contains("timed out") || lower.contains("timeout") {
            Self::Timeout
        } else {
            Self::Transient
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_classification_is_case_insensitive() {
        for message in [
            "401 Unauthorized",
            "server says: LOGIN failed",
            "Access Denied by policy",
            "bad credentials",
            "insufficient PERMISSION",
        ] {
            assert_eq!(
                UploadErrorKind::classify(message),
                UploadErrorKind::Auth,
                "{message:?} should classify as auth"
            );
        }
    }

    #[test]
    fn non_auth_errors_stay_transient_or_timeout() {
        assert_eq!(
            UploadErrorKind::classify("connection reset by peer"),
            UploadErrorKind::Transient
        );
        assert_eq!(
            UploadErrorKind::classify("upload timed out after 90s"),
            UploadErrorKind::Timeout
        );
    }

    #[test]
    fn warning_codes_are_snake_case() {
        assert_eq!(TimeWarningCode::NtpUnhealthy.as_str(), "ntp_unhealthy");
        assert_eq!(
            TimeWarningCode::CameraClockRejected.to_string(),
            "camera_clock_rejected"
        );
    }
}
