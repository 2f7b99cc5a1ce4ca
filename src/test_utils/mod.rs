//! Test doubles for the bridge's collaborator seams.

#[cfg(feature = "test-utils")]
mod logging_env;

use crate::camera::{Camera, CameraKind};
use crate::errors::CameraError;
use crate::time::NtpProbe;
use crate::uploader::{UploadError, Uploader};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::TimeDelta;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Scriptable camera. By default every capture succeeds with a unique
/// payload, honoring the fresh-bytes contract real drivers must obey.
#[derive(Debug)]
pub struct MockCamera {
    id: String,
    capture_delay: Option<Duration>,
    fail_always: bool,
    captures: AtomicUsize,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl MockCamera {
    /// A camera that always succeeds instantly.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capture_delay: None,
            fail_always: false,
            captures: AtomicUsize::new(0),
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        }
    }

    /// Make every capture take `delay` before returning.
    pub fn with_capture_delay(mut self, delay: Duration) -> Self {
        self.capture_delay = Some(delay);
        self
    }

    /// Make every capture fail.
    pub fn always_failing(mut self) -> Self {
        self.fail_always = true;
        self
    }

    /// How many captures completed (successfully or not).
    pub fn capture_count(&self) -> usize {
        self.captures.load(Ordering::Acquire)
    }

    /// Highest number of captures ever in flight at once.
    pub fn max_concurrent_captures(&self) -> usize {
        self.max_concurrent.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Camera for MockCamera {
    async fn capture(&self, _cancel: &CancellationToken) -> Result<Bytes, CameraError> {
        let in_flight = self.concurrent.fetch_add(1, Ordering::AcqRel) + 1;
        let _ = self.max_concurrent.fetch_max(in_flight, Ordering::AcqRel);
        if let Some(delay) = self.capture_delay {
            tokio::time::sleep(delay).await;
        }
        let sequence = self.captures.fetch_add(1, Ordering::AcqRel) + 1;
        let _ = self.concurrent.fetch_sub(1, Ordering::AcqRel);

        if self.fail_always {
            return Err(CameraError::capture(&self.id, "scripted capture failure"));
        }
        // Unique payload per capture, comfortably over the minimum size.
        let mut payload = format!("frame {sequence} from {}", self.id).into_bytes();
        payload.resize(2048, 0xFF);
        Ok(Bytes::from(payload))
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> CameraKind {
        CameraKind::Virtual
    }
}

/// One recorded upload attempt.
#[derive(Debug, Clone)]
pub struct UploadCall {
    /// Remote path the worker built.
    pub remote_path: String,
    /// Payload size.
    pub size_bytes: usize,
    /// When the attempt started, on the tokio clock (so paused-time tests
    /// can assert on pacing).
    pub at: tokio::time::Instant,
}

/// Scriptable uploader. Outcomes are consumed front-to-back; once the script
/// runs dry every upload succeeds.
#[derive(Debug, Default)]
pub struct MockUploader {
    script: std::sync::Mutex<VecDeque<Result<(), UploadError>>>,
    calls: std::sync::Mutex<Vec<UploadCall>>,
}

impl MockUploader {
    /// An uploader that always succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue scripted outcomes for the next uploads.
    pub fn scripted(
        self,
        outcomes: impl IntoIterator<Item = Result<(), UploadError>>,
    ) -> Self {
        self.script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extend(outcomes);
        self
    }

    /// All recorded attempts, in order.
    pub fn calls(&self) -> Vec<UploadCall> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Uploader for MockUploader {
    async fn upload(&self, remote_path: &str, bytes: &[u8]) -> Result<(), UploadError> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(UploadCall {
                remote_path: remote_path.to_owned(),
                size_bytes: bytes.len(),
                at: tokio::time::Instant::now(),
            });
        self.script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn test_connection(&self) -> Result<(), UploadError> {
        Ok(())
    }
}

/// NTP probe returning a fixed offset, or failing outright.
#[derive(Debug, Clone, Copy)]
pub struct FixedNtpProbe {
    offset_ms: i64,
    fail: bool,
}

impl FixedNtpProbe {
    /// A probe that always reports `offset_ms`.
    pub fn with_offset_ms(offset_ms: i64) -> Self {
        Self {
            offset_ms,
            fail: false,
        }
    }

    /// A probe that never reaches any server.
    pub fn failing() -> Self {
        Self {
            offset_ms: 0,
            fail: true,
        }
    }
}

#[async_trait]
impl NtpProbe for FixedNtpProbe {
    async fn offset(&self, server: &str, _timeout: Duration) -> eyre::Result<TimeDelta> {
        eyre::ensure!(!self.fail, "scripted probe failure against {server}");
        Ok(TimeDelta::milliseconds(self.offset_ms))
    }
}
