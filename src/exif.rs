//! EXIF reading and stamping through the external metadata tool.
//!
//! The tool (exiftool by default) runs as a short-lived subprocess per
//! operation: serialized by the resource limiter's metadata-tool permit,
//! bounded by a timeout, and reniced to the lowest priority so it never
//! competes with capture or upload work. Stamping never fails a capture:
//! when the tool is unavailable the original bytes travel on unstamped.

use crate::config::MetadataToolConfig;
use crate::limiter::ResourceLimiter;
use crate::time::{ObservationResult, TimeConfidence, TimeSource};
use bytes::Bytes;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Fixed prefix of the bridge provenance marker.
pub const BRIDGE_MARKER_PREFIX: &str = "AviationWX-Bridge:UTC:v1";

/// EXIF timestamp format, UTC on the write path.
pub const EXIF_TIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// Parsed provenance marker carried in `UserComment`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeMarker {
    /// Where the stamped time came from.
    pub source: TimeSource,
    /// How much the stamped time can be trusted.
    pub confidence: TimeConfidence,
    /// Warning code, when the authority attached one.
    pub warn_code: Option<String>,
}

impl BridgeMarker {
    /// Marker for one observation.
    pub fn for_observation(observation: &ObservationResult) -> Self {
        Self {
            source: observation.source,
            confidence: observation.confidence,
            warn_code: observation
                .warning
                .as_ref()
                .map(|warning| warning.code.as_str().to_owned()),
        }
    }

    /// Render the `UserComment` value:
    /// `AviationWX-Bridge:UTC:v1:<source>:<confidence>[:warn:<code>]`.
    pub fn render(&self) -> String {
        match &self.warn_code {
            Some(code) => format!(
                "{BRIDGE_MARKER_PREFIX}:{}:{}:warn:{code}",
                self.source, self.confidence
            ),
            None => format!("{BRIDGE_MARKER_PREFIX}:{}:{}", self.source, self.confidence),
        }
    }

    /// Parse a `UserComment` back into a marker.
    pub fn parse(comment: &str) -> Option<Self> {
        let rest = comment.strip_prefix(BRIDGE_MARKER_PREFIX)?.strip_prefix(':')?;
        let mut parts = rest.split(':');
        let source = TimeSource::from_str_opt(parts.next()?)?;
        let confidence = TimeConfidence::from_str_opt(parts.next()?)?;
        let warn_code = match parts.next() {
            None => None,
            Some("warn") => Some(parts.next()?.to_owned()),
            Some(_) => return None,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            source,
            confidence,
            warn_code,
        })
    }
}

/// Metadata read back from a camera frame.
#[derive(Debug, Clone, Default)]
pub struct ExifMetadata {
    /// `DateTimeOriginal`, parsed as a naive wall clock reading.
    pub date_time_original: Option<NaiveDateTime>,
    /// `OffsetTimeOriginal` verbatim.
    pub offset_time_original: Option<String>,
    /// `UserComment` verbatim.
    pub user_comment: Option<String>,
    /// `GPSDateTime` verbatim; some cameras carry GPS-disciplined time here.
    pub gps_date_time: Option<String>,
}

impl ExifMetadata {
    /// Whether the frame already carries a bridge provenance marker.
    pub fn has_bridge_marker(&self) -> bool {
        self.user_comment
            .as_deref()
            .is_some_and(|comment| comment.contains("AviationWX-Bridge"))
    }
}

/// Result of a stamp attempt. `stamped` is false when the tool was missing,
/// timed out or failed; `bytes` are then the caller's original bytes.
#[derive(Debug, Clone)]
pub struct StampOutcome {
    /// Image to spool.
    pub bytes: Bytes,
    /// Whether the EXIF stamp was actually applied.
    pub stamped: bool,
}

/// Counters of tool failures, sampled for status reporting.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ExifStats {
    /// Failed metadata reads.
    pub read_failures: u64,
    /// Failed stamp attempts (original bytes were kept).
    pub stamp_failures: u64,
}

/// Wrapper around the external metadata tool binary.
#[derive(Debug)]
pub struct ExifTool {
    config: MetadataToolConfig,
    limiter: Arc<ResourceLimiter>,
    read_failures: AtomicU64,
    stamp_failures: AtomicU64,
}

impl ExifTool {
    /// Wrap the configured tool binary.
    pub fn new(config: MetadataToolConfig, limiter: Arc<ResourceLimiter>) -> Self {
        Self {
            config,
            limiter,
            read_failures: AtomicU64::new(0),
            stamp_failures: AtomicU64::new(0),
        }
    }

    /// Current failure counters.
    pub fn stats(&self) -> ExifStats {
        ExifStats {
            read_failures: self.read_failures.load(Ordering::Relaxed),
            stamp_failures: self.stamp_failures.load(Ordering::Relaxed),
        }
    }

    async fn run_tool(
        &self,
        args: &[&str],
        path: &Path,
        cancel: &CancellationToken,
    ) -> eyre::Result<Vec<u8>> {
        let _permit = self
            .limiter
            .acquire_metadata_tool(cancel)
            .await
            .map_err(|cancelled| eyre::eyre!(cancelled))?;

        let mut cmd = Command::new(&self.config.tool_path);
        let _ = cmd
            .args(args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The tool must never compete with capture/upload work for CPU.
        #[cfg(unix)]
        unsafe {
            let _ = cmd.pre_exec(|| {
                let _ = libc::nice(19);
                Ok(())
            });
        }

        let output = tokio::time::timeout(self.config.timeout(), cmd.output())
            .await
            .map_err(|_elapsed| {
                eyre::eyre!(
                    "metadata tool timed out after {:?}",
                    self.config.timeout()
                )
            })??;
        eyre::ensure!(
            output.status.success(),
            "metadata tool exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
        Ok(output.stdout)
    }

    /// Read the tags the bridge cares about from raw image bytes.
    #[tracing::instrument(skip_all)]
    pub async fn read_metadata(
        &self,
        image: &[u8],
        cancel: &CancellationToken,
    ) -> eyre::Result<ExifMetadata> {
        let scratch = tempfile::Builder::new()
            .prefix("awxb-read-")
            .suffix(".jpg")
            .tempfile()?;
        tokio::fs::write(scratch.path(), image).await?;

        let stdout = match self
            .run_tool(
                &[
                    "-json",
                    "-DateTimeOriginal",
                    "-OffsetTimeOriginal",
                    "-UserComment",
                    "-GPSDateTime",
                ],
                scratch.path(),
                cancel,
            )
            .await
        {
            Ok(stdout) => stdout,
            Err(error) => {
                let _ = self.read_failures.fetch_add(1, Ordering::Relaxed);
                return Err(error);
            }
        };

        Ok(parse_tool_json(&stdout))
    }

    /// Read just the camera's wall clock, if the frame carries one.
    pub async fn read_camera_time(
        &self,
        image: &[u8],
        cancel: &CancellationToken,
    ) -> eyre::Result<Option<NaiveDateTime>> {
        Ok(self.read_metadata(image, cancel).await?.date_time_original)
    }

    /// Stamp `DateTimeOriginal` (UTC), `OffsetTimeOriginal=+00:00` and the
    /// bridge marker onto a copy of `image`.
    ///
    /// Never fails: any tool problem is logged and counted, and the original
    /// bytes come back with `stamped = false`.
    #[tracing::instrument(skip_all)]
    pub async fn stamp(
        &self,
        image: &Bytes,
        observation: &ObservationResult,
        cancel: &CancellationToken,
    ) -> StampOutcome {
        match self.try_stamp(image, observation, cancel).await {
            Ok(bytes) => StampOutcome {
                bytes,
                stamped: true,
            },
            Err(error) => {
                let _ = self.stamp_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%error, "EXIF stamp failed; keeping the original image");
                StampOutcome {
                    bytes: image.clone(),
                    stamped: false,
                }
            }
        }
    }

    async fn try_stamp(
        &self,
        image: &Bytes,
        observation: &ObservationResult,
        cancel: &CancellationToken,
    ) -> eyre::Result<Bytes> {
        let scratch = tempfile::Builder::new()
            .prefix("awxb-stamp-")
            .suffix(".jpg")
            .tempfile()?;
        tokio::fs::write(scratch.path(), image).await?;

        let datetime = format!(
            "-DateTimeOriginal={}",
            observation.time.format(EXIF_TIME_FORMAT)
        );
        let marker = format!(
            "-UserComment={}",
            BridgeMarker::for_observation(observation).render()
        );
        let _ = self
            .run_tool(
                &[
                    "-overwrite_original",
                    &datetime,
                    "-OffsetTimeOriginal=+00:00",
                    &marker,
                ],
                scratch.path(),
                cancel,
            )
            .await?;

        let stamped = tokio::fs::read(scratch.path()).await?;
        eyre::ensure!(!stamped.is_empty(), "metadata tool produced an empty file");
        Ok(Bytes::from(stamped))
    }
}

fn parse_tool_json(stdout: &[u8]) -> ExifMetadata {
    let Ok(values) = serde_json::from_slice::<Vec<serde_json::Value>>(stdout) else {
        return ExifMetadata::default();
    };
    let Some(tags) = values.first() else {
        return ExifMetadata::default();
    };

    let text = |key: &str| {
        tags.get(key)
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
    };

    ExifMetadata {
        date_time_original: text("DateTimeOriginal")
            .as_deref()
            .and_then(parse_camera_time),
        offset_time_original: text("OffsetTimeOriginal"),
        user_comment: text("UserComment"),
        gps_date_time: text("GPSDateTime"),
    }
}

/// Parse a camera wall clock reading. Trailing subseconds or zone suffixes
/// some cameras append are ignored; only the leading `%Y:%m:%d %H:%M:%S`
/// counts.
pub fn parse_camera_time(value: &str) -> Option<NaiveDateTime> {
    let head = value.get(..19)?;
    NaiveDateTime::parse_from_str(head, EXIF_TIME_FORMAT).ok()
}
