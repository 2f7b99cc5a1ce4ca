//! RTSP camera decoded one still at a time by a sidecar process.
//!
//! The bridge keeps no decoder state: each capture spawns the decoder, takes
//! exactly one frame from the stream and lets the process exit. On the small
//! boards this runs on, holding an H.264 decode pipeline open between
//! captures would dwarf the rest of the bridge's memory budget.

use super::{Camera, CameraKind, MIN_SNAPSHOT_BYTES};
use crate::errors::CameraError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// One best-effort main→substream URL rewrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubstreamRule {
    /// Substring that identifies the main stream in the URL.
    pub pattern: String,
    /// Replacement selecting the substream.
    pub replacement: String,
}

impl SubstreamRule {
    /// Build a rule.
    pub fn new(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            replacement: replacement.into(),
        }
    }

    fn apply(&self, url: &str) -> Option<String> {
        url.contains(&self.pattern)
            .then(|| url.replacen(&self.pattern, &self.replacement, 1))
    }
}

/// Rules covering the common vendor URL shapes. First match wins.
pub fn default_substream_rules() -> Vec<SubstreamRule> {
    vec![
        // Hikvision and clones.
        SubstreamRule::new("/Streaming/Channels/101", "/Streaming/Channels/102"),
        // Dahua and clones.
        SubstreamRule::new("subtype=0", "subtype=1"),
        // TP-Link / Tapo style.
        SubstreamRule::new("/stream1", "/stream2"),
    ]
}

/// RTSP camera configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtspConfig {
    /// Camera id; also the spool directory name.
    pub id: String,
    /// RTSP URL of the stream, credentials included if the camera wants any.
    pub url: String,
    /// Prefer the lower-resolution substream when a rule matches the URL.
    #[serde(default = "default_true")]
    pub use_substream: bool,
    /// Rewrite rules tried in order; only the first match applies.
    #[serde(default = "default_substream_rules")]
    pub substream_rules: Vec<SubstreamRule>,
    /// Decoder binary; anything that can write one JPEG to stdout works.
    #[serde(default = "default_decoder_program")]
    pub decoder_program: PathBuf,
    /// Per-capture timeout in seconds.
    #[serde(default = "default_capture_timeout_seconds")]
    pub capture_timeout_seconds: u64,
}

fn default_true() -> bool {
    true
}

fn default_decoder_program() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_capture_timeout_seconds() -> u64 {
    30
}

/// Camera that captures stills through an external RTSP decoder.
#[derive(Debug)]
pub struct RtspCamera {
    config: RtspConfig,
    effective_url: String,
}

impl RtspCamera {
    /// Wrap an RTSP stream; the substream rewrite is resolved once here.
    pub fn new(config: RtspConfig) -> Self {
        let effective_url = if config.use_substream {
            config
                .substream_rules
                .iter()
                .find_map(|rule| rule.apply(&config.url))
                .unwrap_or_else(|| config.url.clone())
        } else {
            config.url.clone()
        };
        if effective_url != config.url {
            tracing::info!(
                camera = %config.id,
                url = %effective_url,
                "using the camera substream"
            );
        }
        Self {
            config,
            effective_url,
        }
    }

    /// The URL actually handed to the decoder.
    pub fn effective_url(&self) -> &str {
        &self.effective_url
    }
}

#[async_trait]
impl Camera for RtspCamera {
    #[tracing::instrument(skip_all, fields(camera = %self.config.id))]
    async fn capture(&self, cancel: &CancellationToken) -> Result<Bytes, CameraError> {
        let timeout = Duration::from_secs(self.config.capture_timeout_seconds);
        let mut cmd = Command::new(&self.config.decoder_program);
        let _ = cmd
            .args([
                "-rtsp_transport",
                "tcp",
                "-i",
                &self.effective_url,
                "-frames:v",
                "1",
                "-f",
                "image2pipe",
                "-vcodec",
                "mjpeg",
                "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::select! {
            output = tokio::time::timeout(timeout, cmd.output()) => match output {
                Ok(output) => output,
                Err(_elapsed) => {
                    return Err(CameraError::Timeout {
                        camera_id: self.config.id.clone(),
                        duration: timeout,
                    });
                }
            },
            () = cancel.cancelled() => {
                return Err(CameraError::capture(self.config.id.as_str(), "capture cancelled"));
            }
        };

        let output = output.map_err(|error| CameraError::Capture {
            camera_id: self.config.id.clone(),
            message: format!(
                "failed to run the decoder {:?}",
                self.config.decoder_program
            ),
            cause: Some(Box::new(error)),
        })?;

        if !output.status.success() {
            return Err(CameraError::capture(
                self.config.id.as_str(),
                format!(
                    "decoder exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                        .lines()
                        .last()
                        .unwrap_or_default()
                ),
            ));
        }
        if output.stdout.len() < MIN_SNAPSHOT_BYTES {
            return Err(CameraError::capture(
                self.config.id.as_str(),
                format!("decoder produced {} bytes", output.stdout.len()),
            ));
        }
        Ok(Bytes::from(output.stdout))
    }

    fn id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> CameraKind {
        CameraKind::Rtsp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str, use_substream: bool) -> RtspConfig {
        RtspConfig {
            id: "cam1".to_owned(),
            url: url.to_owned(),
            use_substream,
            substream_rules: default_substream_rules(),
            decoder_program: default_decoder_program(),
            capture_timeout_seconds: 30,
        }
    }

    #[test]
    fn hikvision_urls_rewrite_to_the_substream() {
        let camera = RtspCamera::new(config(
            "rtsp://user:pw@cam.local:554/Streaming/Channels/101",
            true,
        ));
        assert_eq!(
            camera.effective_url(),
            "rtsp://user:pw@cam.local:554/Streaming/Channels/102"
        );
    }

    #[test]
    fn dahua_urls_rewrite_to_the_substream() {
        let camera = RtspCamera::new(config(
            "rtsp://cam.local/cam/realmonitor?channel=1&subtype=0",
            true,
        ));
        assert_eq!(
            camera.effective_url(),
            "rtsp://cam.local/cam/realmonitor?channel=1&subtype=1"
        );
    }

    #[test]
    fn unknown_urls_pass_through_unchanged() {
        let url = "rtsp://cam.local/some/custom/path";
        assert_eq!(RtspCamera::new(config(url, true)).effective_url(), url);
    }

    #[test]
    fn rewrite_can_be_disabled() {
        let url = "rtsp://cam.local/Streaming/Channels/101";
        assert_eq!(RtspCamera::new(config(url, false)).effective_url(), url);
    }
}
