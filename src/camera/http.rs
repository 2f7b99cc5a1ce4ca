//! Plain HTTP snapshot camera.

use super::{Camera, CameraKind, MIN_SNAPSHOT_BYTES};
use crate::errors::CameraError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub(crate) static HTTP: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .user_agent("aviationwx-bridge")
        .build()
        .expect("failed to create the shared HTTP client")
});

/// How a snapshot endpoint authenticates the bridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CameraAuth {
    /// Open endpoint.
    #[default]
    None,
    /// HTTP basic auth.
    Basic {
        /// Account name.
        username: String,
        /// Account password.
        password: String,
    },
    /// Digest-configured cameras; sent as basic. Most such firmwares accept
    /// basic on the snapshot path, and a proper digest transaction would
    /// need a second round trip per frame.
    Digest {
        /// Account name.
        username: String,
        /// Account password.
        password: String,
    },
    /// Static bearer token.
    Bearer {
        /// Token value.
        token: String,
    },
}

impl CameraAuth {
    pub(crate) fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Self::None => request,
            Self::Basic { username, password } | Self::Digest { username, password } => {
                request.basic_auth(username, Some(password))
            }
            Self::Bearer { token } => request.bearer_auth(token),
        }
    }
}

/// Snapshot endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSnapshotConfig {
    /// Camera id; also the spool directory name.
    pub id: String,
    /// Snapshot URL, e.g. `http://cam.local/snapshot.jpg`.
    pub url: String,
    /// Authentication mode.
    #[serde(default)]
    pub auth: CameraAuth,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

fn default_request_timeout_seconds() -> u64 {
    30
}

/// Append the cache-busting `t=<unix_ms>` query parameter.
pub(crate) fn cache_busted(url: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}t={}", Utc::now().timestamp_millis())
}

/// GET one snapshot with the full anti-cache discipline applied.
pub(crate) async fn fetch_snapshot(
    camera_id: &str,
    url: &str,
    auth: &CameraAuth,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Bytes, CameraError> {
    let request = auth
        .apply(HTTP.get(cache_busted(url)))
        .header(
            reqwest::header::CACHE_CONTROL,
            "no-cache, no-store, must-revalidate",
        )
        .header(reqwest::header::PRAGMA, "no-cache")
        .header(reqwest::header::EXPIRES, "0")
        .timeout(timeout);

    let response = tokio::select! {
        response = request.send() => response,
        () = cancel.cancelled() => {
            return Err(CameraError::capture(camera_id, "capture cancelled"));
        }
    };

    let response = match response {
        Ok(response) => response,
        Err(error) if error.is_timeout() => {
            return Err(CameraError::Timeout {
                camera_id: camera_id.to_owned(),
                duration: timeout,
            });
        }
        Err(error) => {
            return Err(CameraError::Capture {
                camera_id: camera_id.to_owned(),
                message: "snapshot request failed".to_owned(),
                cause: Some(Box::new(error)),
            });
        }
    };

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(CameraError::Auth {
            camera_id: camera_id.to_owned(),
            message: format!("snapshot endpoint returned {status}"),
        });
    }
    if !status.is_success() {
        return Err(CameraError::capture(
            camera_id,
            format!("snapshot endpoint returned {status}"),
        ));
    }

    let bytes = response.bytes().await.map_err(|error| CameraError::Capture {
        camera_id: camera_id.to_owned(),
        message: "snapshot body read failed".to_owned(),
        cause: Some(Box::new(error)),
    })?;
    if bytes.len() < MIN_SNAPSHOT_BYTES {
        return Err(CameraError::capture(
            camera_id,
            format!("implausibly small snapshot ({} bytes)", bytes.len()),
        ));
    }
    Ok(bytes)
}

/// Camera exposing a single HTTP snapshot URL.
#[derive(Debug)]
pub struct HttpSnapshotCamera {
    config: HttpSnapshotConfig,
}

impl HttpSnapshotCamera {
    /// Wrap a snapshot endpoint.
    pub fn new(config: HttpSnapshotConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Camera for HttpSnapshotCamera {
    #[tracing::instrument(skip_all, fields(camera = %self.config.id))]
    async fn capture(&self, cancel: &CancellationToken) -> Result<Bytes, CameraError> {
        fetch_snapshot(
            &self.config.id,
            &self.config.url,
            &self.config.auth,
            Duration::from_secs(self.config.request_timeout_seconds),
            cancel,
        )
        .await
    }

    fn id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> CameraKind {
        CameraKind::HttpSnapshot
    }
}
