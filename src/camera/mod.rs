//! Camera drivers.
//!
//! The pipeline only knows the [`Camera`] trait; the drivers in this module
//! are the ones the original deployments actually run. All of them must
//! return fresh bytes on every call; the bridge never wants a cached frame,
//! and cache-busting is each driver's responsibility.

mod http;
mod onvif;
mod rtsp;

pub use http::{CameraAuth, HttpSnapshotCamera, HttpSnapshotConfig};
pub use onvif::{OnvifCamera, OnvifConfig};
pub use rtsp::{RtspCamera, RtspConfig, SubstreamRule};

use crate::errors::CameraError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::fmt::Debug;
use tokio_util::sync::CancellationToken;

/// Kind of camera behind a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraKind {
    /// Plain HTTP snapshot endpoint.
    HttpSnapshot,
    /// ONVIF device; snapshot URI discovered over SOAP.
    Onvif,
    /// RTSP stream decoded one still at a time by a sidecar process.
    Rtsp,
    /// Anything else, including test doubles.
    Virtual,
}

impl std::fmt::Display for CameraKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::HttpSnapshot => "http_snapshot",
            Self::Onvif => "onvif",
            Self::Rtsp => "rtsp",
            Self::Virtual => "virtual",
        };
        f.write_str(name)
    }
}

/// A source of single still frames.
#[async_trait]
pub trait Camera: Debug + Send + Sync {
    /// Capture one fresh frame. Implementations must defeat every cache
    /// between the bridge and the sensor; returning previously served bytes
    /// is a contract violation.
    async fn capture(&self, cancel: &CancellationToken) -> Result<Bytes, CameraError>;

    /// Stable camera id; also the spool directory name.
    fn id(&self) -> &str;

    /// What kind of device this is.
    fn kind(&self) -> CameraKind;
}

/// Smallest payload the drivers accept as a plausible image.
pub(crate) const MIN_SNAPSHOT_BYTES: usize = 100;
