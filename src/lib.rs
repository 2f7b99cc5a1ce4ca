//! Edge bridge for weather cameras.
//!
//! The bridge continuously captures snapshots from IP cameras, stamps each
//! image with a trusted UTC timestamp and a provenance marker, spools it to a
//! per-camera queue on a memory-backed filesystem and uploads it to a remote
//! weather-image server with fail2ban-aware retry discipline.
//!
//! The crate is built around a small set of collaborator traits
//! ([`camera::Camera`], [`uploader::Uploader`], [`capture::ImageProcessor`],
//! [`time::NtpProbe`]) so that concrete drivers and storage backends stay
//! outside the pipeline. Three camera drivers (HTTP snapshot, ONVIF snapshot,
//! RTSP sidecar decoder) ship in [`camera`] for convenience.
//!
//! Wiring everything together is the job of [`Bridge`]:
//!
//! ```no_run
//! # async fn demo() -> eyre::Result<()> {
//! use aviationwx_bridge::{Bridge, BridgeConfig};
//!
//! let bridge = Bridge::new(BridgeConfig::default()).await?;
//! bridge.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod camera;
pub mod capture;
pub mod config;
mod errors;
pub mod exif;
pub mod limiter;
pub mod orchestrator;
pub mod queue;
pub mod time;
pub mod upload;
pub mod uploader;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::BridgeConfig;
pub use errors::{CameraError, QueueError, TimeWarning, TimeWarningCode, UploadErrorKind};
pub use orchestrator::Bridge;
