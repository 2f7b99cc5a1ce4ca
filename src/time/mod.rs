//! Trusted observation time.
//!
//! The [`TimeAuthority`] combines the bridge clock, the optional NTP
//! healthcheck and the camera's own EXIF wall clock into a single
//! [`ObservationResult`]: the UTC instant a frame is considered "taken",
//! together with where that instant came from and how much it can be trusted.

mod authority;
mod health;

pub use authority::TimeAuthority;
pub use health::{NtpProbe, TimeHealth, TimeHealthSnapshot};

use crate::errors::TimeWarning;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where an observation time came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSource {
    /// The camera's own EXIF wall clock, converted to UTC.
    CameraExif,
    /// The bridge's system clock.
    BridgeClock,
}

impl TimeSource {
    /// Stable snake_case name, as embedded in the bridge marker.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CameraExif => "camera_exif",
            Self::BridgeClock => "bridge_clock",
        }
    }

    /// Inverse of [`as_str`](Self::as_str), for marker parsing.
    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "camera_exif" => Some(Self::CameraExif),
            "bridge_clock" => Some(Self::BridgeClock),
            _ => None,
        }
    }
}

impl std::fmt::Display for TimeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much an observation time can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeConfidence {
    /// Clock agreement or a healthy bridge clock.
    High,
    /// Provenance could not be re-established (e.g. after a spool rescan).
    Medium,
    /// The bridge clock itself failed its healthcheck.
    Low,
}

impl TimeConfidence {
    /// Stable snake_case name, as embedded in the bridge marker.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    /// Inverse of [`as_str`](Self::as_str), for marker parsing.
    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

impl std::fmt::Display for TimeConfidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authority's verdict for one captured frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationResult {
    /// The instant the frame is considered taken. Always UTC.
    pub time: DateTime<Utc>,
    /// Where the instant came from.
    pub source: TimeSource,
    /// How much it can be trusted.
    pub confidence: TimeConfidence,
    /// Non-fatal diagnosis, when clocks disagreed.
    pub warning: Option<TimeWarning>,
}

impl ObservationResult {
    /// A plain bridge-clock observation with no reservations.
    pub fn bridge(time: DateTime<Utc>) -> Self {
        Self {
            time,
            source: TimeSource::BridgeClock,
            confidence: TimeConfidence::High,
            warning: None,
        }
    }
}
