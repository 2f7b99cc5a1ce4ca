//! Election of the trusted observation time for a frame.

use super::{ObservationResult, TimeConfidence, TimeHealth, TimeSource};
use crate::config::AuthorityConfig;
use crate::errors::TimeWarning;
use chrono::{DateTime, LocalResult, NaiveDateTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
enum CameraZone {
    Named(Tz),
    Local,
}

impl CameraZone {
    fn to_utc(self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        fn pick<Z: TimeZone>(result: LocalResult<DateTime<Z>>) -> Option<DateTime<Utc>> {
            match result {
                LocalResult::Single(instant) => Some(instant.with_timezone(&Utc)),
                // DST fold: the earlier wall clock reading wins.
                LocalResult::Ambiguous(earlier, _) => Some(earlier.with_timezone(&Utc)),
                LocalResult::None => None,
            }
        }

        match self {
            Self::Named(tz) => pick(tz.from_local_datetime(&naive)),
            Self::Local => pick(chrono::Local.from_local_datetime(&naive)),
        }
    }
}

/// Combines the bridge clock, NTP health and the camera's EXIF wall clock
/// into a single UTC observation time.
#[derive(Debug)]
pub struct TimeAuthority {
    config: AuthorityConfig,
    zone: CameraZone,
    health: Option<Arc<TimeHealth>>,
}

impl TimeAuthority {
    /// Build an authority; fails only on an unknown IANA timezone name.
    pub fn new(
        config: AuthorityConfig,
        health: Option<Arc<TimeHealth>>,
    ) -> eyre::Result<Self> {
        let zone = match config.timezone.as_deref() {
            Some(name) => CameraZone::Named(
                Tz::from_str(name)
                    .map_err(|error| eyre::eyre!("unknown camera timezone {name:?}: {error}"))?,
            ),
            None => CameraZone::Local,
        };
        Ok(Self {
            config,
            zone,
            health,
        })
    }

    /// Elect the observation time for a frame captured at `bridge_now`.
    ///
    /// `camera_time` is the camera's EXIF wall clock reading, naive, to be
    /// interpreted in the configured timezone. The result is always UTC.
    pub fn determine(
        &self,
        bridge_now: DateTime<Utc>,
        camera_time: Option<NaiveDateTime>,
    ) -> ObservationResult {
        // An unhealthy bridge clock taints everything: nothing to compare the
        // camera against, so the frame ships with low confidence.
        if let Some(health) = &self.health {
            let snapshot = health.snapshot();
            if !snapshot.healthy {
                return ObservationResult {
                    time: bridge_now,
                    source: TimeSource::BridgeClock,
                    confidence: TimeConfidence::Low,
                    warning: Some(TimeWarning::ntp_unhealthy(snapshot.offset_ms)),
                };
            }
        }

        let Some(camera_naive) = camera_time else {
            return ObservationResult::bridge(bridge_now);
        };

        let Some(camera_utc) = self.zone.to_utc(camera_naive) else {
            // The wall clock reading fell into a DST gap; nothing sane to
            // reconcile against.
            tracing::debug!(
                %camera_naive,
                "camera time does not exist in the configured timezone; using bridge clock"
            );
            return ObservationResult::bridge(bridge_now);
        };

        let drift = bridge_now.signed_duration_since(camera_utc);
        let abs_drift = drift.abs();
        let drift_seconds = drift.num_seconds();
        let direction = if drift > TimeDelta::zero() {
            "behind"
        } else {
            "ahead"
        };

        let seconds = |value: u64| TimeDelta::seconds(i64::try_from(value).unwrap_or(i64::MAX));

        if abs_drift <= seconds(self.config.camera_tolerance_seconds) {
            ObservationResult {
                time: camera_utc,
                source: TimeSource::CameraExif,
                confidence: TimeConfidence::High,
                warning: None,
            }
        } else if abs_drift <= seconds(self.config.camera_warn_drift_seconds) {
            ObservationResult {
                time: camera_utc,
                source: TimeSource::CameraExif,
                confidence: TimeConfidence::High,
                warning: Some(TimeWarning::camera_clock_drift(drift_seconds, direction)),
            }
        } else if abs_drift <= seconds(self.config.camera_reject_drift_seconds) {
            ObservationResult {
                time: bridge_now,
                source: TimeSource::BridgeClock,
                confidence: TimeConfidence::High,
                warning: Some(TimeWarning::camera_clock_rejected(drift_seconds)),
            }
        } else {
            ObservationResult {
                time: bridge_now,
                source: TimeSource::BridgeClock,
                confidence: TimeConfidence::High,
                warning: Some(TimeWarning::camera_clock_invalid(drift.num_hours())),
            }
        }
    }
}
