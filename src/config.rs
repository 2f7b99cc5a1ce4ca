//! Configuration surface of the bridge.
//!
//! Every struct here deserializes with `serde` and fills unspecified fields
//! with the documented defaults, so a partial JSON/TOML fragment is enough to
//! stand up a bridge. Loading the fragments from files or flags is the
//! caller's job.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Minimum accepted capture interval.
pub const MIN_CAPTURE_INTERVAL: Duration = Duration::from_secs(1);
/// Maximum accepted capture interval.
pub const MAX_CAPTURE_INTERVAL: Duration = Duration::from_secs(1800);

/// Bounds and behavior of a single per-camera spool queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of spooled images.
    pub max_files: usize,
    /// Maximum total spool size in MiB.
    pub max_size_mb: u64,
    /// Images older than this are expired.
    pub max_age_seconds: u64,
    /// Whether health-driven thinning runs at all.
    pub thinning_enabled: bool,
    /// Newest images protected from thinning.
    pub protect_newest: usize,
    /// Oldest images protected from thinning.
    pub protect_oldest: usize,
    /// Capacity fraction at which the queue is merely catching up.
    pub threshold_catching_up: f64,
    /// Capacity fraction at which the queue is degraded.
    pub threshold_degraded: f64,
    /// Capacity fraction at which the queue is critical.
    pub threshold_critical: f64,
    /// Pause the capture worker when the queue goes critical.
    pub pause_capture_on_critical: bool,
    /// Capacity fraction at or below which a paused capture resumes.
    pub resume_threshold: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_files: 100,
            max_size_mb: 50,
            max_age_seconds: 3600,
            thinning_enabled: true,
            protect_newest: 5,
            protect_oldest: 2,
            threshold_catching_up: 0.5,
            threshold_degraded: 0.75,
            threshold_critical: 0.9,
            pause_capture_on_critical: true,
            resume_threshold: 0.7,
        }
    }
}

impl QueueConfig {
    /// Maximum spool size in bytes.
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb * 1024 * 1024
    }

    /// Maximum image age as a [`Duration`].
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_seconds)
    }

    /// Reject configurations the queue cannot operate under.
    pub fn validate(&self) -> eyre::Result<()> {
        eyre::ensure!(self.max_files > 0, "max_files must be positive");
        eyre::ensure!(self.max_size_mb > 0, "max_size_mb must be positive");
        eyre::ensure!(self.max_age_seconds > 0, "max_age_seconds must be positive");
        for (name, value) in [
            ("threshold_catching_up", self.threshold_catching_up),
            ("threshold_degraded", self.threshold_degraded),
            ("threshold_critical", self.threshold_critical),
            ("resume_threshold", self.resume_threshold),
        ] {
            eyre::ensure!(
                (0.0..=1.0).contains(&value),
                "{name} must be within [0, 1], got {value}"
            );
        }
        eyre::ensure!(
            self.threshold_catching_up <= self.threshold_degraded
                && self.threshold_degraded <= self.threshold_critical,
            "health thresholds must be ordered catching_up <= degraded <= critical"
        );
        Ok(())
    }
}

/// Global spool limits enforced by the queue manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Root of the spool tree; one subdirectory per camera. Expected to sit
    /// on a memory-backed filesystem.
    pub base_path: PathBuf,
    /// Cap on the sum of all spool sizes in MiB.
    pub max_total_size_mb: u64,
    /// Period of the memory/disk pressure sweep.
    pub memory_check_seconds: u64,
    /// Keep-ratio used when the total-size cap is breached.
    pub emergency_thin_ratio: f64,
    /// Process heap cap in MiB before the manager sheds images.
    pub max_heap_mb: u64,
    /// Period of the age-expiry sweep; clamped to at least one minute.
    pub expiry_check_seconds: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("/dev/shm/aviationwx"),
            max_total_size_mb: 200,
            memory_check_seconds: 30,
            emergency_thin_ratio: 0.5,
            max_heap_mb: 256,
            expiry_check_seconds: 60,
        }
    }
}

impl ManagerConfig {
    /// Expiry sweep period, never below one minute.
    pub fn expiry_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_check_seconds.max(60))
    }

    /// Pressure sweep period.
    pub fn memory_check_interval(&self) -> Duration {
        Duration::from_secs(self.memory_check_seconds.max(1))
    }
}

/// Upload worker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Concurrent upload tasks.
    pub max_concurrent: usize,
    /// Global queued-image count above which catch-up (newest-first) mode
    /// engages.
    pub catchup_threshold: usize,
    /// Minimum spacing between two uploads of the same camera, in seconds.
    pub min_upload_interval_seconds: u64,
    /// Backoff imposed on a camera after an auth failure, in seconds.
    pub auth_backoff_seconds: u64,
    /// Delay before the single retry, in seconds.
    pub retry_delay_seconds: u64,
    /// Minimum spacing between any two connection establishments, in seconds.
    pub connection_interval_seconds: u64,
    /// Fixed part of the per-attempt timeout, in seconds.
    pub base_timeout_seconds: u64,
    /// Assumed worst-case throughput for the size-aware timeout.
    pub min_bytes_per_second: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            catchup_threshold: 20,
            min_upload_interval_seconds: 0,
            auth_backoff_seconds: 60,
            retry_delay_seconds: 5,
            connection_interval_seconds: 2,
            base_timeout_seconds: 90,
            min_bytes_per_second: 5 * 1024,
        }
    }
}

impl UploadConfig {
    /// Per-attempt timeout for a payload of `size_bytes`, clamped to
    /// `[3 min, 15 min]`.
    pub fn attempt_timeout(&self, size_bytes: u64) -> Duration {
        let transfer = size_bytes / self.min_bytes_per_second.max(1);
        let raw = Duration::from_secs(self.base_timeout_seconds + transfer);
        raw.clamp(Duration::from_secs(3 * 60), Duration::from_secs(15 * 60))
    }

    /// Spacing between connection establishments.
    pub fn connection_interval(&self) -> Duration {
        Duration::from_secs(self.connection_interval_seconds)
    }

    /// Delay before the single retry.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    /// Backoff imposed after an auth failure.
    pub fn auth_backoff(&self) -> Duration {
        Duration::from_secs(self.auth_backoff_seconds)
    }

    /// Per-camera minimum upload spacing.
    pub fn min_upload_interval(&self) -> Duration {
        Duration::from_secs(self.min_upload_interval_seconds)
    }
}

/// Exponential backoff applied to a camera after capture failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First backoff, in seconds.
    pub initial_seconds: u64,
    /// Growth factor per consecutive failure.
    pub multiplier: f64,
    /// Backoff ceiling, in seconds.
    pub max_seconds: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_seconds: 60,
            multiplier: 2.0,
            max_seconds: 3600,
        }
    }
}

/// Per-camera capture worker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Capture period in seconds; clamped to `[1, 1800]`.
    pub interval_seconds: u64,
    /// Deadline of a single `Camera::capture` call, in seconds.
    pub capture_timeout_seconds: u64,
    /// Backoff discipline after capture failures.
    pub backoff: BackoffConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            capture_timeout_seconds: 30,
            backoff: BackoffConfig::default(),
        }
    }
}

impl CaptureConfig {
    /// Capture period, clamped into the accepted range.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
            .clamp(MIN_CAPTURE_INTERVAL, MAX_CAPTURE_INTERVAL)
    }

    /// Deadline of a single capture call.
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_seconds)
    }

    /// Outer per-job budget: sixty seconds on top of the interval.
    pub fn job_budget(&self) -> Duration {
        Duration::from_secs(60) + self.interval()
    }
}

/// Time authority tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// IANA timezone the camera's EXIF wall clock is interpreted in.
    /// `None` means the system's local timezone.
    pub timezone: Option<String>,
    /// Camera/bridge drift below which the camera time is taken verbatim.
    pub camera_tolerance_seconds: u64,
    /// Drift below which the camera time is taken with a warning.
    pub camera_warn_drift_seconds: u64,
    /// Drift below which the camera time is rejected in favor of the bridge.
    pub camera_reject_drift_seconds: u64,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            timezone: None,
            camera_tolerance_seconds: 5,
            camera_warn_drift_seconds: 30,
            camera_reject_drift_seconds: 300,
        }
    }
}

/// Resource limiter tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Concurrent image-processing permits. `None` picks a default from the
    /// machine: 1 below 1 GiB of RAM, otherwise half the cores.
    pub max_concurrent_image_processing: Option<usize>,
    /// Concurrent metadata-tool permits.
    pub max_concurrent_metadata_tool: usize,
    /// Process RSS above which memory pressure builds, in MiB.
    pub memory_pressure_threshold_mb: u64,
    /// Busy-permit count above which worker pressure builds.
    pub worker_pressure_threshold: usize,
    /// Ceiling of the throttle delay, in milliseconds.
    pub max_throttle_delay_ms: u64,
    /// How often the pressure score is recomputed, in milliseconds.
    pub pressure_check_interval_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrent_image_processing: None,
            max_concurrent_metadata_tool: 1,
            memory_pressure_threshold_mb: 384,
            worker_pressure_threshold: 4,
            max_throttle_delay_ms: 2000,
            pressure_check_interval_ms: 1000,
        }
    }
}

impl LimiterConfig {
    /// Ceiling of the throttle delay.
    pub fn max_throttle_delay(&self) -> Duration {
        Duration::from_millis(self.max_throttle_delay_ms)
    }

    /// Pressure recomputation period.
    pub fn pressure_check_interval(&self) -> Duration {
        Duration::from_millis(self.pressure_check_interval_ms)
    }
}

/// NTP healthcheck tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeHealthConfig {
    /// Servers to probe, in preference order.
    pub servers: Vec<String>,
    /// Probe period in seconds.
    pub check_interval_seconds: u64,
    /// Largest absolute clock offset still considered healthy, in seconds.
    pub max_offset_seconds: f64,
    /// Per-server probe timeout in seconds.
    pub timeout_seconds: u64,
}

impl Default for TimeHealthConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                "pool.ntp.org".to_owned(),
                "time.cloudflare.com".to_owned(),
            ],
            check_interval_seconds: 300,
            max_offset_seconds: 2.0,
            timeout_seconds: 5,
        }
    }
}

impl TimeHealthConfig {
    /// Probe period.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds.max(1))
    }

    /// Per-server probe timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }

    /// Largest healthy absolute offset, in milliseconds.
    pub fn max_offset_ms(&self) -> i64 {
        #[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
        {
            (self.max_offset_seconds * 1000.0) as i64
        }
    }
}

/// External metadata tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataToolConfig {
    /// Binary to invoke; resolved through `PATH` when relative.
    pub tool_path: PathBuf,
    /// Per-invocation timeout in seconds.
    pub timeout_seconds: u64,
}

impl Default for MetadataToolConfig {
    fn default() -> Self {
        Self {
            tool_path: PathBuf::from("exiftool"),
            timeout_seconds: 10,
        }
    }
}

impl MetadataToolConfig {
    /// Per-invocation timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Queue manager limits.
    pub manager: ManagerConfig,
    /// Upload worker tuning.
    pub upload: UploadConfig,
    /// Time authority tuning.
    pub authority: AuthorityConfig,
    /// NTP healthcheck; `None` disables it and the bridge clock is trusted.
    pub time_health: Option<TimeHealthConfig>,
    /// Resource limiter tuning.
    pub limiter: LimiterConfig,
    /// Metadata tool; `None` disables EXIF reading and stamping.
    pub metadata_tool: Option<MetadataToolConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_defaults_validate() {
        QueueConfig::default().validate().expect("defaults");
    }

    #[test]
    fn queue_rejects_unordered_thresholds() {
        let cfg = QueueConfig {
            threshold_catching_up: 0.9,
            threshold_degraded: 0.5,
            ..QueueConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn capture_interval_is_clamped() {
        let slow = CaptureConfig {
            interval_seconds: 86_400,
            ..CaptureConfig::default()
        };
        assert_eq!(slow.interval(), MAX_CAPTURE_INTERVAL);

        let fast = CaptureConfig {
            interval_seconds: 0,
            ..CaptureConfig::default()
        };
        assert_eq!(fast.interval(), MIN_CAPTURE_INTERVAL);
    }

    #[test]
    fn attempt_timeout_is_size_aware_and_clamped() {
        let cfg = UploadConfig::default();
        // Tiny payloads hit the 3 minute floor.
        assert_eq!(
            cfg.attempt_timeout(2048),
            Duration::from_secs(3 * 60)
        );
        // 1 MiB at 5 KiB/s exceeds base 90s but stays under the ceiling.
        let one_mib = 1024 * 1024;
        assert_eq!(
            cfg.attempt_timeout(one_mib),
            Duration::from_secs(90 + one_mib / (5 * 1024))
        );
        // Large payloads hit the 15 minute ceiling.
        assert_eq!(
            cfg.attempt_timeout(u64::MAX / 2),
            Duration::from_secs(15 * 60)
        );
    }

    #[test]
    fn partial_fragment_deserializes_with_defaults() {
        let cfg: QueueConfig =
            serde_json::from_str(r#"{"max_files": 10, "threshold_critical": 0.9}"#)
                .expect("fragment");
        assert_eq!(cfg.max_files, 10);
        assert_eq!(cfg.max_size_mb, QueueConfig::default().max_size_mb);
    }
}
