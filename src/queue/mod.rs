//! Per-camera disk-backed spool queue.
//!
//! A queue is a flat directory of `<observation_unix_ms>.jpg` files on a
//! memory-backed filesystem. The directory is the authoritative state: every
//! oldest/newest/size recomputation rescans it, so a crash can never leave
//! the counters and the disk disagreeing for long, and a partially written
//! file (`.tmp` suffix) is invisible to every reader.

mod manager;

pub use manager::{ManagerStats, QueueManager};

use crate::config::QueueConfig;
use crate::errors::QueueError;
use crate::time::{ObservationResult, TimeConfidence, TimeSource};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Payloads below this size are rejected as non-images.
pub const MIN_IMAGE_BYTES: usize = 100;

/// Clock skew grace: observations up to this many seconds ahead of now are
/// still accepted.
pub const FUTURE_GRACE_SECONDS: i64 = 5;

/// Discrete queue pressure level, derived from capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    /// Plenty of room.
    Healthy,
    /// Filling up; light thinning engages.
    CatchingUp,
    /// Uploads are clearly not keeping up.
    Degraded,
    /// Nearly full; capture may be paused.
    Critical,
}

/// One spooled image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedImage {
    /// Base file name, `<observation_unix_ms>.jpg`.
    pub filename: String,
    /// Absolute path inside the spool.
    pub path: PathBuf,
    /// Payload size on disk.
    pub size_bytes: u64,
    /// Observation instant, reconstructed from the file name.
    pub observation_time: DateTime<Utc>,
    /// Where the observation time came from. Files seen only by a directory
    /// rescan report [`TimeSource::BridgeClock`]; the filename does not
    /// carry provenance, the EXIF payload does.
    pub source: TimeSource,
    /// Trust in the observation time; rescanned files report `Medium`.
    pub confidence: TimeConfidence,
}

/// Point-in-time view of one queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueState {
    /// Camera this queue spools for.
    pub camera_id: String,
    /// Spool directory.
    pub directory: PathBuf,
    /// Number of spooled images.
    pub image_count: usize,
    /// Sum of spooled image sizes.
    pub total_size_bytes: u64,
    /// Oldest spooled observation.
    pub oldest: Option<DateTime<Utc>>,
    /// Newest spooled observation.
    pub newest: Option<DateTime<Utc>>,
    /// Current pressure level.
    pub health: HealthLevel,
    /// Whether capture is paused while the queue drains.
    pub capture_paused: bool,
    /// Images accepted since construction.
    pub enqueued: u64,
    /// Images removed after a successful upload.
    pub uploaded: u64,
    /// Images shed by thinning.
    pub thinned: u64,
    /// Images removed by age expiry.
    pub expired: u64,
}

/// Edge-triggered pause/resume notifications, handed out once per queue.
///
/// Each channel holds at most one pending edge; an edge fired while the
/// previous one is still unread is coalesced, never duplicated.
#[derive(Debug)]
pub struct QueueSignals {
    /// Fires when `capture_paused` transitions to true.
    pub pause: mpsc::Receiver<()>,
    /// Fires when `capture_paused` transitions back to false.
    pub resume: mpsc::Receiver<()>,
}

#[derive(Debug)]
struct QueueInner {
    image_count: usize,
    total_size_bytes: u64,
    oldest: Option<DateTime<Utc>>,
    newest: Option<DateTime<Utc>>,
    health: HealthLevel,
    capture_paused: bool,
    enqueued: u64,
    uploaded: u64,
    thinned: u64,
    expired: u64,
}

#[derive(Debug, Clone)]
struct SpoolEntry {
    ms: i64,
    path: PathBuf,
    size_bytes: u64,
    time: DateTime<Utc>,
}

impl SpoolEntry {
    fn into_image(self) -> QueuedImage {
        QueuedImage {
            filename: format!("{}.jpg", self.ms),
            path: self.path,
            size_bytes: self.size_bytes,
            observation_time: self.time,
            source: TimeSource::BridgeClock,
            confidence: TimeConfidence::Medium,
        }
    }
}

/// Parse a spool file name; only `<digits>.jpg` is valid.
pub fn parse_spool_filename(name: &str) -> Option<i64> {
    let stem = name.strip_suffix(".jpg")?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Bounded spool of captured images for one camera.
#[derive(Debug)]
pub struct ImageQueue {
    camera_id: String,
    dir: PathBuf,
    config: QueueConfig,
    inner: RwLock<QueueInner>,
    pause_tx: mpsc::Sender<()>,
    resume_tx: mpsc::Sender<()>,
    signals: std::sync::Mutex<Option<QueueSignals>>,
}

impl ImageQueue {
    /// Open (or create) the spool directory and restore counters from it.
    pub async fn new(
        camera_id: impl Into<String>,
        dir: impl Into<PathBuf>,
        config: QueueConfig,
    ) -> Result<Arc<Self>, QueueError> {
        let camera_id = camera_id.into();
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let (pause_tx, pause_rx) = mpsc::channel(1);
        let (resume_tx, resume_rx) = mpsc::channel(1);
        let queue = Arc::new(Self {
            camera_id,
            dir,
            config,
            inner: RwLock::new(QueueInner {
                image_count: 0,
                total_size_bytes: 0,
                oldest: None,
                newest: None,
                health: HealthLevel::Healthy,
                capture_paused: false,
                enqueued: 0,
                uploaded: 0,
                thinned: 0,
                expired: 0,
            }),
            pause_tx,
            resume_tx,
            signals: std::sync::Mutex::new(Some(QueueSignals {
                pause: pause_rx,
                resume: resume_rx,
            })),
        });

        {
            let mut inner = queue.inner.write().await;
            queue.restore_from_disk(&mut inner).await?;
            queue.recompute_health(&mut inner);
            if inner.image_count > 0 {
                tracing::info!(
                    camera = %queue.camera_id,
                    images = inner.image_count,
                    bytes = inner.total_size_bytes,
                    "restored spool from disk"
                );
            }
        }
        Ok(queue)
    }

    /// Camera this queue spools for.
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Spool directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Take the pause/resume signal receivers. Yields `Some` exactly once.
    pub fn take_signals(&self) -> Option<QueueSignals> {
        self.signals
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    /// Whether capture is currently paused.
    pub async fn is_capture_paused(&self) -> bool {
        self.inner.read().await.capture_paused
    }

    /// Number of spooled images.
    pub async fn len(&self) -> usize {
        self.inner.read().await.image_count
    }

    /// Whether the spool is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Current snapshot.
    pub async fn state(&self) -> QueueState {
        let inner = self.inner.read().await;
        QueueState {
            camera_id: self.camera_id.clone(),
            directory: self.dir.clone(),
            image_count: inner.image_count,
            total_size_bytes: inner.total_size_bytes,
            oldest: inner.oldest,
            newest: inner.newest,
            health: inner.health,
            capture_paused: inner.capture_paused,
            enqueued: inner.enqueued,
            uploaded: inner.uploaded,
            thinned: inner.thinned,
            expired: inner.expired,
        }
    }

    /// Spool one image under its observation time.
    ///
    /// Rejects payloads while paused, payloads too small to be images, and
    /// observation times outside `[now - max_age, now + 5s]`. On a filename
    /// collision the time is nudged forward a millisecond at a time until a
    /// free slot is found; the returned image carries the nudged instant.
    #[allow(clippy::as_conversions)]
    #[tracing::instrument(skip(self, bytes), fields(camera = %self.camera_id))]
    pub async fn enqueue(
        self: &Arc<Self>,
        bytes: &[u8],
        observation: &ObservationResult,
    ) -> Result<QueuedImage, QueueError> {
        let mut inner = self.inner.write().await;

        if inner.capture_paused {
            return Err(QueueError::CapturePaused);
        }
        if bytes.len() < MIN_IMAGE_BYTES {
            return Err(QueueError::InvalidImage {
                len: bytes.len(),
                min: MIN_IMAGE_BYTES,
            });
        }
        let now = Utc::now();
        if observation.time > now + TimeDelta::seconds(FUTURE_GRACE_SECONDS) {
            return Err(QueueError::FromFuture {
                ahead_ms: (observation.time - now).num_milliseconds(),
            });
        }
        let age = now - observation.time;
        if age > TimeDelta::seconds(i64::try_from(self.config.max_age_seconds).unwrap_or(i64::MAX))
        {
            return Err(QueueError::Expired {
                age_seconds: age.num_seconds(),
                max_age_seconds: self.config.max_age_seconds,
            });
        }

        let mut ms = observation.time.timestamp_millis();
        let path = loop {
            let candidate = self.dir.join(format!("{ms}.jpg"));
            if !tokio::fs::try_exists(&candidate).await? {
                break candidate;
            }
            ms += 1;
        };
        let tmp = self.dir.join(format!("{ms}.jpg.tmp"));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let time = DateTime::from_timestamp_millis(ms).unwrap_or(observation.time);
        let size_bytes = bytes.len() as u64;
        inner.image_count += 1;
        inner.total_size_bytes += size_bytes;
        inner.oldest = Some(inner.oldest.map_or(time, |oldest| oldest.min(time)));
        inner.newest = Some(inner.newest.map_or(time, |newest| newest.max(time)));
        inner.enqueued += 1;
        self.recompute_health(&mut inner);

        let needs_thinning = self.config.thinning_enabled && inner.health >= HealthLevel::CatchingUp;
        drop(inner);
        if needs_thinning {
            // Off the caller's path: a slow thin must not delay the capture.
            let queue = Arc::clone(self);
            drop(tokio::spawn(async move {
                if let Err(error) = queue.thin().await {
                    tracing::warn!(camera = %queue.camera_id, %error, "thinning failed");
                }
            }));
        }

        Ok(QueuedImage {
            filename: format!("{ms}.jpg"),
            path,
            size_bytes,
            observation_time: time,
            source: observation.source,
            confidence: observation.confidence,
        })
    }

    /// Oldest spooled image, left in place.
    pub async fn dequeue(&self) -> Result<QueuedImage, QueueError> {
        let _inner = self.inner.read().await;
        let mut entries = self.scan_entries().await?;
        if entries.is_empty() {
            return Err(QueueError::Empty);
        }
        Ok(entries.remove(0).into_image())
    }

    /// Newest spooled image, left in place. Used by catch-up mode.
    pub async fn dequeue_newest(&self) -> Result<QueuedImage, QueueError> {
        let _inner = self.inner.read().await;
        let entries = self.scan_entries().await?;
        entries
            .into_iter()
            .next_back()
            .map(SpoolEntry::into_image)
            .ok_or(QueueError::Empty)
    }

    /// Up to `n` oldest images, oldest first.
    pub async fn peek(&self, n: usize) -> Result<Vec<QueuedImage>, QueueError> {
        let _inner = self.inner.read().await;
        let entries = self.scan_entries().await?;
        Ok(entries
            .into_iter()
            .take(n)
            .map(SpoolEntry::into_image)
            .collect())
    }

    /// Remove an image after its upload succeeded.
    ///
    /// A file that has already vanished (expired or shed meanwhile) is
    /// tolerated with a warning. Dropping below the resume threshold clears
    /// a capture pause and fires the resume edge.
    #[tracing::instrument(skip(self, image), fields(camera = %self.camera_id, file = %image.filename))]
    pub async fn mark_uploaded(&self, image: &QueuedImage) -> Result<(), QueueError> {
        let mut inner = self.inner.write().await;
        match tokio::fs::remove_file(&image.path).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("uploaded image was already gone from the spool");
            }
            Err(error) => return Err(error.into()),
        }
        inner.uploaded += 1;
        self.restore_from_disk(&mut inner).await?;
        self.recompute_health(&mut inner);
        Ok(())
    }

    /// Remove images older than `max_age`, oldest first, stopping at the
    /// first one still fresh. Returns how many were removed.
    #[allow(clippy::as_conversions)]
    pub async fn expire(&self) -> Result<usize, QueueError> {
        let mut inner = self.inner.write().await;
        let cutoff = Utc::now()
            - TimeDelta::seconds(i64::try_from(self.config.max_age_seconds).unwrap_or(i64::MAX));
        let entries = self.scan_entries().await?;
        let mut removed = 0_usize;
        for entry in entries {
            if entry.time >= cutoff {
                break;
            }
            tokio::fs::remove_file(&entry.path).await?;
            removed += 1;
        }
        if removed > 0 {
            inner.expired += removed as u64;
            tracing::info!(camera = %self.camera_id, removed, "expired stale images");
            self.restore_from_disk(&mut inner).await?;
            self.recompute_health(&mut inner);
        }
        Ok(removed)
    }

    /// Health-driven shedding of middle-aged images.
    ///
    /// Active only at `catching_up` and above, targeting 80/60/40 percent of
    /// `max_files` respectively. The configured oldest prefix and newest
    /// suffix are protected; when the protections cover the whole spool they
    /// collapse to quartiles. Victims are evenly spaced across what remains.
    #[allow(
        clippy::as_conversions,
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub async fn thin(&self) -> Result<usize, QueueError> {
        let mut inner = self.inner.write().await;
        if !self.config.thinning_enabled || inner.health < HealthLevel::CatchingUp {
            return Ok(0);
        }
        let factor = match inner.health {
            HealthLevel::Healthy => return Ok(0),
            HealthLevel::CatchingUp => 0.8,
            HealthLevel::Degraded => 0.6,
            HealthLevel::Critical => 0.4,
        };
        let target = (self.config.max_files as f64 * factor).floor() as usize;

        let entries = self.scan_entries().await?;
        let total = entries.len();
        if total <= target {
            return Ok(0);
        }

        let (mut protect_oldest, mut protect_newest) =
            (self.config.protect_oldest, self.config.protect_newest);
        if protect_oldest + protect_newest >= total {
            protect_oldest = total / 4;
            protect_newest = total / 4;
        }
        let window_start = protect_oldest;
        let window_end = total - protect_newest;
        let window_len = window_end.saturating_sub(window_start);
        let remove_n = (total - target).min(window_len);
        if remove_n == 0 {
            return Ok(0);
        }

        let victims: BTreeSet<usize> = (0..remove_n)
            .map(|i| {
                let step = window_len as f64 / remove_n as f64;
                (window_start + (i as f64 * step) as usize).min(window_end - 1)
            })
            .collect();

        let mut removed = 0_usize;
        for index in &victims {
            tokio::fs::remove_file(&entries[*index].path).await?;
            removed += 1;
        }
        inner.thinned += removed as u64;
        tracing::info!(
            camera = %self.camera_id,
            removed,
            target,
            level = ?inner.health,
            "thinned spool"
        );
        self.restore_from_disk(&mut inner).await?;
        self.recompute_health(&mut inner);
        Ok(removed)
    }

    /// Unconditionally keep only the newest `ceil(total * keep_ratio)`
    /// images (at least one). Returns how many were removed.
    #[allow(
        clippy::as_conversions,
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub async fn emergency_thin(&self, keep_ratio: f64) -> Result<usize, QueueError> {
        let mut inner = self.inner.write().await;
        let entries = self.scan_entries().await?;
        let total = entries.len();
        let keep = ((total as f64 * keep_ratio.clamp(0.0, 1.0)).ceil() as usize).max(1);
        if total <= keep {
            return Ok(0);
        }
        let mut removed = 0_usize;
        for entry in &entries[..total - keep] {
            tokio::fs::remove_file(&entry.path).await?;
            removed += 1;
        }
        inner.thinned += removed as u64;
        tracing::warn!(
            camera = %self.camera_id,
            removed,
            kept = keep,
            "emergency thin shed the oldest images"
        );
        self.restore_from_disk(&mut inner).await?;
        self.recompute_health(&mut inner);
        Ok(removed)
    }

    /// Pause capture explicitly; fires the pause edge on a transition.
    pub async fn pause_capture(&self) {
        let mut inner = self.inner.write().await;
        if !inner.capture_paused {
            inner.capture_paused = true;
            let _ = self.pause_tx.try_send(());
            tracing::warn!(camera = %self.camera_id, "capture paused");
        }
    }

    /// Resume capture explicitly; fires the resume edge on a transition.
    pub async fn resume_capture(&self) {
        let mut inner = self.inner.write().await;
        if inner.capture_paused {
            inner.capture_paused = false;
            let _ = self.resume_tx.try_send(());
            tracing::info!(camera = %self.camera_id, "capture resumed");
        }
    }

    async fn scan_entries(&self) -> Result<Vec<SpoolEntry>, QueueError> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(dirent) = dir.next_entry().await? {
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(ms) = parse_spool_filename(name) else {
                continue;
            };
            let Some(time) = DateTime::from_timestamp_millis(ms) else {
                continue;
            };
            let metadata = match dirent.metadata().await {
                Ok(metadata) => metadata,
                // Raced with a concurrent removal; the scan stays consistent.
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => continue,
                Err(error) => return Err(error.into()),
            };
            if !metadata.is_file() {
                continue;
            }
            entries.push(SpoolEntry {
                ms,
                path: dirent.path(),
                size_bytes: metadata.len(),
                time,
            });
        }
        entries.sort_by_key(|entry| entry.ms);
        Ok(entries)
    }

    async fn restore_from_disk(&self, inner: &mut QueueInner) -> Result<(), QueueError> {
        let entries = self.scan_entries().await?;
        inner.image_count = entries.len();
        inner.total_size_bytes = entries.iter().map(|entry| entry.size_bytes).sum();
        inner.oldest = entries.first().map(|entry| entry.time);
        inner.newest = entries.last().map(|entry| entry.time);
        Ok(())
    }

    #[allow(clippy::as_conversions, clippy::cast_precision_loss)]
    fn capacity(&self, inner: &QueueInner) -> f64 {
        let by_count = inner.image_count as f64 / self.config.max_files.max(1) as f64;
        let by_bytes =
            inner.total_size_bytes as f64 / self.config.max_size_bytes().max(1) as f64;
        by_count.max(by_bytes)
    }

    fn level_for(&self, capacity: f64) -> HealthLevel {
        if capacity >= self.config.threshold_critical {
            HealthLevel::Critical
        } else if capacity >= self.config.threshold_degraded {
            HealthLevel::Degraded
        } else if capacity >= self.config.threshold_catching_up {
            HealthLevel::CatchingUp
        } else {
            HealthLevel::Healthy
        }
    }

    fn recompute_health(&self, inner: &mut QueueInner) {
        let capacity = self.capacity(inner);
        let level = self.level_for(capacity);
        if level != inner.health {
            tracing::debug!(
                camera = %self.camera_id,
                from = ?inner.health,
                to = ?level,
                capacity,
                "queue health changed"
            );
        }
        let entering_critical = level == HealthLevel::Critical && inner.health != HealthLevel::Critical;
        inner.health = level;

        if entering_critical && self.config.pause_capture_on_critical && !inner.capture_paused {
            inner.capture_paused = true;
            let _ = self.pause_tx.try_send(());
            tracing::warn!(
                camera = %self.camera_id,
                capacity,
                "queue critical; pausing capture"
            );
        } else if inner.capture_paused && capacity <= self.config.resume_threshold {
            inner.capture_paused = false;
            let _ = self.resume_tx.try_send(());
            tracing::info!(
                camera = %self.camera_id,
                capacity,
                "queue drained below the resume threshold; capture resumed"
            );
        }
    }
}
