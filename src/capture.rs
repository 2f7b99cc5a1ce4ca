//! Per-camera capture worker.
//!
//! One worker per camera runs a paced loop: capture, reconcile time, process,
//! stamp, spool. Camera failures feed an exponential backoff instead of
//! killing the loop, a panic anywhere restarts the loop after a grace period,
//! and a paused queue simply skips ticks until the spool drains.

use crate::camera::Camera;
use crate::config::{BackoffConfig, CaptureConfig};
use crate::errors::QueueError;
use crate::exif::ExifTool;
use crate::limiter::ResourceLimiter;
use crate::queue::ImageQueue;
use crate::time::TimeAuthority;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
use rand::Rng;
use serde::Serialize;
use std::fmt::Debug;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Delay before a panicked worker loop is restarted.
const RESTART_DELAY: Duration = Duration::from_secs(10);

/// CPU-heavy transformation applied between capture and stamping (resize,
/// re-encode, quality adjustment).
///
/// Implementations run under the limiter's image-processing permit and are
/// expected to yield cooperatively during long row loops, every 50
/// destination rows or so, so captures never starve the upload path.
#[async_trait::async_trait]
pub trait ImageProcessor: Debug + Send + Sync {
    /// Transform one image; returning an error keeps the original bytes.
    async fn process(&self, image: &Bytes) -> eyre::Result<Bytes>;
}

/// Callback fired after each successful capture with the camera id and the
/// processed (pre-stamp) bytes. Useful for live preview surfaces.
pub type CaptureCallback = Arc<dyn Fn(&str, &Bytes) + Send + Sync>;

/// Scheduler-side state of one camera.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CameraState {
    /// When a capture last succeeded.
    pub last_success: Option<DateTime<Utc>>,
    /// Last capture error, verbatim.
    pub last_error: Option<String>,
    /// When the last error happened.
    pub last_error_at: Option<DateTime<Utc>>,
    /// Earliest instant the next capture may run; `None` means immediately.
    pub next_attempt: Option<DateTime<Utc>>,
    /// Current backoff length in seconds.
    pub backoff_seconds: f64,
    /// Consecutive failures.
    pub failures: u32,
    /// Lifetime successes.
    pub successes: u64,
    /// Whether the camera is currently backing off.
    pub is_backing_off: bool,
}

impl CameraState {
    /// Apply one failure: exponential backoff with up to 20% added jitter.
    pub fn record_failure(&mut self, error: impl Into<String>, config: &BackoffConfig) {
        self.failures += 1;
        #[allow(clippy::as_conversions, clippy::cast_precision_loss)]
        let base = (config.initial_seconds as f64
            * config.multiplier.powf(f64::from(self.failures - 1)))
        .min(config.max_seconds as f64);
        let jitter = 1.0 + rand::thread_rng().gen_range(0.0..0.2);
        let backoff = base * jitter;

        self.backoff_seconds = backoff;
        self.next_attempt = Some(
            Utc::now()
                + TimeDelta::from_std(Duration::from_secs_f64(backoff))
                    .unwrap_or(TimeDelta::MAX),
        );
        self.is_backing_off = true;
        self.last_error = Some(error.into());
        self.last_error_at = Some(Utc::now());
    }

    /// Apply one success: clears errors and backoff.
    pub fn record_success(&mut self) {
        self.failures = 0;
        self.successes += 1;
        self.backoff_seconds = 0.0;
        self.next_attempt = None;
        self.is_backing_off = false;
        self.last_error = None;
        self.last_error_at = None;
        self.last_success = Some(Utc::now());
    }
}

#[derive(Debug, Default)]
struct CaptureStats {
    captures_total: AtomicU64,
    captures_failed: AtomicU64,
    exif_read_failed: AtomicU64,
    exif_write_failed: AtomicU64,
    currently_capturing: AtomicBool,
    last_capture: std::sync::Mutex<Option<DateTime<Utc>>>,
    next_capture: std::sync::Mutex<Option<DateTime<Utc>>>,
}

/// Point-in-time view of a capture worker.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureStatsSnapshot {
    /// Capture attempts since start.
    pub captures_total: u64,
    /// Failed capture attempts.
    pub captures_failed: u64,
    /// EXIF reads that failed (capture continued without a camera time).
    pub exif_read_failed: u64,
    /// EXIF stamps that failed (original bytes were spooled).
    pub exif_write_failed: u64,
    /// Whether a capture is in flight right now.
    pub currently_capturing: bool,
    /// When the last capture attempt ran.
    pub last_capture_time: Option<DateTime<Utc>>,
    /// When the next tick is due.
    pub next_capture_time: Option<DateTime<Utc>>,
}

/// Everything a capture worker needs.
pub struct CaptureSetup {
    /// The camera to drive.
    pub camera: Arc<dyn Camera>,
    /// The spool to feed.
    pub queue: Arc<ImageQueue>,
    /// Pacing, timeouts and backoff.
    pub config: CaptureConfig,
    /// Time authority electing observation times.
    pub authority: Arc<TimeAuthority>,
    /// Shared resource limiter.
    pub limiter: Arc<ResourceLimiter>,
    /// Metadata tool; `None` skips EXIF reading and stamping.
    pub exif: Option<Arc<ExifTool>>,
    /// Optional image processor.
    pub processor: Option<Arc<dyn ImageProcessor>>,
    /// Optional post-capture callback.
    pub on_capture: Option<CaptureCallback>,
}

impl Debug for CaptureSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSetup")
            .field("camera", &self.camera.id())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Paced, backoff-aware, panic-resilient capture loop for one camera.
pub struct CaptureWorker {
    camera: Arc<dyn Camera>,
    queue: Arc<ImageQueue>,
    config: CaptureConfig,
    authority: std::sync::RwLock<Arc<TimeAuthority>>,
    limiter: Arc<ResourceLimiter>,
    exif: Option<Arc<ExifTool>>,
    processor: Option<Arc<dyn ImageProcessor>>,
    on_capture: Option<CaptureCallback>,
    state: std::sync::Mutex<CameraState>,
    stats: CaptureStats,
    cancel: CancellationToken,
}

impl Debug for CaptureWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureWorker")
            .field("camera", &self.camera.id())
            .finish_non_exhaustive()
    }
}

impl CaptureWorker {
    /// Build a worker; `cancel` stops it (also reachable via
    /// [`stop`](Self::stop)).
    pub fn new(setup: CaptureSetup, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            camera: setup.camera,
            queue: setup.queue,
            config: setup.config,
            authority: std::sync::RwLock::new(setup.authority),
            limiter: setup.limiter,
            exif: setup.exif,
            processor: setup.processor,
            on_capture: setup.on_capture,
            state: std::sync::Mutex::new(CameraState::default()),
            stats: CaptureStats::default(),
            cancel,
        })
    }

    /// Id of the camera this worker drives.
    pub fn camera_id(&self) -> &str {
        self.camera.id()
    }

    /// Kind of the camera this worker drives.
    pub fn camera_kind(&self) -> crate::camera::CameraKind {
        self.camera.kind()
    }

    /// The queue this worker spools into.
    pub fn queue(&self) -> &Arc<ImageQueue> {
        &self.queue
    }

    /// Swap the time authority (hot-reload of timezone/NTP settings).
    pub fn set_authority(&self, authority: Arc<TimeAuthority>) {
        *self
            .authority
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = authority;
    }

    /// Stop the worker. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Scheduler-side camera state (backoff, errors, successes).
    pub fn state(&self) -> CameraState {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Capture statistics.
    pub fn stats(&self) -> CaptureStatsSnapshot {
        CaptureStatsSnapshot {
            captures_total: self.stats.captures_total.load(Ordering::Relaxed),
            captures_failed: self.stats.captures_failed.load(Ordering::Relaxed),
            exif_read_failed: self.stats.exif_read_failed.load(Ordering::Relaxed),
            exif_write_failed: self.stats.exif_write_failed.load(Ordering::Relaxed),
            currently_capturing: self.stats.currently_capturing.load(Ordering::Acquire),
            last_capture_time: *self
                .stats
                .last_capture
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
            next_capture_time: *self
                .stats
                .next_capture
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        }
    }

    /// Run until cancelled. A panic inside the loop is logged and the loop
    /// restarts after ten seconds.
    pub async fn run(self: Arc<Self>) {
        loop {
            let result = AssertUnwindSafe(self.run_loop()).catch_unwind().await;
            if let Err(panic) = result {
                tracing::error!(
                    camera = self.camera_id(),
                    panic = %panic_message(panic.as_ref()),
                    "capture loop panicked; restarting"
                );
            }
            if self.cancel.is_cancelled() {
                return;
            }
            tokio::select! {
                () = tokio::time::sleep(RESTART_DELAY) => {}
                () = self.cancel.cancelled() => return,
            }
        }
    }

    async fn run_loop(&self) {
        let interval = self.config.interval();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = self.cancel.cancelled() => return,
            }
            *self
                .stats
                .next_capture
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) =
                Some(Utc::now() + TimeDelta::from_std(interval).unwrap_or(TimeDelta::MAX));

            if self.stats.currently_capturing.load(Ordering::Acquire) {
                tracing::debug!(
                    camera = self.camera_id(),
                    "previous capture still in flight; skipping this tick"
                );
                continue;
            }
            if self.queue.is_capture_paused().await {
                tracing::debug!(
                    camera = self.camera_id(),
                    "queue has capture paused; skipping this tick"
                );
                continue;
            }
            let backing_off = {
                let state = self
                    .state
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                state.next_attempt.is_some_and(|at| Utc::now() < at)
            };
            if backing_off {
                tracing::trace!(camera = self.camera_id(), "backing off; skipping this tick");
                continue;
            }

            self.stats
                .currently_capturing
                .store(true, Ordering::Release);
            self.capture_once().await;
            self.stats
                .currently_capturing
                .store(false, Ordering::Release);
            *self
                .stats
                .last_capture
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Utc::now());
        }
    }

    async fn capture_once(&self) {
        let _ = self.stats.captures_total.fetch_add(1, Ordering::Relaxed);
        let budget = self.config.job_budget();
        let outcome = match tokio::time::timeout(budget, self.capture_pipeline()).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => {
                tracing::warn!(
                    camera = self.camera_id(),
                    ?budget,
                    "capture job overran its budget; aborted"
                );
                Err(format!("capture job overran its {budget:?} budget"))
            }
        };
        match outcome {
            Ok(()) => {
                self.state
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .record_success();
            }
            Err(error) => {
                let _ = self.stats.captures_failed.fetch_add(1, Ordering::Relaxed);
                let mut state = self
                    .state
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                state.record_failure(error.as_str(), &self.config.backoff);
                tracing::warn!(
                    camera = self.camera_id(),
                    %error,
                    failures = state.failures,
                    backoff_seconds = state.backoff_seconds,
                    "capture failed; backing off"
                );
            }
        }
    }

    #[tracing::instrument(skip(self), fields(camera = self.camera_id()))]
    async fn capture_pipeline(&self) -> Result<(), String> {
        let throttle = self.limiter.throttle_delay();
        if !throttle.is_zero() {
            tracing::debug!(?throttle, "throttling before capture");
            tokio::time::sleep(throttle).await;
        }

        let capture_start = Utc::now();
        let capture_timeout = self.config.capture_timeout();
        let bytes = match tokio::time::timeout(
            capture_timeout,
            self.camera.capture(&self.cancel),
        )
        .await
        {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(error)) => return Err(error.to_string()),
            Err(_elapsed) => {
                return Err(format!("capture timed out after {capture_timeout:?}"));
            }
        };

        let camera_time = match &self.exif {
            Some(exif) => match exif.read_camera_time(&bytes, &self.cancel).await {
                Ok(time) => time,
                Err(error) => {
                    let _ = self.stats.exif_read_failed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(%error, "camera EXIF read failed; continuing without it");
                    None
                }
            },
            None => None,
        };

        let authority = Arc::clone(
            &self
                .authority
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        let observation = authority.determine(capture_start, camera_time);
        if let Some(warning) = &observation.warning {
            tracing::warn!(%warning, "time authority attached a warning");
        }

        let processed = match &self.processor {
            Some(processor) => {
                let _permit = self
                    .limiter
                    .acquire_image_processing(&self.cancel)
                    .await
                    .map_err(|cancelled| cancelled.to_string())?;
                // Let queued higher-priority work in before burning CPU.
                self.limiter.yield_now().await;
                match processor.process(&bytes).await {
                    Ok(processed) => processed,
                    Err(error) => {
                        tracing::warn!(%error, "image processing failed; keeping the original");
                        bytes.clone()
                    }
                }
            }
            None => bytes.clone(),
        };

        let spooled = match &self.exif {
            Some(exif) => {
                let outcome = exif.stamp(&processed, &observation, &self.cancel).await;
                if !outcome.stamped {
                    let _ = self.stats.exif_write_failed.fetch_add(1, Ordering::Relaxed);
                }
                outcome.bytes
            }
            None => processed.clone(),
        };

        match self.queue.enqueue(&spooled, &observation).await {
            Ok(image) => {
                tracing::debug!(file = %image.filename, size = image.size_bytes, "image spooled");
            }
            Err(QueueError::CapturePaused) => {
                // Freshness over durability: a paused queue drops the frame.
                tracing::debug!("queue paused during enqueue; frame dropped");
            }
            Err(error) => {
                tracing::warn!(%error, "enqueue failed; frame lost");
            }
        }

        if let Some(callback) = &self.on_capture {
            callback(self.camera.id(), &processed);
        }
        Ok(())
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthorityConfig, LimiterConfig, QueueConfig};
    use crate::test_utils::MockCamera;
    use std::time::Duration;

    fn backoff_config() -> BackoffConfig {
        BackoffConfig {
            initial_seconds: 60,
            multiplier: 2.0,
            max_seconds: 3600,
        }
    }

    #[test]
    fn backoff_grows_monotonically_and_caps() {
        let config = backoff_config();
        let mut state = CameraState::default();
        let mut previous = 0.0_f64;
        for k in 1..=10 {
            state.record_failure("boom", &config);
            assert!(
                state.backoff_seconds >= previous,
                "backoff shrank at failure {k}"
            );
            assert!(state.backoff_seconds <= 3600.0 * 1.2, "backoff over cap");
            assert!(state.is_backing_off);
            previous = state.backoff_seconds;
        }
        assert_eq!(state.failures, 10);
        // Cap reached: 60 * 2^9 > 3600.
        assert!(state.backoff_seconds >= 3600.0);
    }

    #[test]
    fn backoff_jitter_stays_within_twenty_percent() {
        let config = backoff_config();
        for _ in 0..50 {
            let mut state = CameraState::default();
            state.record_failure("boom", &config);
            assert!(state.backoff_seconds >= 60.0);
            assert!(state.backoff_seconds <= 60.0 * 1.2);
        }
    }

    #[test]
    fn success_resets_backoff_and_errors() {
        let config = backoff_config();
        let mut state = CameraState::default();
        state.record_failure("boom", &config);
        state.record_failure("boom", &config);
        state.record_success();

        assert_eq!(state.failures, 0);
        assert_eq!(state.successes, 1);
        assert!(!state.is_backing_off);
        assert!(state.next_attempt.is_none());
        assert!(state.last_error.is_none());
        assert!(state.last_success.is_some());
    }

    async fn worker_fixture(
        camera: Arc<dyn Camera>,
        queue_config: QueueConfig,
    ) -> (tempfile::TempDir, Arc<ImageQueue>, Arc<CaptureWorker>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = ImageQueue::new(camera.id().to_owned(), dir.path().join("spool"), queue_config)
            .await
            .expect("queue");
        let worker = CaptureWorker::new(
            CaptureSetup {
                camera,
                queue: Arc::clone(&queue),
                config: CaptureConfig::default(),
                authority: Arc::new(
                    TimeAuthority::new(AuthorityConfig::default(), None).expect("authority"),
                ),
                limiter: Arc::new(ResourceLimiter::new(LimiterConfig {
                    max_concurrent_image_processing: Some(1),
                    ..LimiterConfig::default()
                })),
                exif: None,
                processor: None,
                on_capture: None,
            },
            CancellationToken::new(),
        );
        (dir, queue, worker)
    }

    #[tokio::test(start_paused = true)]
    async fn worker_spools_captured_frames() {
        let camera = Arc::new(MockCamera::new("cam1"));
        let (_dir, queue, worker) = worker_fixture(Arc::clone(&camera) as Arc<dyn Camera>, QueueConfig::default()).await;

        let handle = tokio::spawn(Arc::clone(&worker).run());
        tokio::time::timeout(Duration::from_secs(300), async {
            while queue.len().await < 3 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .expect("three captures should land well within the window");

        worker.stop();
        handle.await.expect("worker task");

        assert!(camera.capture_count() >= 3);
        let stats = worker.stats();
        assert!(stats.captures_total >= 3);
        assert_eq!(stats.captures_failed, 0);
        assert!(!stats.currently_capturing);
        let state = worker.state();
        assert!(state.successes >= 3);
        assert!(!state.is_backing_off);
    }

    #[tokio::test(start_paused = true)]
    async fn captures_never_overlap() {
        // Each capture takes three times the tick interval.
        let camera = Arc::new(MockCamera::new("cam1").with_capture_delay(Duration::from_secs(3)));
        let (_dir, queue, worker) = worker_fixture(Arc::clone(&camera) as Arc<dyn Camera>, QueueConfig::default()).await;

        let handle = tokio::spawn(Arc::clone(&worker).run());
        tokio::time::timeout(Duration::from_secs(600), async {
            while queue.len().await < 2 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .expect("captures should land");
        worker.stop();
        handle.await.expect("worker task");

        assert_eq!(camera.max_concurrent_captures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_put_the_camera_into_backoff() {
        let camera = Arc::new(MockCamera::new("cam1").always_failing());
        let (_dir, queue, worker) = worker_fixture(Arc::clone(&camera) as Arc<dyn Camera>, QueueConfig::default()).await;

        let handle = tokio::spawn(Arc::clone(&worker).run());
        tokio::time::timeout(Duration::from_secs(120), async {
            while worker.stats().captures_failed == 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .expect("a failure should be recorded");
        worker.stop();
        handle.await.expect("worker task");

        assert!(queue.is_empty().await);
        let state = worker.state();
        assert!(state.failures >= 1);
        assert!(state.is_backing_off);
        assert!(state.last_error.is_some());
        assert!(state.next_attempt.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn paused_queue_skips_ticks() {
        let camera = Arc::new(MockCamera::new("cam1"));
        let (_dir, queue, worker) = worker_fixture(Arc::clone(&camera) as Arc<dyn Camera>, QueueConfig::default()).await;
        queue.pause_capture().await;

        let handle = tokio::spawn(Arc::clone(&worker).run());
        tokio::time::sleep(Duration::from_secs(10)).await;
        worker.stop();
        handle.await.expect("worker task");

        assert_eq!(camera.capture_count(), 0);
        assert!(queue.is_empty().await);
    }
}
