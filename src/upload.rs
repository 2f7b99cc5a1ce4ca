//! Global upload worker.
//!
//! A one-second coordinator round-robins across the per-camera queues and
//! feeds a small pool of upload tasks. Delivery discipline is built around
//! not getting the bridge banned: connection establishment is globally
//! rate-limited, auth failures skip the retry and impose a long per-camera
//! backoff, and repeated transient failures back a camera off briefly so one
//! dead remote cannot monopolize the pool.

use crate::capture::panic_message;
use crate::config::UploadConfig;
use crate::errors::{QueueError, UploadErrorKind};
use crate::queue::{ImageQueue, QueuedImage};
use crate::uploader::{UploadError, Uploader};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Delay before a panicked coordinator loop is restarted.
const RESTART_DELAY: Duration = Duration::from_secs(10);

/// How many recent success instants feed the uploads-per-minute rate.
const RATE_WINDOW: usize = 120;

/// Per-camera upload routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraUploadConfig {
    /// Remote base directory; the camera id is used when unset.
    pub remote_path: Option<String>,
    /// Disabled cameras keep spooling but are never scheduled.
    pub enabled: bool,
}

impl Default for CameraUploadConfig {
    fn default() -> Self {
        Self {
            remote_path: None,
            enabled: true,
        }
    }
}

/// Per-camera failure bookkeeping.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadFailureState {
    /// Consecutive failed uploads.
    pub consecutive_failures: u32,
    /// When an upload last failed.
    pub last_failure: Option<DateTime<Utc>>,
    /// When an upload last failed on credentials.
    pub last_auth_failure: Option<DateTime<Utc>>,
    /// The camera is not scheduled again before this instant.
    pub backoff_until: Option<DateTime<Utc>>,
}

struct CameraEntry {
    queue: Arc<ImageQueue>,
    config: CameraUploadConfig,
    uploader: Arc<dyn Uploader>,
    fail: UploadFailureState,
    last_upload: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct UploadTask {
    camera_id: String,
    remote_path: String,
    image: QueuedImage,
}

#[derive(Debug, Default)]
struct UploadStatsInner {
    total: u64,
    success: u64,
    failed: u64,
    retried: u64,
    auth_failures: u64,
    uploads_today: u64,
    today: Option<NaiveDate>,
    last_upload: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    last_failure_reason: Option<String>,
    recent_successes: VecDeque<DateTime<Utc>>,
}

/// Point-in-time view of the upload worker.
#[derive(Debug, Clone, Serialize)]
pub struct UploadStatsSnapshot {
    /// Upload tasks finished (success or final failure).
    pub uploads_total: u64,
    /// Successful uploads.
    pub uploads_success: u64,
    /// Uploads that failed for good.
    pub uploads_failed: u64,
    /// Second attempts performed.
    pub uploads_retried: u64,
    /// Credential failures.
    pub auth_failures: u64,
    /// Successful uploads since the last UTC midnight.
    pub uploads_today: u64,
    /// Images currently spooled across all registered queues.
    pub queued_images: usize,
    /// Upload tasks in flight right now.
    pub active_uploads: usize,
    /// When an upload last finished.
    pub last_upload_time: Option<DateTime<Utc>>,
    /// When an upload last succeeded.
    pub last_success_time: Option<DateTime<Utc>>,
    /// When an upload last failed.
    pub last_failure_time: Option<DateTime<Utc>>,
    /// The last failure, verbatim.
    pub last_failure_reason: Option<String>,
    /// Successful uploads over the past minute.
    pub uploads_per_minute: u64,
    /// Consecutive failure count per camera.
    pub consecutive_failures: HashMap<String, u32>,
}

/// Build the remote object path for one image:
/// `<base_or_camera_id stripped of trailing '/'>/<observation_unix_ms>.jpg`.
pub fn remote_path_for(base: Option<&str>, camera_id: &str, image: &QueuedImage) -> String {
    let base = base.unwrap_or(camera_id).trim_end_matches('/');
    format!("{base}/{}", image.filename)
}

/// Round-robin, bounded-concurrency, fail2ban-aware upload scheduler.
pub struct UploadWorker {
    config: UploadConfig,
    cameras: tokio::sync::RwLock<HashMap<String, CameraEntry>>,
    in_flight: std::sync::Mutex<HashSet<PathBuf>>,
    conn_gate: tokio::sync::Mutex<Option<tokio::time::Instant>>,
    active: AtomicUsize,
    task_tx: mpsc::Sender<UploadTask>,
    task_rx: std::sync::Mutex<Option<mpsc::Receiver<UploadTask>>>,
    stats: std::sync::Mutex<UploadStatsInner>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for UploadWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadWorker")
            .field("max_concurrent", &self.config.max_concurrent)
            .finish_non_exhaustive()
    }
}

struct TaskGuard<'worker> {
    worker: &'worker UploadWorker,
    path: PathBuf,
}

impl Drop for TaskGuard<'_> {
    // Bookkeeping must survive panics in the task body.
    fn drop(&mut self) {
        let _ = self
            .worker
            .in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&self.path);
        let _ = self.worker.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl UploadWorker {
    /// Build a worker; call [`run`](Self::run) to start it.
    pub fn new(config: UploadConfig, cancel: CancellationToken) -> Arc<Self> {
        let capacity = config.max_concurrent.max(1) * 2;
        let (task_tx, task_rx) = mpsc::channel(capacity);
        Arc::new(Self {
            config,
            cameras: tokio::sync::RwLock::new(HashMap::new()),
            in_flight: std::sync::Mutex::new(HashSet::new()),
            conn_gate: tokio::sync::Mutex::new(None),
            active: AtomicUsize::new(0),
            task_tx,
            task_rx: std::sync::Mutex::new(Some(task_rx)),
            stats: std::sync::Mutex::new(UploadStatsInner::default()),
            cancel,
        })
    }

    /// Register a camera; hot-adding while running is fine.
    pub async fn add_camera(
        &self,
        queue: Arc<ImageQueue>,
        config: CameraUploadConfig,
        uploader: Arc<dyn Uploader>,
    ) {
        let camera_id = queue.camera_id().to_owned();
        let _ = self.cameras.write().await.insert(
            camera_id.clone(),
            CameraEntry {
                queue,
                config,
                uploader,
                fail: UploadFailureState::default(),
                last_upload: None,
            },
        );
        tracing::info!(camera = %camera_id, "camera registered for upload");
    }

    /// Deregister a camera. In-flight uploads for it finish on their own.
    pub async fn remove_camera(&self, camera_id: &str) {
        if self.cameras.write().await.remove(camera_id).is_some() {
            tracing::info!(camera = camera_id, "camera deregistered from upload");
        }
    }

    /// Stop the worker. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Per-camera failure state, for status surfaces.
    pub async fn failure_state(&self, camera_id: &str) -> Option<UploadFailureState> {
        self.cameras
            .read()
            .await
            .get(camera_id)
            .map(|entry| entry.fail.clone())
    }

    /// Current statistics.
    #[allow(clippy::as_conversions)]
    pub async fn stats(&self) -> UploadStatsSnapshot {
        let cameras = self.cameras.read().await;
        let mut queued_images = 0;
        let mut consecutive_failures = HashMap::with_capacity(cameras.len());
        for (id, entry) in cameras.iter() {
            queued_images += entry.queue.len().await;
            let _ = consecutive_failures.insert(id.clone(), entry.fail.consecutive_failures);
        }
        drop(cameras);

        let now = Utc::now();
        let inner = self
            .stats
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let uploads_per_minute = inner
            .recent_successes
            .iter()
            .filter(|at| now.signed_duration_since(**at) <= TimeDelta::seconds(60))
            .count();
        UploadStatsSnapshot {
            uploads_total: inner.total,
            uploads_success: inner.success,
            uploads_failed: inner.failed,
            uploads_retried: inner.retried,
            auth_failures: inner.auth_failures,
            uploads_today: inner.uploads_today,
            queued_images,
            active_uploads: self.active.load(Ordering::Acquire),
            last_upload_time: inner.last_upload,
            last_success_time: inner.last_success,
            last_failure_time: inner.last_failure,
            last_failure_reason: inner.last_failure_reason.clone(),
            uploads_per_minute: uploads_per_minute as u64,
            consecutive_failures,
        }
    }

    /// Run consumers and the coordinator until cancelled. A coordinator
    /// panic restarts it after ten seconds; consumer bookkeeping is cleaned
    /// up by guards even when a task body panics.
    pub async fn run(self: Arc<Self>) {
        let receiver = self
            .task_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(receiver) = receiver else {
            tracing::error!("upload worker started twice; ignoring the second start");
            return;
        };
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        for index in 0..self.config.max_concurrent.max(1) {
            let worker = Arc::clone(&self);
            let receiver = Arc::clone(&receiver);
            drop(tokio::spawn(async move {
                worker.consume(receiver, index).await;
            }));
        }

        loop {
            let result = AssertUnwindSafe(self.coordinate()).catch_unwind().await;
            if let Err(panic) = result {
                tracing::error!(
                    panic = %panic_message(panic.as_ref()),
                    "upload coordinator panicked; restarting"
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

    async fn coordinate(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut rotation = 0_usize;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = self.cancel.cancelled() => return,
            }
            rotation = self.schedule_round(rotation).await;
        }
    }

    /// One scheduling pass. Returns the next round-robin offset.
    async fn schedule_round(&self, rotation: usize) -> usize {
        let slots = self
            .config
            .max_concurrent
            .saturating_sub(self.active.load(Ordering::Acquire));
        if slots == 0 {
            return rotation;
        }

        let cameras = self.cameras.read().await;
        if cameras.is_empty() {
            return rotation;
        }
        let mut ids: Vec<&String> = cameras.keys().collect();
        ids.sort();

        let mut queued_total = 0;
        for entry in cameras.values() {
            queued_total += entry.queue.len().await;
        }
        // Deep backlog flips to newest-first so the site stays fresh while
        // the backlog drains from behind.
        let newest_first = queued_total > self.config.catchup_threshold;

        let count = ids.len();
        let mut dispatched = 0_usize;
        for offset in 0..count {
            if dispatched >= slots {
                break;
            }
            let camera_id = ids[(rotation + offset) % count];
            let entry = &cameras[camera_id];
            if !entry.config.enabled {
                continue;
            }
            let now = Utc::now();
            if entry.fail.backoff_until.is_some_and(|until| now < until) {
                continue;
            }
            let min_interval = self.config.min_upload_interval();
            if !min_interval.is_zero()
                && entry.last_upload.is_some_and(|at| {
                    now.signed_duration_since(at)
                        < TimeDelta::from_std(min_interval).unwrap_or(TimeDelta::MAX)
                })
            {
                continue;
            }

            let candidate = if newest_first {
                entry.queue.dequeue_newest().await
            } else {
                entry.queue.dequeue().await
            };
            let image = match candidate {
                Ok(image) => image,
                Err(QueueError::Empty) => continue,
                Err(error) => {
                    tracing::warn!(camera = camera_id.as_str(), %error, "dequeue failed");
                    continue;
                }
            };

            {
                let mut in_flight = self
                    .in_flight
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if !in_flight.insert(image.path.clone()) {
                    // Already dispatched; this camera has an upload running.
                    continue;
                }
            }

            let task = UploadTask {
                camera_id: camera_id.clone(),
                remote_path: remote_path_for(
                    entry.config.remote_path.as_deref(),
                    camera_id,
                    &image,
                ),
                image,
            };
            match self.task_tx.try_send(task) {
                Ok(()) => {
                    let _ = self.active.fetch_add(1, Ordering::AcqRel);
                    dispatched += 1;
                }
                Err(mpsc::error::TrySendError::Full(task)
                | mpsc::error::TrySendError::Closed(task)) => {
                    let _ = self
                        .in_flight
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .remove(&task.image.path);
                    break;
                }
            }
        }
        (rotation + 1) % count
    }

    async fn consume(
        self: Arc<Self>,
        receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<UploadTask>>>,
        index: usize,
    ) {
        loop {
            let task = {
                let mut receiver = receiver.lock().await;
                tokio::select! {
                    task = receiver.recv() => task,
                    () = self.cancel.cancelled() => None,
                }
            };
            let Some(task) = task else { return };
            tracing::debug!(
                worker = index,
                camera = %task.camera_id,
                file = %task.image.filename,
                "upload task picked up"
            );
            self.run_task(task).await;
        }
    }

    async fn run_task(&self, task: UploadTask) {
        let _guard = TaskGuard {
            worker: self,
            path: task.image.path.clone(),
        };
        let result = AssertUnwindSafe(self.upload_with_retry(&task))
            .catch_unwind()
            .await;
        if let Err(panic) = result {
            let message = panic_message(panic.as_ref());
            tracing::error!(
                camera = %task.camera_id,
                file = %task.image.filename,
                panic = %message,
                "upload task panicked"
            );
            self.record_failure(
                &task.camera_id,
                &UploadError::new(format!("upload panicked: {message}")),
                UploadErrorKind::Panic,
            )
            .await;
        }
    }

    #[tracing::instrument(skip(self, task), fields(camera = %task.camera_id, file = %task.image.filename))]
    async fn upload_with_retry(&self, task: &UploadTask) {
        let Some((queue, uploader)) = self.cameras.read().await.get(&task.camera_id).map(
            |entry| (Arc::clone(&entry.queue), Arc::clone(&entry.uploader)),
        ) else {
            tracing::debug!("camera removed while its upload was queued; dropping");
            return;
        };

        let bytes = match tokio::fs::read(&task.image.path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                // Thinned or expired between dispatch and pickup.
                tracing::debug!("image vanished before upload; dropping");
                return;
            }
            Err(error) => {
                self.record_failure(
                    &task.camera_id,
                    &UploadError::new(format!("spool read failed: {error}")),
                    UploadErrorKind::Transient,
                )
                .await;
                return;
            }
        };

        #[allow(clippy::as_conversions)]
        let attempt_timeout = self.config.attempt_timeout(bytes.len() as u64);

        match self
            .attempt(&*uploader, &task.remote_path, &bytes, attempt_timeout)
            .await
        {
            Ok(()) => {
                self.finish_success(task, &queue).await;
                return;
            }
            Err(error) => {
                if error.kind() == UploadErrorKind::Auth {
                    self.record_auth_failure(&task.camera_id, &error).await;
                    return;
                }
                tracing::debug!(%error, "upload failed; retrying once");
            }
        }

        tokio::select! {
            () = tokio::time::sleep(self.config.retry_delay()) => {}
            () = self.cancel.cancelled() => return,
        }
        {
            let mut stats = self
                .stats
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            stats.retried += 1;
        }

        match self
            .attempt(&*uploader, &task.remote_path, &bytes, attempt_timeout)
            .await
        {
            Ok(()) => self.finish_success(task, &queue).await,
            Err(error) => {
                if error.kind() == UploadErrorKind::Auth {
                    self.record_auth_failure(&task.camera_id, &error).await;
                } else {
                    self.record_failure(&task.camera_id, &error, error.kind()).await;
                }
            }
        }
    }

    async fn attempt(
        &self,
        uploader: &dyn Uploader,
        remote_path: &str,
        bytes: &[u8],
        attempt_timeout: Duration,
    ) -> Result<(), UploadError> {
        // fail2ban avoidance: no two connection establishments closer than
        // the configured interval, bridge-wide.
        {
            let mut gate = self.conn_gate.lock().await;
            let interval = self.config.connection_interval();
            if let Some(last) = *gate {
                let elapsed = last.elapsed();
                if elapsed < interval {
                    tokio::time::sleep(interval - elapsed).await;
                }
            }
            *gate = Some(tokio::time::Instant::now());
        }

        match tokio::time::timeout(attempt_timeout, uploader.upload(remote_path, bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(error),
            Err(_elapsed) => Err(UploadError::new(format!(
                "upload timed out after {attempt_timeout:?}"
            ))),
        }
    }

    async fn finish_success(&self, task: &UploadTask, queue: &Arc<ImageQueue>) {
        if let Err(error) = queue.mark_uploaded(&task.image).await {
            tracing::warn!(%error, "mark_uploaded failed after a successful upload");
        }
        let now = Utc::now();
        {
            let mut cameras = self.cameras.write().await;
            if let Some(entry) = cameras.get_mut(&task.camera_id) {
                entry.fail.consecutive_failures = 0;
                entry.fail.backoff_until = None;
                entry.last_upload = Some(now);
            }
        }
        {
            let mut stats = self
                .stats
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            stats.total += 1;
            stats.success += 1;
            // Day boundary is UTC for fleet-wide determinism.
            let today = now.date_naive();
            if stats.today.is_none_or(|day| today > day) {
                stats.today = Some(today);
                stats.uploads_today = 0;
            }
            stats.uploads_today += 1;
            stats.last_upload = Some(now);
            stats.last_success = Some(now);
            stats.recent_successes.push_back(now);
            while stats.recent_successes.len() > RATE_WINDOW {
                let _ = stats.recent_successes.pop_front();
            }
        }
        tracing::info!(
            camera = %task.camera_id,
            remote = %task.remote_path,
            "image uploaded"
        );
    }

    async fn record_auth_failure(&self, camera_id: &str, error: &UploadError) {
        let now = Utc::now();
        let backoff = self.config.auth_backoff();
        {
            let mut cameras = self.cameras.write().await;
            if let Some(entry) = cameras.get_mut(camera_id) {
                entry.fail.consecutive_failures += 1;
                entry.fail.last_failure = Some(now);
                entry.fail.last_auth_failure = Some(now);
                entry.fail.backoff_until =
                    Some(now + TimeDelta::from_std(backoff).unwrap_or(TimeDelta::MAX));
            }
        }
        self.note_failure(now, error);
        {
            let mut stats = self
                .stats
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            stats.auth_failures += 1;
        }
        tracing::warn!(
            camera = camera_id,
            %error,
            ?backoff,
            "credential failure; no retry, camera backed off"
        );
    }

    async fn record_failure(&self, camera_id: &str, error: &UploadError, kind: UploadErrorKind) {
        let now = Utc::now();
        {
            let mut cameras = self.cameras.write().await;
            if let Some(entry) = cameras.get_mut(camera_id) {
                entry.fail.consecutive_failures += 1;
                entry.fail.last_failure = Some(now);
                if entry.fail.consecutive_failures > 3 {
                    let backoff = Duration::from_secs(5)
                        .saturating_mul(entry.fail.consecutive_failures)
                        .min(Duration::from_secs(30));
                    entry.fail.backoff_until =
                        Some(now + TimeDelta::from_std(backoff).unwrap_or(TimeDelta::MAX));
                }
            }
        }
        self.note_failure(now, error);
        tracing::warn!(camera = camera_id, %error, ?kind, "upload failed");
    }

    fn note_failure(&self, now: DateTime<Utc>, error: &UploadError) {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        stats.total += 1;
        stats.failed += 1;
        stats.last_upload = Some(now);
        stats.last_failure = Some(now);
        stats.last_failure_reason = Some(error.message.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::test_utils::MockUploader;
    use crate::time::ObservationResult;

    async fn spooled_queue(
        dir: &std::path::Path,
        camera_id: &str,
        images: usize,
    ) -> Arc<ImageQueue> {
        let queue = ImageQueue::new(
            camera_id,
            dir.join(camera_id),
            QueueConfig {
                thinning_enabled: false,
                pause_capture_on_critical: false,
                ..QueueConfig::default()
            },
        )
        .await
        .expect("queue");
        let base = Utc::now() - TimeDelta::seconds(60);
        for i in 0..images {
            let _ = queue
                .enqueue(
                    &vec![0xCD_u8; 2048],
                    &ObservationResult::bridge(base + TimeDelta::seconds(i as i64)),
                )
                .await
                .expect("enqueue");
        }
        queue
    }

    fn worker(config: UploadConfig) -> (Arc<UploadWorker>, CancellationToken) {
        let cancel = CancellationToken::new();
        (UploadWorker::new(config, cancel.clone()), cancel)
    }

    macro_rules! wait_until {
        ($deadline:expr, $cond:expr) => {
            tokio::time::timeout($deadline, async {
                while !$cond {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            })
            .await
            .expect("condition not reached in time")
        };
    }

    #[tokio::test(start_paused = true)]
    async fn uploads_drain_the_queue_oldest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = spooled_queue(dir.path(), "cam1", 2).await;
        let uploader = Arc::new(MockUploader::new());
        let (worker, _cancel) = worker(UploadConfig::default());
        worker
            .add_camera(Arc::clone(&queue), CameraUploadConfig::default(), Arc::clone(&uploader) as Arc<dyn Uploader>)
            .await;

        let handle = tokio::spawn(Arc::clone(&worker).run());
        wait_until!(Duration::from_secs(120), queue.is_empty().await);
        worker.stop();
        handle.await.expect("worker task");

        let calls = uploader.calls();
        assert_eq!(calls.len(), 2);
        // FIFO: the oldest filename ships first, under the camera-id base.
        assert!(calls[0].remote_path.starts_with("cam1/"));
        assert!(calls[0].remote_path < calls[1].remote_path);

        let stats = worker.stats().await;
        assert_eq!(stats.uploads_success, 2);
        assert_eq!(stats.uploads_failed, 0);
        assert_eq!(stats.uploads_today, 2);
        assert_eq!(stats.queued_images, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_starts_are_rate_limited() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = spooled_queue(dir.path(), "cam1", 3).await;
        let uploader = Arc::new(MockUploader::new());
        let (worker, _cancel) = worker(UploadConfig {
            connection_interval_seconds: 2,
            ..UploadConfig::default()
        });
        worker
            .add_camera(Arc::clone(&queue), CameraUploadConfig::default(), Arc::clone(&uploader) as Arc<dyn Uploader>)
            .await;

        let handle = tokio::spawn(Arc::clone(&worker).run());
        wait_until!(Duration::from_secs(120), queue.is_empty().await);
        worker.stop();
        handle.await.expect("worker task");

        let calls = uploader.calls();
        assert_eq!(calls.len(), 3);
        for pair in calls.windows(2) {
            assert!(
                pair[1].at.duration_since(pair[0].at) >= Duration::from_secs(2),
                "uploads started {:?} apart",
                pair[1].at.duration_since(pair[0].at)
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failures_skip_the_retry_and_back_the_camera_off() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bad_queue = spooled_queue(dir.path(), "cam1", 1).await;
        let good_queue = spooled_queue(dir.path(), "cam2", 1).await;
        let bad_uploader =
            Arc::new(MockUploader::new().scripted([Err(UploadError::new("401 Unauthorized"))]));
        let good_uploader = Arc::new(MockUploader::new());
        let (worker, _cancel) = worker(UploadConfig::default());
        worker
            .add_camera(Arc::clone(&bad_queue), CameraUploadConfig::default(), Arc::clone(&bad_uploader) as Arc<dyn Uploader>)
            .await;
        worker
            .add_camera(Arc::clone(&good_queue), CameraUploadConfig::default(), Arc::clone(&good_uploader) as Arc<dyn Uploader>)
            .await;

        let handle = tokio::spawn(Arc::clone(&worker).run());
        // The healthy camera drains; the auth-failing one must not.
        wait_until!(Duration::from_secs(30), good_queue.is_empty().await);
        wait_until!(Duration::from_secs(30), worker.stats().await.auth_failures >= 1);
        worker.stop();
        handle.await.expect("worker task");

        // Exactly one attempt: auth failures never retry.
        assert_eq!(bad_uploader.calls().len(), 1);
        // The image stays spooled.
        assert_eq!(bad_queue.len().await, 1);

        let fail = worker.failure_state("cam1").await.expect("state");
        assert_eq!(fail.consecutive_failures, 1);
        assert!(fail.last_auth_failure.is_some());
        let backoff_until = fail.backoff_until.expect("backoff");
        let remaining = backoff_until.signed_duration_since(Utc::now());
        assert!(remaining <= TimeDelta::seconds(60));
        assert!(remaining > TimeDelta::seconds(30));

        let stats = worker.stats().await;
        assert_eq!(stats.auth_failures, 1);
        assert_eq!(stats.uploads_success, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_exactly_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = spooled_queue(dir.path(), "cam1", 1).await;
        let uploader = Arc::new(
            MockUploader::new().scripted([Err(UploadError::new("connection reset by peer"))]),
        );
        let (worker, _cancel) = worker(UploadConfig::default());
        worker
            .add_camera(Arc::clone(&queue), CameraUploadConfig::default(), Arc::clone(&uploader) as Arc<dyn Uploader>)
            .await;

        let handle = tokio::spawn(Arc::clone(&worker).run());
        wait_until!(Duration::from_secs(120), queue.is_empty().await);
        worker.stop();
        handle.await.expect("worker task");

        // First attempt failed, the single retry succeeded.
        assert_eq!(uploader.calls().len(), 2);
        let stats = worker.stats().await;
        assert_eq!(stats.uploads_retried, 1);
        assert_eq!(stats.uploads_success, 1);
        assert_eq!(stats.uploads_failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deep_backlog_flips_to_newest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = spooled_queue(dir.path(), "cam1", 5).await;
        let newest = queue.dequeue_newest().await.expect("newest").filename;
        let uploader = Arc::new(MockUploader::new());
        let (worker, _cancel) = worker(UploadConfig {
            catchup_threshold: 3,
            ..UploadConfig::default()
        });
        worker
            .add_camera(Arc::clone(&queue), CameraUploadConfig::default(), Arc::clone(&uploader) as Arc<dyn Uploader>)
            .await;

        let handle = tokio::spawn(Arc::clone(&worker).run());
        wait_until!(Duration::from_secs(300), queue.is_empty().await);
        worker.stop();
        handle.await.expect("worker task");

        let calls = uploader.calls();
        assert_eq!(calls.len(), 5);
        assert_eq!(
            calls[0].remote_path,
            format!("cam1/{newest}"),
            "catch-up mode must ship the newest image first"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn removed_cameras_stop_being_scheduled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = spooled_queue(dir.path(), "cam1", 1).await;
        let uploader = Arc::new(MockUploader::new());
        let (worker, _cancel) = worker(UploadConfig::default());
        worker
            .add_camera(Arc::clone(&queue), CameraUploadConfig::default(), Arc::clone(&uploader) as Arc<dyn Uploader>)
            .await;
        worker.remove_camera("cam1").await;

        let handle = tokio::spawn(Arc::clone(&worker).run());
        tokio::time::sleep(Duration::from_secs(10)).await;
        worker.stop();
        handle.await.expect("worker task");

        assert!(uploader.calls().is_empty());
        assert_eq!(queue.len().await, 1);
    }

    #[test]
    fn remote_paths_strip_trailing_slashes() {
        let image = QueuedImage {
            filename: "1700000000000.jpg".to_owned(),
            path: PathBuf::from("/spool/cam1/1700000000000.jpg"),
            size_bytes: 2048,
            observation_time: Utc::now(),
            source: crate::time::TimeSource::BridgeClock,
            confidence: crate::time::TimeConfidence::High,
        };
        assert_eq!(
            remote_path_for(Some("weather/kpao/"), "cam1", &image),
            "weather/kpao/1700000000000.jpg"
        );
        assert_eq!(remote_path_for(None, "cam1", &image), "cam1/1700000000000.jpg");
    }
}
