//! Lifecycle wiring of the whole bridge.

use crate::camera::{Camera, CameraKind};
use crate::capture::{
    CameraState, CaptureCallback, CaptureSetup, CaptureStatsSnapshot, CaptureWorker,
    ImageProcessor,
};
use crate::config::{AuthorityConfig, BridgeConfig, CaptureConfig, QueueConfig};
use crate::exif::{ExifStats, ExifTool};
use crate::limiter::ResourceLimiter;
use crate::queue::{ManagerStats, QueueManager, QueueState};
use crate::time::{TimeAuthority, TimeHealth, TimeHealthSnapshot};
use crate::upload::{
    CameraUploadConfig, UploadFailureState, UploadStatsSnapshot, UploadWorker,
};
use crate::uploader::Uploader;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything needed to wire one camera into the bridge.
pub struct CameraSetup {
    /// The camera driver.
    pub camera: Arc<dyn Camera>,
    /// Spool bounds for this camera.
    pub queue: QueueConfig,
    /// Capture pacing and backoff.
    pub capture: CaptureConfig,
    /// Upload routing.
    pub upload: CameraUploadConfig,
    /// Destination for this camera's images.
    pub uploader: Arc<dyn Uploader>,
    /// Optional image processor.
    pub processor: Option<Arc<dyn ImageProcessor>>,
    /// Optional post-capture callback.
    pub on_capture: Option<CaptureCallback>,
}

impl std::fmt::Debug for CameraSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraSetup")
            .field("camera", &self.camera.id())
            .finish_non_exhaustive()
    }
}

/// Live view of one camera and its pipeline legs.
#[derive(Debug, Clone, Serialize)]
pub struct CameraStatus {
    /// Camera id.
    pub camera_id: String,
    /// Driver kind.
    pub kind: CameraKind,
    /// Capture counters.
    pub capture: CaptureStatsSnapshot,
    /// Scheduler-side camera state (backoff, errors).
    pub state: CameraState,
    /// Spool state.
    pub queue: QueueState,
    /// Upload failure state, when the upload worker knows this camera.
    pub upload_failures: Option<UploadFailureState>,
}

/// Aggregated live view of the whole bridge.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    /// Per-camera views.
    pub cameras: Vec<CameraStatus>,
    /// Upload worker statistics, once the first camera was added.
    pub upload: Option<UploadStatsSnapshot>,
    /// Queue manager aggregates.
    pub manager: ManagerStats,
    /// NTP healthcheck snapshot, when configured.
    pub time_health: Option<TimeHealthSnapshot>,
    /// Metadata tool failure counters, when configured.
    pub exif: Option<ExifStats>,
}

struct CameraRuntime {
    worker: Arc<CaptureWorker>,
    handle: Option<JoinHandle<()>>,
}

/// Owns the shared dependencies and the lifecycles of every worker.
pub struct Bridge {
    config: BridgeConfig,
    manager: Arc<QueueManager>,
    limiter: Arc<ResourceLimiter>,
    exif: Option<Arc<ExifTool>>,
    authority_config: std::sync::Mutex<AuthorityConfig>,
    authority: std::sync::RwLock<Arc<TimeAuthority>>,
    time_health: std::sync::Mutex<Option<Arc<TimeHealth>>>,
    upload: tokio::sync::Mutex<Option<Arc<UploadWorker>>>,
    cameras: tokio::sync::RwLock<HashMap<String, CameraRuntime>>,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("started", &self.started.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Bridge {
    /// Build a bridge from configuration. No worker runs until
    /// [`start`](Self::start).
    pub async fn new(config: BridgeConfig) -> eyre::Result<Self> {
        let manager = QueueManager::new(config.manager.clone()).await?;
        let limiter = Arc::new(ResourceLimiter::new(config.limiter.clone()));
        let exif = config
            .metadata_tool
            .clone()
            .map(|tool| Arc::new(ExifTool::new(tool, Arc::clone(&limiter))));
        let authority = Arc::new(TimeAuthority::new(config.authority.clone(), None)?);
        Ok(Self {
            authority_config: std::sync::Mutex::new(config.authority.clone()),
            config,
            manager,
            limiter,
            exif,
            authority: std::sync::RwLock::new(authority),
            time_health: std::sync::Mutex::new(None),
            upload: tokio::sync::Mutex::new(None),
            cameras: tokio::sync::RwLock::new(HashMap::new()),
            background: std::sync::Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }

    /// The shared queue manager.
    pub fn queue_manager(&self) -> &Arc<QueueManager> {
        &self.manager
    }

    /// The shared resource limiter.
    pub fn resource_limiter(&self) -> &Arc<ResourceLimiter> {
        &self.limiter
    }

    fn current_authority(&self) -> Arc<TimeAuthority> {
        Arc::clone(
            &self
                .authority
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    /// Wire a camera in: queue, capture worker, upload registration. When the
    /// bridge is already running the new worker starts immediately.
    #[tracing::instrument(skip_all, fields(camera = setup.camera.id()))]
    pub async fn add_camera(&self, setup: CameraSetup) -> eyre::Result<()> {
        setup.queue.validate()?;
        let camera_id = setup.camera.id().to_owned();
        let queue = self.manager.create_queue(&camera_id, setup.queue).await?;

        // The upload worker exists from the first camera onward.
        let upload = {
            let mut slot = self.upload.lock().await;
            if slot.is_none() {
                let worker =
                    UploadWorker::new(self.config.upload.clone(), self.cancel.child_token());
                if self.started.load(Ordering::Acquire) {
                    self.spawn_background(tokio::spawn(Arc::clone(&worker).run()));
                }
                *slot = Some(worker);
            }
            Arc::clone(slot.as_ref().expect("just filled"))
        };
        upload
            .add_camera(Arc::clone(&queue), setup.upload, setup.uploader)
            .await;

        let worker = CaptureWorker::new(
            CaptureSetup {
                camera: setup.camera,
                queue,
                config: setup.capture,
                authority: self.current_authority(),
                limiter: Arc::clone(&self.limiter),
                exif: self.exif.clone(),
                processor: setup.processor,
                on_capture: setup.on_capture,
            },
            self.cancel.child_token(),
        );
        let handle = self
            .started
            .load(Ordering::Acquire)
            .then(|| tokio::spawn(Arc::clone(&worker).run()));

        let _ = self
            .cameras
            .write()
            .await
            .insert(camera_id.clone(), CameraRuntime { worker, handle });
        tracing::info!(camera = %camera_id, "camera added");
        Ok(())
    }

    /// Unwire a camera: stop its worker, drop its upload registration,
    /// delete its spool.
    pub async fn remove_camera(&self, camera_id: &str) -> eyre::Result<()> {
        let runtime = self
            .cameras
            .write()
            .await
            .remove(camera_id)
            .ok_or_else(|| eyre::eyre!("no camera {camera_id:?}"))?;
        runtime.worker.stop();
        if let Some(handle) = runtime.handle {
            let _ = handle.await;
        }
        if let Some(upload) = self.upload.lock().await.as_ref() {
            upload.remove_camera(camera_id).await;
        }
        self.manager.remove(camera_id).await?;
        tracing::info!(camera = camera_id, "camera removed");
        Ok(())
    }

    /// Install (or clear) the NTP healthcheck, rebuild the time authority
    /// around it and propagate the new authority to every capture worker.
    pub async fn set_time_health(
        &self,
        health: Option<Arc<TimeHealth>>,
    ) -> eyre::Result<()> {
        if let Some(health) = &health {
            if self.started.load(Ordering::Acquire) {
                let health = Arc::clone(health);
                let token = self.cancel.child_token();
                self.spawn_background(tokio::spawn(async move {
                    health.run(token).await;
                }));
            }
        }
        *self
            .time_health
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = health;
        self.rebuild_authority().await
    }

    /// Replace the authority configuration (timezone, drift thresholds) and
    /// propagate the rebuilt authority to every capture worker.
    pub async fn set_time_authority(&self, config: AuthorityConfig) -> eyre::Result<()> {
        *self
            .authority_config
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = config;
        self.rebuild_authority().await
    }

    async fn rebuild_authority(&self) -> eyre::Result<()> {
        let config = self
            .authority_config
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let health = self
            .time_health
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let authority = Arc::new(TimeAuthority::new(config, health)?);
        *self
            .authority
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::clone(&authority);
        for runtime in self.cameras.read().await.values() {
            runtime.worker.set_authority(Arc::clone(&authority));
        }
        Ok(())
    }

    fn spawn_background(&self, handle: JoinHandle<()>) {
        self.background
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(handle);
    }

    /// Start everything: manager sweeps, NTP healthcheck, upload worker and
    /// all capture workers.
    pub async fn start(&self) -> eyre::Result<()> {
        eyre::ensure!(
            !self.started.swap(true, Ordering::AcqRel),
            "bridge already started"
        );

        {
            let manager = Arc::clone(&self.manager);
            let token = self.cancel.child_token();
            self.spawn_background(tokio::spawn(async move {
                manager.run_memory_monitor(token).await;
            }));
            let manager = Arc::clone(&self.manager);
            let token = self.cancel.child_token();
            self.spawn_background(tokio::spawn(async move {
                manager.run_expiry(token).await;
            }));
        }

        let health = self
            .time_health
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(health) = health {
            let token = self.cancel.child_token();
            self.spawn_background(tokio::spawn(async move {
                health.run(token).await;
            }));
        }

        if let Some(upload) = self.upload.lock().await.as_ref() {
            self.spawn_background(tokio::spawn(Arc::clone(upload).run()));
        }

        let mut cameras = self.cameras.write().await;
        for runtime in cameras.values_mut() {
            if runtime.handle.is_none() {
                runtime.handle = Some(tokio::spawn(Arc::clone(&runtime.worker).run()));
            }
        }
        drop(cameras);

        tracing::info!("bridge started");
        Ok(())
    }

    /// Stop everything: capture first, then upload, then the shared context.
    pub async fn stop(&self) {
        let mut cameras = self.cameras.write().await;
        for runtime in cameras.values_mut() {
            runtime.worker.stop();
        }
        for runtime in cameras.values_mut() {
            if let Some(handle) = runtime.handle.take() {
                let _ = handle.await;
            }
        }
        drop(cameras);

        if let Some(upload) = self.upload.lock().await.as_ref() {
            upload.stop();
        }

        self.cancel.cancel();
        let handles = std::mem::take(
            &mut *self
                .background
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for handle in handles {
            let _ = handle.await;
        }
        self.started.store(false, Ordering::Release);
        tracing::info!("bridge stopped");
    }

    /// Aggregate live snapshots from every subsystem.
    pub async fn status(&self) -> BridgeStatus {
        let upload = self.upload.lock().await.clone();
        let mut cameras = Vec::new();
        {
            let runtimes = self.cameras.read().await;
            for (camera_id, runtime) in runtimes.iter() {
                let upload_failures = match &upload {
                    Some(upload) => upload.failure_state(camera_id).await,
                    None => None,
                };
                cameras.push(CameraStatus {
                    camera_id: camera_id.clone(),
                    kind: runtime.worker.camera_kind(),
                    capture: runtime.worker.stats(),
                    state: runtime.worker.state(),
                    queue: runtime.worker.queue().state().await,
                    upload_failures,
                });
            }
        }
        cameras.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));

        let upload_stats = match &upload {
            Some(upload) => Some(upload.stats().await),
            None => None,
        };
        BridgeStatus {
            cameras,
            upload: upload_stats,
            manager: self.manager.stats().await,
            time_health: self
                .time_health
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .as_ref()
                .map(|health| health.snapshot()),
            exif: self.exif.as_ref().map(|exif| exif.stats()),
        }
    }
}
