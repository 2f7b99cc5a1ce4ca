//! Global spool ownership and cross-camera pressure response.

use super::{ImageQueue, QueueState};
use crate::config::{ManagerConfig, QueueConfig};
use crate::errors::QueueError;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use sysinfo::{Disks, Pid, System};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Aggregated view across all queues, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    /// Number of registered queues.
    pub queue_count: usize,
    /// Images spooled across all queues.
    pub total_images: usize,
    /// Bytes spooled across all queues.
    pub total_size_bytes: u64,
    /// Resident set size of the bridge process, zero when unknown.
    pub process_rss_bytes: u64,
    /// Capacity of the filesystem carrying the spool, when resolvable.
    pub fs_total_bytes: Option<u64>,
    /// Free space on that filesystem.
    pub fs_available_bytes: Option<u64>,
    /// Per-queue snapshots.
    pub queues: Vec<QueueState>,
}

/// Owns every per-camera queue and runs the global pressure sweeps.
pub struct QueueManager {
    config: ManagerConfig,
    queues: RwLock<HashMap<String, Arc<ImageQueue>>>,
    system: std::sync::Mutex<System>,
    pid: Option<Pid>,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("base_path", &self.config.base_path)
            .finish_non_exhaustive()
    }
}

impl QueueManager {
    /// Create the manager and its spool root.
    pub async fn new(config: ManagerConfig) -> Result<Arc<Self>, QueueError> {
        tokio::fs::create_dir_all(&config.base_path).await?;
        Ok(Arc::new(Self {
            config,
            queues: RwLock::new(HashMap::new()),
            system: std::sync::Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }))
    }

    /// The configured spool root.
    pub fn base_path(&self) -> &std::path::Path {
        &self.config.base_path
    }

    /// Create a queue under `<base>/<camera_id>`. Fails if the id is taken.
    pub async fn create_queue(
        &self,
        camera_id: &str,
        config: QueueConfig,
    ) -> Result<Arc<ImageQueue>, QueueError> {
        let mut queues = self.queues.write().await;
        if queues.contains_key(camera_id) {
            return Err(QueueError::AlreadyExists(camera_id.to_owned()));
        }
        let queue = ImageQueue::new(
            camera_id,
            self.config.base_path.join(camera_id),
            config,
        )
        .await?;
        let _ = queues.insert(camera_id.to_owned(), Arc::clone(&queue));
        tracing::info!(camera = camera_id, dir = %queue.dir().display(), "queue created");
        Ok(queue)
    }

    /// Look a queue up by camera id.
    pub async fn get(&self, camera_id: &str) -> Option<Arc<ImageQueue>> {
        self.queues.read().await.get(camera_id).map(Arc::clone)
    }

    /// Tear a queue down and delete its directory with everything spooled.
    pub async fn remove(&self, camera_id: &str) -> Result<(), QueueError> {
        let queue = self
            .queues
            .write()
            .await
            .remove(camera_id)
            .ok_or_else(|| QueueError::NotFound(camera_id.to_owned()))?;
        match tokio::fs::remove_dir_all(queue.dir()).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }
        tracing::info!(camera = camera_id, "queue removed");
        Ok(())
    }

    /// Snapshot of all registered queues.
    pub async fn queues(&self) -> Vec<Arc<ImageQueue>> {
        self.queues.read().await.values().map(Arc::clone).collect()
    }

    /// Sum of images spooled across all queues.
    pub async fn total_queued(&self) -> usize {
        let queues = self.queues().await;
        let mut total = 0;
        for queue in queues {
            total += queue.len().await;
        }
        total
    }

    /// Aggregated stats, including process RSS and filesystem headroom.
    pub async fn stats(&self) -> ManagerStats {
        let queues = self.queues().await;
        let mut states = Vec::with_capacity(queues.len());
        for queue in &queues {
            states.push(queue.state().await);
        }
        let (fs_total, fs_available) = self
            .filesystem_usage()
            .map_or((None, None), |(total, available)| {
                (Some(total), Some(available))
            });
        ManagerStats {
            queue_count: states.len(),
            total_images: states.iter().map(|state| state.image_count).sum(),
            total_size_bytes: states.iter().map(|state| state.total_size_bytes).sum(),
            process_rss_bytes: self.process_rss_bytes(),
            fs_total_bytes: fs_total,
            fs_available_bytes: fs_available,
            queues: states,
        }
    }

    /// Run the memory/disk pressure sweep until cancelled. The first sweep
    /// happens one full period after start.
    pub async fn run_memory_monitor(&self, cancel: CancellationToken) {
        let period = self.config.memory_check_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.enforce_total_size().await;
                    self.enforce_filesystem_headroom().await;
                    self.enforce_heap_limit().await;
                }
                () = cancel.cancelled() => return,
            }
        }
    }

    /// Run the age-expiry sweep until cancelled. The first sweep happens one
    /// full period after start.
    pub async fn run_expiry(&self, cancel: CancellationToken) {
        let period = self.config.expiry_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => { let _ = self.expire_all().await; }
                () = cancel.cancelled() => return,
            }
        }
    }

    /// Expire stale images on every queue. Returns the total removed.
    pub async fn expire_all(&self) -> usize {
        let mut removed = 0;
        for queue in self.queues().await {
            match queue.expire().await {
                Ok(count) => removed += count,
                Err(error) => {
                    tracing::warn!(camera = queue.camera_id(), %error, "expiry sweep failed");
                }
            }
        }
        removed
    }

    pub(crate) async fn enforce_total_size(&self) {
        let queues = self.queues().await;
        let mut total: u64 = 0;
        for queue in &queues {
            total += queue.state().await.total_size_bytes;
        }
        let limit = self.config.max_total_size_mb * 1024 * 1024;
        if total <= limit {
            return;
        }
        tracing::warn!(
            total_bytes = total,
            limit_bytes = limit,
            "spool exceeds the global size cap; emergency thinning every queue"
        );
        self.emergency_thin_all(self.config.emergency_thin_ratio)
            .await;
    }

    #[allow(clippy::as_conversions, clippy::cast_precision_loss)]
    pub(crate) async fn enforce_filesystem_headroom(&self) {
        let Some((total, available)) = self.filesystem_usage() else {
            return;
        };
        if total == 0 {
            return;
        }
        let free_fraction = available as f64 / total as f64;
        if free_fraction < 0.10 {
            tracing::warn!(
                free_fraction,
                "spool filesystem nearly full; shedding hard"
            );
            self.emergency_thin_all(0.3).await;
        } else if free_fraction < 0.20 {
            tracing::warn!(free_fraction, "spool filesystem low on space; shedding");
            self.emergency_thin_all(0.5).await;
        }
    }

    pub(crate) async fn enforce_heap_limit(&self) {
        let rss = self.process_rss_bytes();
        let limit = self.config.max_heap_mb * 1024 * 1024;
        if rss == 0 || rss <= limit {
            return;
        }
        // There is no collector to kick here; shedding spool references is
        // the only lever the bridge has.
        tracing::warn!(
            rss_bytes = rss,
            limit_bytes = limit,
            "process heap over budget; emergency thinning and requesting compaction"
        );
        self.emergency_thin_all(0.3).await;
    }

    async fn emergency_thin_all(&self, keep_ratio: f64) {
        for queue in self.queues().await {
            if let Err(error) = queue.emergency_thin(keep_ratio).await {
                tracing::warn!(camera = queue.camera_id(), %error, "emergency thin failed");
            }
        }
    }

    fn process_rss_bytes(&self) -> u64 {
        let Some(pid) = self.pid else { return 0 };
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !system.refresh_process(pid) {
            return 0;
        }
        system.process(pid).map_or(0, sysinfo::Process::memory)
    }

    /// Usage of the filesystem the spool root sits on, as
    /// `(total, available)` bytes.
    fn filesystem_usage(&self) -> Option<(u64, u64)> {
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| self.config.base_path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| (disk.total_space(), disk.available_space()))
    }
}
