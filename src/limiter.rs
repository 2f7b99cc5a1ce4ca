//! Bounding of CPU-intensive work.
//!
//! Two counting semaphores gate the expensive sections of the pipeline
//! (image processing and metadata-tool subprocesses), and a cheap, cached
//! pressure score turns sustained load into a cooperative throttle delay for
//! the capture workers.

use crate::config::LimiterConfig;
use std::sync::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

/// The waiter was cancelled before a permit became available.
#[derive(Debug, Clone, Copy, Error)]
#[error("cancelled while waiting for a permit")]
pub struct AcquireCancelled;

#[derive(Debug, Clone, Copy)]
struct PressureCache {
    computed_at: Option<Instant>,
    delay: Duration,
}

/// Semaphore pair plus adaptive throttle.
pub struct ResourceLimiter {
    config: LimiterConfig,
    image_processing: Arc<Semaphore>,
    metadata_tool: Arc<Semaphore>,
    image_capacity: usize,
    metadata_capacity: usize,
    pressure: Mutex<PressureCache>,
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl std::fmt::Debug for ResourceLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLimiter")
            .field("image_capacity", &self.image_capacity)
            .field("metadata_capacity", &self.metadata_capacity)
            .finish_non_exhaustive()
    }
}

fn default_image_capacity(total_memory_bytes: u64) -> usize {
    const GIB: u64 = 1024 * 1024 * 1024;
    if total_memory_bytes < GIB {
        1
    } else {
        std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
            .div_euclid(2)
            .max(1)
    }
}

impl ResourceLimiter {
    /// Build a limiter; capacities not given explicitly are derived from the
    /// machine (1 image-processing permit below 1 GiB of RAM, otherwise half
    /// the cores; the metadata tool is always serialized by default).
    pub fn new(config: LimiterConfig) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let image_capacity = config
            .max_concurrent_image_processing
            .unwrap_or_else(|| default_image_capacity(system.total_memory()))
            .max(1);
        let metadata_capacity = config.max_concurrent_metadata_tool.max(1);
        Self {
            config,
            image_processing: Arc::new(Semaphore::new(image_capacity)),
            metadata_tool: Arc::new(Semaphore::new(metadata_capacity)),
            image_capacity,
            metadata_capacity,
            pressure: Mutex::new(PressureCache {
                computed_at: None,
                delay: Duration::ZERO,
            }),
            system: Mutex::new(system),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    async fn acquire(
        semaphore: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, AcquireCancelled> {
        tokio::select! {
            permit = Arc::clone(semaphore).acquire_owned() => {
                permit.map_err(|_closed| AcquireCancelled)
            }
            () = cancel.cancelled() => Err(AcquireCancelled),
        }
    }

    /// Wait for an image-processing permit; the permit is released on drop.
    pub async fn acquire_image_processing(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, AcquireCancelled> {
        Self::acquire(&self.image_processing, cancel).await
    }

    /// Take an image-processing permit only if one is free right now.
    pub fn try_acquire_image_processing(&self) -> Option<OwnedSemaphorePermit> {
        match Arc::clone(&self.image_processing).try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => None,
        }
    }

    /// Wait for a metadata-tool permit; the permit is released on drop.
    pub async fn acquire_metadata_tool(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, AcquireCancelled> {
        Self::acquire(&self.metadata_tool, cancel).await
    }

    /// Take a metadata-tool permit only if one is free right now.
    pub fn try_acquire_metadata_tool(&self) -> Option<OwnedSemaphorePermit> {
        match Arc::clone(&self.metadata_tool).try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => None,
        }
    }

    /// Configured image-processing capacity.
    pub fn image_processing_capacity(&self) -> usize {
        self.image_capacity
    }

    /// Permits currently held across both semaphores.
    pub fn permits_in_use(&self) -> usize {
        (self.image_capacity - self.image_processing.available_permits())
            + (self.metadata_capacity - self.metadata_tool.available_permits())
    }

    /// Cooperative yield point for CPU-heavy sections.
    pub async fn yield_now(&self) {
        tokio::task::yield_now().await;
    }

    /// How long a capture worker should sleep before its next capture.
    ///
    /// The score is recomputed at most once per configured interval; between
    /// recomputations the cached delay is returned, so this is cheap to call
    /// on every capture.
    pub fn throttle_delay(&self) -> Duration {
        let mut cache = self
            .pressure
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(computed_at) = cache.computed_at {
            if computed_at.elapsed() < self.config.pressure_check_interval() {
                return cache.delay;
            }
        }
        let delay = self.compute_throttle_delay();
        *cache = PressureCache {
            computed_at: Some(Instant::now()),
            delay,
        };
        delay
    }

    #[allow(
        clippy::as_conversions,
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn compute_throttle_delay(&self) -> Duration {
        let rss_mb = self.process_rss_bytes() / (1024 * 1024);
        let mem_threshold = self.config.memory_pressure_threshold_mb.max(1);
        let mem_excess = rss_mb.saturating_sub(mem_threshold);
        let mem_pressure = (mem_excess as f64 / mem_threshold as f64).clamp(0.0, 0.5);

        let worker_threshold = self.config.worker_pressure_threshold.max(1);
        let worker_excess = self.permits_in_use().saturating_sub(worker_threshold);
        let worker_pressure =
            (worker_excess as f64 / worker_threshold as f64).clamp(0.0, 0.5);

        let pressure = mem_pressure + worker_pressure;
        let max_delay = self.config.max_throttle_delay();
        Duration::from_millis((pressure * max_delay.as_millis() as f64) as u64)
    }

    /// Resident set size of the bridge process, zero when unknown.
    pub fn process_rss_bytes(&self) -> u64 {
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
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(image: usize, metadata: usize) -> ResourceLimiter {
        ResourceLimiter::new(LimiterConfig {
            max_concurrent_image_processing: Some(image),
            max_concurrent_metadata_tool: metadata,
            ..LimiterConfig::default()
        })
    }

    #[tokio::test]
    async fn permits_bound_concurrency() {
        let limiter = limiter(1, 1);
        let held = limiter.try_acquire_image_processing().expect("first permit");
        assert!(limiter.try_acquire_image_processing().is_none());
        assert_eq!(limiter.permits_in_use(), 1);
        drop(held);
        assert!(limiter.try_acquire_image_processing().is_some());
    }

    #[tokio::test]
    async fn acquire_respects_cancellation() {
        let limiter = limiter(1, 1);
        let _held = limiter.try_acquire_image_processing().expect("permit");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = limiter.acquire_image_processing(&cancel).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn throttle_delay_is_cached_between_checks() {
        let limiter = ResourceLimiter::new(LimiterConfig {
            max_concurrent_image_processing: Some(1),
            pressure_check_interval_ms: 3_600_000,
            ..LimiterConfig::default()
        });
        let first = limiter.throttle_delay();
        // Grab a permit; the cached score must not see it.
        let _held = limiter.try_acquire_image_processing();
        assert_eq!(limiter.throttle_delay(), first);
    }

    #[tokio::test]
    async fn idle_limiter_does_not_throttle_workers() {
        let limiter = ResourceLimiter::new(LimiterConfig {
            max_concurrent_image_processing: Some(2),
            // Effectively disable memory pressure for this test.
            memory_pressure_threshold_mb: u64::MAX / (2 * 1024 * 1024),
            worker_pressure_threshold: 4,
            ..LimiterConfig::default()
        });
        assert_eq!(limiter.throttle_delay(), Duration::ZERO);
    }

    #[test]
    fn default_capacity_is_single_on_small_boards() {
        assert_eq!(default_image_capacity(512 * 1024 * 1024), 1);
        assert!(default_image_capacity(8 * 1024 * 1024 * 1024) >= 1);
    }
}
