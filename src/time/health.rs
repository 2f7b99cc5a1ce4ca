//! Periodic NTP healthcheck of the bridge clock.

use crate::config::TimeHealthConfig;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::fmt::Debug;
use std::sync::RwLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One-shot clock offset measurement against a single NTP server.
///
/// The bridge deliberately does not ship an NTP client; deployments plug in
/// whatever implementation their fleet already carries. The returned offset
/// is signed: positive means the bridge clock is behind the server.
#[async_trait]
pub trait NtpProbe: Debug + Send + Sync {
    /// Measure the bridge clock's offset against `server`.
    async fn offset(&self, server: &str, timeout: Duration) -> eyre::Result<TimeDelta>;
}

#[derive(Debug, Clone, Copy, Default)]
struct HealthState {
    healthy: bool,
    offset: Option<TimeDelta>,
    last_check: Option<DateTime<Utc>>,
}

/// Point-in-time view of the healthcheck.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TimeHealthSnapshot {
    /// Whether the bridge clock is currently trusted.
    pub healthy: bool,
    /// Last measured offset in milliseconds, positive when the bridge clock
    /// is behind.
    pub offset_ms: Option<i64>,
    /// When a probe round last completed, successful or not.
    pub last_check: Option<DateTime<Utc>>,
}

/// Tracks whether the bridge clock can be trusted.
///
/// Starts unhealthy until the first successful probe. Each round tries the
/// configured servers in order and takes the first answer; a round where
/// every server fails marks the clock unhealthy but still refreshes
/// `last_check`.
#[derive(Debug)]
pub struct TimeHealth {
    config: TimeHealthConfig,
    probe: Box<dyn NtpProbe>,
    state: RwLock<HealthState>,
}

impl TimeHealth {
    /// Create a healthcheck around `probe`. It reports unhealthy until
    /// [`check_now`](Self::check_now) (or the background task) succeeds once.
    pub fn new(config: TimeHealthConfig, probe: Box<dyn NtpProbe>) -> Self {
        Self {
            config,
            probe,
            state: RwLock::new(HealthState::default()),
        }
    }

    /// Whether the bridge clock is currently trusted.
    pub fn is_healthy(&self) -> bool {
        self.read_state().healthy
    }

    /// Current snapshot of health, offset and last check time.
    pub fn snapshot(&self) -> TimeHealthSnapshot {
        let state = self.read_state();
        TimeHealthSnapshot {
            healthy: state.healthy,
            offset_ms: state.offset.map(|offset| offset.num_milliseconds()),
            last_check: state.last_check,
        }
    }

    fn read_state(&self) -> HealthState {
        *self
            .state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_state(&self, update: impl FnOnce(&mut HealthState)) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        update(&mut state);
    }

    /// Run one probe round: try servers in order, record the first answer.
    #[tracing::instrument(skip(self))]
    pub async fn check_now(&self) {
        let timeout = self.config.timeout();
        for server in &self.config.servers {
            match self.probe.offset(server, timeout).await {
                Ok(offset) => {
                    let healthy =
                        offset.num_milliseconds().abs() <= self.config.max_offset_ms();
                    if !healthy {
                        tracing::warn!(
                            server,
                            offset_ms = offset.num_milliseconds(),
                            "bridge clock offset exceeds the healthy range"
                        );
                    }
                    self.write_state(|state| {
                        state.healthy = healthy;
                        state.offset = Some(offset);
                        state.last_check = Some(Utc::now());
                    });
                    return;
                }
                Err(error) => {
                    tracing::debug!(server, %error, "NTP probe failed, trying next server");
                }
            }
        }
        tracing::warn!("all NTP servers failed; marking the bridge clock unhealthy");
        self.write_state(|state| {
            state.healthy = false;
            state.last_check = Some(Utc::now());
        });
    }

    /// Probe on the configured interval until cancelled. The first round runs
    /// immediately so the bridge leaves its initial unhealthy state as soon
    /// as a server answers.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.check_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_now().await,
                () = cancel.cancelled() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FixedNtpProbe;

    fn config(max_offset_seconds: f64) -> TimeHealthConfig {
        TimeHealthConfig {
            servers: vec!["ntp.test".to_owned()],
            max_offset_seconds,
            ..TimeHealthConfig::default()
        }
    }

    #[tokio::test]
    async fn starts_unhealthy_until_first_success() {
        let health = TimeHealth::new(
            config(2.0),
            Box::new(FixedNtpProbe::with_offset_ms(100)),
        );
        assert!(!health.is_healthy());
        assert!(health.snapshot().last_check.is_none());

        health.check_now().await;
        assert!(health.is_healthy());
        assert_eq!(health.snapshot().offset_ms, Some(100));
        assert!(health.snapshot().last_check.is_some());
    }

    #[tokio::test]
    async fn large_offset_is_unhealthy() {
        let health = TimeHealth::new(
            config(2.0),
            Box::new(FixedNtpProbe::with_offset_ms(-5000)),
        );
        health.check_now().await;
        assert!(!health.is_healthy());
        assert_eq!(health.snapshot().offset_ms, Some(-5000));
    }

    #[tokio::test]
    async fn all_servers_failing_keeps_last_check_fresh() {
        let health = TimeHealth::new(config(2.0), Box::new(FixedNtpProbe::failing()));
        health.check_now().await;
        assert!(!health.is_healthy());
        assert!(health.snapshot().last_check.is_some());
        assert_eq!(health.snapshot().offset_ms, None);
    }
}
