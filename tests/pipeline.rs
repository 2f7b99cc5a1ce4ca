//! End-to-end pipeline scenarios: camera → spool → upload.

use aviationwx_bridge::camera::CameraKind;
use aviationwx_bridge::config::{
    AuthorityConfig, BridgeConfig, CaptureConfig, ManagerConfig, QueueConfig, TimeHealthConfig,
};
use aviationwx_bridge::exif::BridgeMarker;
use aviationwx_bridge::orchestrator::CameraSetup;
use aviationwx_bridge::queue::{parse_spool_filename, HealthLevel, ImageQueue};
use aviationwx_bridge::test_utils::{FixedNtpProbe, MockCamera, MockUploader};
use aviationwx_bridge::time::{ObservationResult, TimeAuthority, TimeConfidence, TimeHealth, TimeSource};
use aviationwx_bridge::upload::CameraUploadConfig;
use aviationwx_bridge::{Bridge, QueueError, TimeWarningCode};
use chrono::{TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;

fn bridge_config(dir: &std::path::Path) -> BridgeConfig {
    BridgeConfig {
        manager: ManagerConfig {
            base_path: dir.join("spool"),
            // Keep the pressure sweeps out of these tests: they probe the
            // real machine, which the virtual clock does not control.
            memory_check_seconds: 24 * 3600,
            max_heap_mb: 64 * 1024,
            ..ManagerConfig::default()
        },
        ..BridgeConfig::default()
    }
}

fn setup(camera: Arc<MockCamera>, uploader: Arc<MockUploader>) -> CameraSetup {
    CameraSetup {
        camera,
        queue: QueueConfig::default(),
        capture: CaptureConfig::default(),
        upload: CameraUploadConfig::default(),
        uploader,
        processor: None,
        on_capture: None,
    }
}

macro_rules! wait_until {
    ($deadline:expr, $cond:expr) => {
        tokio::time::timeout($deadline, async {
            while !$cond {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        })
        .await
        .expect("condition not reached in time")
    };
}

#[tokio::test(start_paused = true)]
async fn happy_path_captures_spool_and_upload() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bridge = Bridge::new(bridge_config(dir.path())).await.expect("bridge");
    let camera = Arc::new(MockCamera::new("cam1"));
    let uploader = Arc::new(MockUploader::new());
    bridge
        .add_camera(setup(Arc::clone(&camera), Arc::clone(&uploader)))
        .await
        .expect("add camera");
    bridge.start().await.expect("start");

    wait_until!(Duration::from_secs(300), !uploader.calls().is_empty());
    bridge.stop().await;

    // The remote path is `<camera_id>/<observation_unix_ms>.jpg`.
    let call = &uploader.calls()[0];
    let (base, filename) = call
        .remote_path
        .split_once('/')
        .expect("remote path has a base");
    assert_eq!(base, "cam1");
    let observation_ms = parse_spool_filename(filename).expect("numeric spool name");
    // The observation sits around the capture instant.
    let age = Utc::now().timestamp_millis() - observation_ms;
    assert!(age >= 0, "observation in the future");
    assert_eq!(call.size_bytes, 2048);

    // Upload atomicity: the spooled file is gone only because upload
    // succeeded and mark_uploaded ran.
    let status = bridge.status().await;
    let upload = status.upload.expect("upload stats");
    assert_eq!(upload.uploads_failed, 0);
    assert!(upload.uploads_success >= 1);
    assert_eq!(status.cameras[0].kind, CameraKind::Virtual);

    // The provenance marker for this pipeline (healthy bridge clock, no
    // camera EXIF) has exactly the documented shape.
    let marker = BridgeMarker::for_observation(&ObservationResult::bridge(Utc::now()));
    assert_eq!(marker.render(), "AviationWX-Bridge:UTC:v1:bridge_clock:high");
}

#[tokio::test]
async fn camera_clock_ahead_ten_minutes_is_rejected() {
    // Reject threshold widened so a 10 minute skew lands in the "rejected"
    // band rather than "invalid".
    let authority = TimeAuthority::new(
        AuthorityConfig {
            timezone: Some("UTC".to_owned()),
            camera_reject_drift_seconds: 1800,
            ..AuthorityConfig::default()
        },
        None,
    )
    .expect("authority");

    let bridge_now = chrono::DateTime::from_timestamp_millis(1_700_000_000_000).expect("in range");
    let camera_time = (bridge_now + TimeDelta::seconds(600)).naive_utc();
    let observation = authority.determine(bridge_now, Some(camera_time));

    assert_eq!(observation.source, TimeSource::BridgeClock);
    assert_eq!(observation.time, bridge_now);
    let warning = observation.warning.as_ref().expect("warning");
    assert_eq!(warning.code, TimeWarningCode::CameraClockRejected);

    // Filename derives from the bridge instant, not the camera's.
    assert_eq!(observation.time.timestamp_millis(), 1_700_000_000_000);
    assert_eq!(
        BridgeMarker::for_observation(&observation).render(),
        "AviationWX-Bridge:UTC:v1:bridge_clock:high:warn:camera_clock_rejected"
    );
}

#[tokio::test]
async fn queue_fills_to_critical_pauses_and_resumes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue = ImageQueue::new(
        "cam1",
        dir.path().join("cam1"),
        QueueConfig {
            max_files: 10,
            max_size_mb: 1024,
            threshold_critical: 0.9,
            resume_threshold: 0.7,
            pause_capture_on_critical: true,
            thinning_enabled: false,
            ..QueueConfig::default()
        },
    )
    .await
    .expect("queue");
    let mut signals = queue.take_signals().expect("signals");

    let payload = vec![0xAB_u8; 512];
    let base = Utc::now() - TimeDelta::seconds(30);
    let mut spooled = Vec::new();
    for i in 0..9_i64 {
        spooled.push(
            queue
                .enqueue(
                    &payload,
                    &ObservationResult::bridge(base + TimeDelta::seconds(i)),
                )
                .await
                .expect("enqueue"),
        );
    }

    // The ninth image trips critical: one pause edge, further enqueues fail.
    assert!(signals.pause.try_recv().is_ok());
    assert_eq!(queue.state().await.health, HealthLevel::Critical);
    assert!(matches!(
        queue
            .enqueue(&payload, &ObservationResult::bridge(Utc::now()))
            .await,
        Err(QueueError::CapturePaused)
    ));

    // Draining to the resume threshold fires exactly one resume edge.
    queue.mark_uploaded(&spooled[0]).await.expect("mark");
    queue.mark_uploaded(&spooled[1]).await.expect("mark");
    assert!(signals.resume.try_recv().is_ok());
    assert!(signals.resume.try_recv().is_err());
    assert!(queue
        .enqueue(&payload, &ObservationResult::bridge(Utc::now()))
        .await
        .is_ok());
}

#[tokio::test(start_paused = true)]
async fn auth_failures_do_not_stall_other_cameras() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bridge = Bridge::new(bridge_config(dir.path())).await.expect("bridge");

    let locked_out = Arc::new(
        MockUploader::new().scripted([
            Err(aviationwx_bridge::uploader::UploadError::new("401 Unauthorized")),
        ]),
    );
    let healthy = Arc::new(MockUploader::new());
    bridge
        .add_camera(setup(Arc::new(MockCamera::new("cam1")), Arc::clone(&locked_out)))
        .await
        .expect("add cam1");
    bridge
        .add_camera(setup(Arc::new(MockCamera::new("cam2")), Arc::clone(&healthy)))
        .await
        .expect("add cam2");
    bridge.start().await.expect("start");

    wait_until!(
        Duration::from_secs(300),
        !healthy.calls().is_empty() && !locked_out.calls().is_empty()
    );
    // Let a few more scheduler rounds pass: cam1 must stay backed off.
    tokio::time::sleep(Duration::from_secs(10)).await;
    bridge.stop().await;

    // Exactly one attempt against the locked-out remote: no retry on auth.
    assert_eq!(locked_out.calls().len(), 1);
    assert!(!healthy.calls().is_empty());

    let status = bridge.status().await;
    let cam1 = status
        .cameras
        .iter()
        .find(|camera| camera.camera_id == "cam1")
        .expect("cam1 status");
    let failures = cam1.upload_failures.as_ref().expect("failure state");
    assert!(failures.last_auth_failure.is_some());
    assert!(failures.backoff_until.is_some());
    // The image is still spooled; nothing is deleted on failure.
    assert!(cam1.queue.image_count >= 1);

    let upload = status.upload.expect("upload stats");
    assert_eq!(upload.auth_failures, 1);
}

#[tokio::test]
async fn unhealthy_ntp_marks_low_confidence_observations() {
    let health = Arc::new(TimeHealth::new(
        TimeHealthConfig {
            servers: vec!["ntp.test".to_owned()],
            ..TimeHealthConfig::default()
        },
        Box::new(FixedNtpProbe::failing()),
    ));
    health.check_now().await;
    assert!(!health.is_healthy());

    let authority = TimeAuthority::new(
        AuthorityConfig {
            timezone: Some("UTC".to_owned()),
            ..AuthorityConfig::default()
        },
        Some(health),
    )
    .expect("authority");
    let observation = authority.determine(Utc::now(), None);

    assert_eq!(observation.confidence, TimeConfidence::Low);
    assert_eq!(
        BridgeMarker::for_observation(&observation).render(),
        "AviationWX-Bridge:UTC:v1:bridge_clock:low:warn:ntp_unhealthy"
    );

    // Marker parses back to the same provenance.
    let marker =
        BridgeMarker::parse("AviationWX-Bridge:UTC:v1:bridge_clock:low:warn:ntp_unhealthy")
            .expect("parse");
    assert_eq!(marker.source, TimeSource::BridgeClock);
    assert_eq!(marker.confidence, TimeConfidence::Low);
    assert_eq!(marker.warn_code.as_deref(), Some("ntp_unhealthy"));
}

#[tokio::test(start_paused = true)]
async fn hot_removal_keeps_the_rest_of_the_fleet_running() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bridge = Bridge::new(bridge_config(dir.path())).await.expect("bridge");
    let uploader = Arc::new(MockUploader::new());
    bridge
        .add_camera(setup(Arc::new(MockCamera::new("cam1")), Arc::clone(&uploader)))
        .await
        .expect("add cam1");
    bridge
        .add_camera(setup(Arc::new(MockCamera::new("cam2")), Arc::clone(&uploader)))
        .await
        .expect("add cam2");
    bridge.start().await.expect("start");

    wait_until!(Duration::from_secs(300), uploader.calls().len() >= 2);
    bridge.remove_camera("cam1").await.expect("remove");
    assert!(!dir.path().join("spool").join("cam1").exists());

    let before = uploader
        .calls()
        .iter()
        .filter(|call| call.remote_path.starts_with("cam2/"))
        .count();
    wait_until!(Duration::from_secs(300), {
        uploader
            .calls()
            .iter()
            .filter(|call| call.remote_path.starts_with("cam2/"))
            .count()
            > before
    });
    bridge.stop().await;

    let status = bridge.status().await;
    assert_eq!(status.cameras.len(), 1);
    assert_eq!(status.cameras[0].camera_id, "cam2");
}
