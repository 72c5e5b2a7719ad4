//! Guide pulse timing against the simulated guide port.

mod common;

use std::time::{Duration, Instant};
use svbony_ccd::components::guide::{AxisState, PulseStatus};
use svbony_ccd::sdk::simulated::SimulatedCameraSpec;
use svbony_ccd::sdk::{GuideAxis, GuideDirection};
use svbony_ccd::{CameraError, DriverConfig};
use tokio_test::assert_ok;

/// Scheduling slack allowed past the nominal pulse end.
const SLACK: Duration = Duration::from_millis(250);

async fn idle_at(h: &common::Harness, axis: GuideAxis) -> Instant {
    let mut rx = h.camera.guide_subscribe(axis);
    tokio::time::timeout(Duration::from_secs(3), rx.wait_for(AxisState::is_idle))
        .await
        .expect("axis did not go idle")
        .expect("guide state dropped");
    Instant::now()
}

#[tokio::test]
async fn pulse_ends_after_its_duration() {
    let h = common::connect();
    let started = Instant::now();

    let status = assert_ok!(h.camera.guide_north(150));
    assert_eq!(status, PulseStatus::Busy);

    let ended = idle_at(&h, GuideAxis::NorthSouth).await;
    let elapsed = ended.duration_since(started);
    assert!(elapsed >= Duration::from_millis(150), "ended early: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(150) + SLACK, "ended late: {elapsed:?}");
}

#[tokio::test]
async fn second_pulse_on_same_axis_resets_timer() {
    let h = common::connect();
    let started = Instant::now();

    assert_ok!(h.camera.guide_east(200));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = Instant::now();
    assert_ok!(h.camera.guide_east(200));

    let ended = idle_at(&h, GuideAxis::EastWest).await;
    assert!(ended.duration_since(second) >= Duration::from_millis(200));
    assert!(ended.duration_since(started) >= Duration::from_millis(300));

    // Replaced, not stacked: one on/off pair per pulse in the same direction
    let events = h.sdk.guide_events();
    let offs = events.iter().filter(|e| !e.on).count();
    assert_eq!(offs, 1);
}

#[tokio::test]
async fn axes_run_independently() {
    let h = common::connect();
    assert_ok!(h.camera.guide_west(400));
    assert_ok!(h.camera.guide_south(50));

    idle_at(&h, GuideAxis::NorthSouth).await;
    assert!(!h.camera.guide_axis(GuideAxis::EastWest).is_idle());
    idle_at(&h, GuideAxis::EastWest).await;
}

#[tokio::test]
async fn guide_failure_reports_alert_without_disturbing_exposure() {
    let h = common::connect();
    assert_ok!(h.camera.start_exposure(Duration::from_secs(2)));
    h.sdk.fail_guide_commands(true);

    let status = assert_ok!(h.camera.guide_pulse(GuideDirection::North, Duration::from_millis(50)));
    assert_eq!(status, PulseStatus::Alert);
    assert!(matches!(
        h.camera.state(),
        svbony_ccd::components::acquisition::AcquisitionState::Exposing { .. }
    ));
    h.camera.disconnect().await.unwrap();
}

#[tokio::test]
async fn camera_without_guide_port_is_unsupported() {
    let mut spec = SimulatedCameraSpec::mono_guider();
    spec.property_ex.supports_pulse_guide = false;
    let h = common::connect_with(spec, DriverConfig::default());

    assert!(matches!(
        h.camera.guide_north(100),
        Err(CameraError::Unsupported(_))
    ));
}
