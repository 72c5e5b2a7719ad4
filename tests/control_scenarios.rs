//! Control writes, video format selection and cooling against the simulated
//! SDK.

mod common;

use std::time::Duration;
use svbony_ccd::components::controls::FlipAxis;
use svbony_ccd::components::thermal::{RegulationStatus, ThermalStatus};
use svbony_ccd::config::ThermalConfig;
use svbony_ccd::sdk::simulated::SimulatedCameraSpec;
use svbony_ccd::sdk::{ControlType, VideoFormat};
use svbony_ccd::{CameraError, DriverConfig};
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn out_of_range_gain_is_rejected_and_device_unchanged() {
    let h = common::connect();
    assert_eq!(h.camera.control(ControlType::Gain).unwrap(), 100.0);

    let err = assert_err!(h.camera.set_control(ControlType::Gain, 700.0));
    assert!(matches!(err, CameraError::InvalidArgument(_)));
    assert_eq!(h.camera.control(ControlType::Gain).unwrap(), 100.0);
    assert_eq!(h.sdk.raw_control(ControlType::Gain), Some(100));

    // Range edges are accepted as-is
    assert_ok!(h.camera.set_control(ControlType::Gain, 0.0));
    assert_ok!(h.camera.set_control(ControlType::Gain, 600.0));
    assert_eq!(h.sdk.raw_control(ControlType::Gain), Some(600));
}

#[tokio::test]
async fn non_finite_gain_is_rejected_and_device_unchanged() {
    let h = common::connect();
    for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        let err = assert_err!(h.camera.set_control(ControlType::Gain, bad));
        assert!(matches!(err, CameraError::InvalidArgument(_)));
    }
    assert_eq!(h.camera.control(ControlType::Gain).unwrap(), 100.0);
    assert_eq!(h.sdk.raw_control(ControlType::Gain), Some(100));
}

#[tokio::test]
async fn video_format_change_when_idle_is_reflected_after_update() {
    let h = common::connect();
    let format = assert_ok!(h.camera.set_capture_format(3));
    assert_eq!(format, VideoFormat::Y16);

    assert_ok!(h.camera.update_controls());
    assert_eq!(h.camera.video_format(), VideoFormat::Y16);
    assert_eq!(h.sdk.active_format(), Some(VideoFormat::Y16));
    assert_eq!(h.camera.recorder_format().bit_depth, 16);
    assert_eq!(h.camera.bayer_string(), None);
}

#[tokio::test]
async fn video_format_change_while_exposing_is_rejected() {
    let h = common::connect();
    assert_ok!(h.camera.start_exposure(Duration::from_secs(2)));

    let err = assert_err!(h.camera.set_video_format(1));
    assert!(matches!(err, CameraError::InvalidState { .. }));
    assert_eq!(h.sdk.active_format(), Some(VideoFormat::Raw8));
    h.camera.disconnect().await.unwrap();
}

#[tokio::test]
async fn catalog_has_one_entry_per_advertised_control() {
    let h = common::connect();
    let advertised = SimulatedCameraSpec::cooled_color().controls.len();
    assert_eq!(h.camera.controls().control_count(), advertised);

    assert_ok!(h.camera.create_controls(advertised));
    assert_eq!(h.camera.controls().control_count(), advertised);
}

#[tokio::test]
async fn flip_switches_write_the_flip_control() {
    let h = common::connect();
    assert_ok!(h.camera.set_flip(FlipAxis::Horizontal, true));
    assert_eq!(h.sdk.raw_control(ControlType::Flip), Some(1));

    let guider = common::connect_with(SimulatedCameraSpec::mono_guider(), DriverConfig::default());
    assert!(matches!(
        guider.camera.set_flip(FlipAxis::Horizontal, true),
        Err(CameraError::Unsupported(_))
    ));
}

#[tokio::test]
async fn set_temperature_enables_cooler_and_trends_toward_target() {
    let config = DriverConfig {
        thermal: ThermalConfig {
            poll_interval_ms: 50,
            ..ThermalConfig::default()
        },
        ..DriverConfig::default()
    };
    let h = common::connect_with(SimulatedCameraSpec::cooled_color(), config);
    assert!(!h.camera.thermal_state().unwrap().cooler_enabled);

    let status = assert_ok!(h.camera.set_temperature(-10.0));
    assert_eq!(status, RegulationStatus::InProgress);
    assert!(h.camera.thermal_state().unwrap().cooler_enabled);

    let mut rx = h.camera.thermal_subscribe().unwrap();
    let mut readings = vec![rx.borrow_and_update().current_c];
    for _ in 0..5 {
        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .unwrap()
            .unwrap();
        readings.push(rx.borrow_and_update().current_c);
    }

    assert!(
        readings.windows(2).all(|w| w[1] <= w[0]),
        "not monotonic: {readings:?}"
    );
    assert!(readings.last().unwrap() < readings.first().unwrap());
    assert!(readings.iter().all(|t| *t >= -10.0));
    assert_eq!(h.camera.thermal_status().unwrap(), ThermalStatus::Busy);
}

#[tokio::test]
async fn temperature_target_outside_range_is_rejected() {
    let h = common::connect();
    let err = assert_err!(h.camera.set_temperature(-60.0));
    assert!(matches!(err, CameraError::InvalidArgument(_)));
    assert!(!h.camera.thermal_state().unwrap().cooler_enabled);
}
