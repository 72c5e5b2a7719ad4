//! Exposure, streaming, abort and retry behaviour against the simulated SDK.

mod common;

use std::time::Duration;
use svbony_ccd::components::acquisition::AcquisitionState;
use svbony_ccd::sdk::ControlType;
use svbony_ccd::{CameraError, FrameEvent};
use tokio_test::{assert_err, assert_ok};

const TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn abort_during_long_exposure_returns_to_idle_without_frame() {
    let mut h = common::connect();

    assert_ok!(h.camera.start_exposure(Duration::from_secs(5)));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_ok!(h.camera.abort_exposure());

    let state = h.camera.state();
    assert!(
        matches!(state, AcquisitionState::Aborting | AcquisitionState::Idle),
        "unexpected state {state:?}"
    );

    // Poll interval is 20 ms; allow generous scheduling slack
    h.idle_within(Duration::from_millis(500)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.drain().is_empty());
    assert_eq!(h.sdk.frames_produced(), 0);
}

#[tokio::test]
async fn abort_when_idle_is_noop() {
    let h = common::connect();
    assert_ok!(h.camera.abort_exposure());
    assert_ok!(h.camera.abort_exposure());
    assert_eq!(h.camera.state(), AcquisitionState::Idle);
}

#[tokio::test]
async fn transient_readout_failures_are_retried() {
    let mut h = common::connect();
    h.sdk.fail_next_readouts(2);

    assert_ok!(h.camera.start_exposure(Duration::from_millis(10)));
    let event = h.next_event(TIMEOUT).await;
    assert!(matches!(event, FrameEvent::Frame(_)), "got {event:?}");

    h.idle_within(TIMEOUT).await;
    assert!(h.drain().is_empty(), "no failure report after a recovered capture");
    assert_eq!(h.sdk.exposure_starts(), 3);
}

#[tokio::test]
async fn exhausted_retries_report_one_failure() {
    let mut h = common::connect();
    h.sdk.fail_next_readouts(3);

    assert_ok!(h.camera.start_exposure(Duration::from_millis(10)));
    let event = h.next_event(TIMEOUT).await;
    match event {
        FrameEvent::CaptureFailed(CameraError::CaptureFailed { attempts, .. }) => {
            assert_eq!(attempts, 3)
        }
        other => panic!("expected CaptureFailed, got {other:?}"),
    }

    h.idle_within(TIMEOUT).await;
    assert!(h.drain().is_empty());
    assert_eq!(h.sdk.frames_produced(), 0);
}

#[tokio::test]
async fn exposure_and_streaming_are_exclusive() {
    let h = common::connect();
    h.sdk.set_raw_control(ControlType::Exposure, 20_000);

    assert_ok!(h.camera.start_streaming());
    let err = assert_err!(h.camera.start_exposure(Duration::from_millis(10)));
    assert!(matches!(err, CameraError::InvalidState { .. }));
    assert_eq!(h.camera.state(), AcquisitionState::Streaming);

    assert_ok!(h.camera.stop_streaming());
    h.idle_within(TIMEOUT).await;

    assert_ok!(h.camera.start_exposure(Duration::from_secs(2)));
    let err = assert_err!(h.camera.start_streaming());
    assert!(matches!(err, CameraError::InvalidState { .. }));
    assert!(matches!(h.camera.state(), AcquisitionState::Exposing { .. }));

    assert_ok!(h.camera.abort_exposure());
    h.idle_within(TIMEOUT).await;
}

#[tokio::test]
async fn second_exposure_while_exposing_rejected() {
    let h = common::connect();
    assert_ok!(h.camera.start_exposure(Duration::from_secs(2)));
    let err = assert_err!(h.camera.start_exposure(Duration::from_secs(1)));
    assert_eq!(
        err,
        CameraError::InvalidState {
            operation: "start exposure",
            state: "exposing"
        }
    );
    h.camera.disconnect().await.unwrap();
}

#[tokio::test]
async fn streaming_delivers_frames_until_aborted() {
    let mut h = common::connect();
    h.sdk.set_raw_control(ControlType::Exposure, 10_000);

    assert_ok!(h.camera.start_streaming());
    for expected in 1..=3 {
        match h.next_event(TIMEOUT).await {
            FrameEvent::Frame(frame) => assert_eq!(frame.frame_number, expected),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    assert_ok!(h.camera.abort_exposure());
    h.idle_within(TIMEOUT).await;
}

#[tokio::test]
async fn persistent_stream_failures_end_the_stream() {
    let mut h = common::connect();
    h.sdk.set_raw_control(ControlType::Exposure, 1_000);
    h.sdk.fail_next_readouts(10);

    assert_ok!(h.camera.start_streaming());
    let event = h.next_event(TIMEOUT).await;
    assert!(matches!(
        event,
        FrameEvent::CaptureFailed(CameraError::CaptureFailed { attempts: 3, .. })
    ));
    h.idle_within(TIMEOUT).await;
}

#[tokio::test]
async fn state_walks_only_legal_transitions() {
    let h = common::connect();
    let mut observed = vec![h.camera.state()];

    let step = |state: AcquisitionState, observed: &mut Vec<AcquisitionState>| {
        let previous = *observed.last().unwrap();
        if state.name() != previous.name() {
            assert!(
                previous.can_transition_to(&state),
                "illegal transition {} -> {}",
                previous.name(),
                state.name()
            );
            observed.push(state);
        }
    };

    h.camera.start_exposure(Duration::from_secs(1)).unwrap();
    step(h.camera.state(), &mut observed);
    h.camera.abort_exposure().unwrap();
    step(h.camera.state(), &mut observed);
    h.idle_within(TIMEOUT).await;
    step(h.camera.state(), &mut observed);

    h.camera.start_streaming().unwrap();
    step(h.camera.state(), &mut observed);
    h.camera.stop_streaming().unwrap();
    h.idle_within(TIMEOUT).await;
    step(h.camera.state(), &mut observed);

    let names: Vec<_> = observed.iter().map(|s| s.name()).collect();
    assert_eq!(
        names,
        ["idle", "exposing", "aborting", "idle", "streaming", "idle"]
    );
}

#[tokio::test]
async fn geometry_changes_rejected_while_capturing() {
    let h = common::connect();
    assert_ok!(h.camera.update_binning(2));
    assert_eq!(h.camera.frame_layout().binned_size(), (320, 240));

    assert_ok!(h.camera.start_exposure(Duration::from_secs(2)));
    let err = assert_err!(h.camera.update_frame(0, 0, 64, 64));
    assert!(matches!(err, CameraError::InvalidState { .. }));
    assert_eq!(h.camera.frame_layout().binned_size(), (320, 240));
    h.camera.disconnect().await.unwrap();
}
