//! Shared setup for the scenario tests: a driver connected to the simulated
//! SDK with a channel sink.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use svbony_ccd::sdk::simulated::{SimulatedCameraSpec, SimulatedSdk};
use svbony_ccd::{ChannelSink, DriverConfig, FrameEvent, SvbonyCamera};
use tokio::sync::mpsc;

pub struct Harness {
    pub sdk: Arc<SimulatedSdk>,
    pub camera: SvbonyCamera,
    pub frames: mpsc::Receiver<FrameEvent>,
}

pub fn connect() -> Harness {
    connect_with(SimulatedCameraSpec::cooled_color(), DriverConfig::default())
}

pub fn connect_with(spec: SimulatedCameraSpec, config: DriverConfig) -> Harness {
    let sdk = Arc::new(SimulatedSdk::with_cameras(vec![spec]));
    let (sink, frames) = ChannelSink::new(config.frame_channel_capacity);
    let camera = SvbonyCamera::connect(sdk.clone(), config, Arc::new(sink)).unwrap();
    Harness { sdk, camera, frames }
}

impl Harness {
    /// Next event, failing the test if none arrives within `timeout`.
    pub async fn next_event(&mut self, timeout: Duration) -> FrameEvent {
        tokio::time::timeout(timeout, self.frames.recv())
            .await
            .expect("no frame event before timeout")
            .expect("frame channel closed")
    }

    /// Wait for the device to go idle within `timeout`.
    pub async fn idle_within(&self, timeout: Duration) {
        tokio::time::timeout(timeout, self.camera.wait_idle())
            .await
            .expect("device did not return to idle");
    }

    /// Events already queued, without waiting.
    pub fn drain(&mut self) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.frames.try_recv() {
            events.push(event);
        }
        events
    }
}
