//! Image Dispatch
//!
//! Packages a completed readout into an immutable [`CapturedFrame`] and hands
//! it to the delivery path. The capture engine calls [`ImageDispatcher`]
//! exactly once per successful capture and never for aborted captures.

use crate::components::acquisition::FrameLayout;
use crate::components::connection::DeviceHandle;
use async_trait::async_trait;
use bytes::Bytes;
use ccd_core::{CameraError, CapturedFrame};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Delivery path for frames and capture failures.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// A capture completed.
    async fn deliver(&self, frame: CapturedFrame);

    /// A capture gave up after exhausting its retries.
    async fn capture_failed(&self, error: CameraError);
}

/// What a [`ChannelSink`] forwards.
#[derive(Debug, Clone)]
pub enum FrameEvent {
    Frame(CapturedFrame),
    CaptureFailed(CameraError),
}

/// [`FrameSink`] that forwards everything into a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<FrameEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<FrameEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    async fn send(&self, event: FrameEvent) {
        if self.tx.send(event).await.is_err() {
            warn!("Frame receiver dropped, event discarded");
        }
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn deliver(&self, frame: CapturedFrame) {
        self.send(FrameEvent::Frame(frame)).await;
    }

    async fn capture_failed(&self, error: CameraError) {
        self.send(FrameEvent::CaptureFailed(error)).await;
    }
}

/// Builds frame records and forwards them to the sink.
pub struct ImageDispatcher {
    device: Arc<DeviceHandle>,
    sink: Arc<dyn FrameSink>,
    frame_counter: AtomicU64,
    temperature: Option<watch::Receiver<f64>>,
}

impl ImageDispatcher {
    /// `temperature` follows the sensor temperature, when the camera can
    /// report it.
    pub fn new(
        device: Arc<DeviceHandle>,
        sink: Arc<dyn FrameSink>,
        temperature: Option<watch::Receiver<f64>>,
    ) -> Self {
        Self {
            device,
            sink,
            frame_counter: AtomicU64::new(0),
            temperature,
        }
    }

    /// Number of frames delivered so far.
    pub fn frames_delivered(&self) -> u64 {
        self.frame_counter.load(Ordering::SeqCst)
    }

    /// Build the frame record for one readout.
    pub fn package(&self, pixels: Vec<u8>, layout: &FrameLayout, exposure: Duration) -> CapturedFrame {
        let (width, height) = layout.binned_size();
        let frame_number = self.frame_counter.fetch_add(1, Ordering::SeqCst) + 1;
        CapturedFrame {
            frame_number,
            timestamp: Utc::now(),
            width,
            height,
            bit_depth: layout.format.bit_depth(),
            bytes_per_pixel: layout.format.bytes_per_pixel(),
            encoding: layout.encoding(self.device.property(), self.device.property_ex()),
            exposure,
            temperature_c: self.temperature.as_ref().map(|rx| *rx.borrow()),
            binning: (layout.bin, layout.bin),
            roi_origin: (layout.x, layout.y),
            pixels: Bytes::from(pixels),
        }
    }

    /// Package and deliver one completed capture.
    pub async fn dispatch(&self, pixels: Vec<u8>, layout: &FrameLayout, exposure: Duration) {
        let frame = self.package(pixels, layout, exposure);
        if !frame.is_consistent() {
            warn!(
                frame = frame.frame_number,
                len = frame.pixels.len(),
                expected = frame.expected_len(),
                "Frame buffer size does not match geometry"
            );
        }
        debug!(
            frame = frame.frame_number,
            width = frame.width,
            height = frame.height,
            exposure_s = exposure.as_secs_f64(),
            "Frame dispatched"
        );
        self.sink.deliver(frame).await;
    }

    /// Report a capture that gave up.
    pub async fn fail(&self, error: CameraError) {
        warn!(error = %error, "Capture failed");
        self.sink.capture_failed(error).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::connection::CameraSelector;
    use crate::sdk::simulated::SimulatedSdk;
    use crate::sdk::VideoFormat;
    use ccd_core::frame::{BayerPattern, PixelEncoding};

    fn dispatcher(temperature: Option<watch::Receiver<f64>>) -> (ImageDispatcher, mpsc::Receiver<FrameEvent>, FrameLayout) {
        let sdk = Arc::new(SimulatedSdk::new());
        let device = Arc::new(DeviceHandle::open(sdk, &CameraSelector::First).unwrap());
        let layout = FrameLayout::full_frame(device.property(), VideoFormat::Raw16);
        let (sink, rx) = ChannelSink::new(4);
        (ImageDispatcher::new(device, Arc::new(sink), temperature), rx, layout)
    }

    #[tokio::test]
    async fn test_frame_metadata() {
        let (_tx, temp_rx) = watch::channel(-9.5);
        let (dispatcher, mut rx, layout) = dispatcher(Some(temp_rx));

        let len = layout.frame_size().unwrap().bytes;
        dispatcher
            .dispatch(vec![0u8; len], &layout, Duration::from_secs(2))
            .await;

        let FrameEvent::Frame(frame) = rx.recv().await.unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(frame.frame_number, 1);
        assert_eq!((frame.width, frame.height), (640, 480));
        assert_eq!(frame.bit_depth, 16);
        assert_eq!(frame.encoding, PixelEncoding::Bayer(BayerPattern::Rg));
        assert_eq!(frame.temperature_c, Some(-9.5));
        assert_eq!(frame.exposure, Duration::from_secs(2));
        assert!(frame.is_consistent());
        assert_eq!(dispatcher.frames_delivered(), 1);
    }

    #[tokio::test]
    async fn test_frame_numbers_increase() {
        let (dispatcher, _rx, mut layout) = dispatcher(None);
        layout.bin = 2;
        let first = dispatcher.package(Vec::new(), &layout, Duration::ZERO);
        let second = dispatcher.package(Vec::new(), &layout, Duration::ZERO);
        assert_eq!(second.frame_number, first.frame_number + 1);
        assert_eq!(first.temperature_c, None);
        // Mono-bin drops the colour tag
        assert_eq!(first.encoding, PixelEncoding::Mono);
        assert_eq!(first.binning, (2, 2));
    }

    #[tokio::test]
    async fn test_failure_forwarded() {
        let (dispatcher, mut rx, _layout) = dispatcher(None);
        dispatcher
            .fail(CameraError::CaptureFailed {
                attempts: 3,
                last_error: "timeout".into(),
            })
            .await;
        assert!(matches!(
            rx.recv().await,
            Some(FrameEvent::CaptureFailed(CameraError::CaptureFailed { attempts: 3, .. }))
        ));
    }
}
