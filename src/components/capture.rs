//! SVBONY Capture Engine
//!
//! Runs still exposures and live streaming on a per-device worker task.
//!
//! # Worker
//!
//! Each capture gets its own Tokio task and [`CancelToken`]. The worker polls
//! the token every `poll_interval` while the sensor integrates and at the top
//! of each streaming iteration, so abort latency is bounded by that interval
//! plus the duration of whatever SDK call is in flight. Readout runs on the
//! blocking pool because the vendor call copies the whole frame.
//!
//! Handing a frame to the sink is raced against the token, so a consumer
//! that stops draining never holds up an abort or a shutdown. A still
//! exposure claims its completion under the acquisition lock before the
//! frame goes out: an abort that lands first discards the frame, and one that
//! lands later finds the device idle.
//!
//! # Retries
//!
//! `exposure_retries` is the number of readout attempts an exposure gets. A
//! failed attempt restarts the same exposure without the caller noticing; the
//! last failure is reported once through the sink as `CaptureFailed`.
//!
//! Commands never wait on the worker. [`CaptureEngine::shutdown`] is the only
//! call that joins it.

use crate::components::acquisition::{Acquisition, AcquisitionState, FrameLayout};
use crate::components::connection::DeviceHandle;
use crate::components::dispatch::ImageDispatcher;
use crate::config::CaptureConfig;
use crate::sdk::{ControlType, ExposureStatus, RoiFormat};
use ccd_core::{CameraError, CameraResult, Observable, SdkError};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Extra time the sensor gets past the requested duration before an
/// unfinished exposure counts as a failed attempt.
const INTEGRATION_GRACE: Duration = Duration::from_secs(5);

/// Cooperative cancellation flag shared with one worker task.
#[derive(Debug, Clone)]
pub struct CancelToken(Arc<watch::Sender<bool>>);

impl Default for CancelToken {
    fn default() -> Self {
        Self(Arc::new(watch::Sender::new(false)))
    }
}

impl CancelToken {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.0.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

struct Worker {
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

enum Attempt {
    Frame(Vec<u8>),
    Cancelled,
    Failed(CameraError),
}

struct EngineInner {
    device: Arc<DeviceHandle>,
    acquisition: Arc<Acquisition>,
    dispatcher: Arc<ImageDispatcher>,
    config: CaptureConfig,
    exposure_range: Option<(Duration, Duration)>,
    exposure_left: Observable<f64>,
}

/// Exposure and streaming state machine for one device.
pub struct CaptureEngine {
    inner: Arc<EngineInner>,
    worker: Mutex<Option<Worker>>,
    /// Earlier workers still handing a completed capture to the sink.
    retired: Mutex<Vec<Worker>>,
}

impl CaptureEngine {
    /// Reads the exposure range from the advertised controls.
    pub fn new(
        device: Arc<DeviceHandle>,
        acquisition: Arc<Acquisition>,
        dispatcher: Arc<ImageDispatcher>,
        config: CaptureConfig,
    ) -> CameraResult<Self> {
        let exposure_range = device
            .control_caps()?
            .into_iter()
            .find(|caps| caps.control == ControlType::Exposure)
            .map(|caps| {
                (
                    Duration::from_micros(caps.min.max(0) as u64),
                    Duration::from_micros(caps.max.max(0) as u64),
                )
            });

        Ok(Self {
            inner: Arc::new(EngineInner {
                device,
                acquisition,
                dispatcher,
                config,
                exposure_range,
                exposure_left: Observable::new("Exposure Left", 0.0)
                    .with_label("Remaining exposure (s)")
                    .read_only(),
            }),
            worker: Mutex::new(None),
            retired: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> AcquisitionState {
        self.inner.acquisition.state()
    }

    /// Remaining integration time in seconds, updated at each poll.
    pub fn exposure_left(&self) -> Observable<f64> {
        self.inner.exposure_left.clone()
    }

    /// Start a still exposure. Returns as soon as the sensor is integrating;
    /// the frame or failure arrives through the sink.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start_exposure(&self, duration: Duration) -> CameraResult<()> {
        self.inner.check_exposure_range(duration)?;

        let mut slot = self.worker.lock();
        let budget = self.inner.config.exposure_retries.max(1);
        let layout = self.inner.acquisition.begin(
            "start exposure",
            AcquisitionState::Exposing {
                duration,
                started_at: Instant::now(),
                retries_left: budget - 1,
            },
        )?;

        let started = layout
            .frame_size()
            .and_then(|_| self.inner.device.call(|sdk, id| sdk.start_exposure(id, duration)));
        if let Err(e) = started {
            self.inner.acquisition.finish();
            return Err(e);
        }

        let cancel = CancelToken::default();
        let handle = tokio::spawn(
            self.inner
                .clone()
                .run_exposure(cancel.clone(), layout, duration),
        );
        self.install(&mut slot, Worker { cancel, handle });

        info!(
            camera = %self.inner.device.info().name,
            duration_s = duration.as_secs_f64(),
            "Exposure started"
        );
        Ok(())
    }

    /// Cancel the running exposure or stream. Does nothing when idle.
    pub fn abort_exposure(&self) -> CameraResult<()> {
        let slot = self.worker.lock();
        let aborted = self.inner.acquisition.transition(
            "abort exposure",
            |state| {
                matches!(
                    state,
                    AcquisitionState::Exposing { .. } | AcquisitionState::Streaming
                )
            },
            AcquisitionState::Aborting,
        );
        // Idle, or an abort already pending
        if let Ok(previous) = aborted {
            if let Some(worker) = slot.as_ref() {
                worker.cancel.cancel();
            }
            info!(from = previous.name(), "Abort requested");
        }
        Ok(())
    }

    /// Start free-running video. Frames are delivered until stopped.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start_streaming(&self) -> CameraResult<()> {
        let mut slot = self.worker.lock();
        let layout = self
            .inner
            .acquisition
            .begin("start streaming", AcquisitionState::Streaming)?;

        let started = self.inner.begin_video(&layout);
        let frame_interval = match started {
            Ok(interval) => interval,
            Err(e) => {
                self.inner.acquisition.finish();
                return Err(e);
            }
        };

        let cancel = CancelToken::default();
        let handle = tokio::spawn(
            self.inner
                .clone()
                .run_stream(cancel.clone(), layout, frame_interval),
        );
        self.install(&mut slot, Worker { cancel, handle });

        info!(
            camera = %self.inner.device.info().name,
            interval_ms = frame_interval.as_millis() as u64,
            "Streaming started"
        );
        Ok(())
    }

    /// Ask the stream to end after the current iteration.
    pub fn stop_streaming(&self) -> CameraResult<()> {
        let slot = self.worker.lock();
        match self.inner.acquisition.state() {
            AcquisitionState::Streaming => {
                if let Some(worker) = slot.as_ref() {
                    worker.cancel.cancel();
                }
                debug!("Stream stop requested");
                Ok(())
            }
            AcquisitionState::Idle | AcquisitionState::Aborting => Ok(()),
            state @ AcquisitionState::Exposing { .. } => Err(CameraError::InvalidState {
                operation: "stop streaming",
                state: state.name(),
            }),
        }
    }

    /// Set the region of interest in unbinned sensor pixels. Idle only.
    pub fn update_frame(&self, x: u32, y: u32, width: u32, height: u32) -> CameraResult<()> {
        self.inner
            .acquisition
            .while_idle("update frame", |layout| {
                let candidate = FrameLayout {
                    x,
                    y,
                    width,
                    height,
                    ..*layout
                };
                *layout = self.inner.apply_layout(candidate)?;
                Ok(())
            })
    }

    /// Set symmetric binning, keeping the region of interest. Idle only.
    pub fn update_binning(&self, bin: u32) -> CameraResult<()> {
        self.inner
            .acquisition
            .while_idle("update binning", |layout| {
                let candidate = FrameLayout { bin, ..*layout };
                *layout = self.inner.apply_layout(candidate)?;
                Ok(())
            })
    }

    /// Put a new worker in the slot. A previous worker may still be
    /// delivering its frame; it is kept so shutdown can stop it.
    fn install(&self, slot: &mut Option<Worker>, worker: Worker) {
        if let Some(previous) = slot.replace(worker) {
            let mut retired = self.retired.lock();
            retired.retain(|w| !w.handle.is_finished());
            if !previous.handle.is_finished() {
                retired.push(previous);
            }
        }
    }

    /// Resolve once the device is Idle.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.acquisition.subscribe();
        // Sender lives in `Acquisition`, which outlives this call
        let _ = rx.wait_for(AcquisitionState::is_idle).await;
    }

    /// Abort anything running and join the worker.
    pub async fn shutdown(&self) {
        if let Err(e) = self.abort_exposure() {
            warn!(error = %e, "Abort during shutdown failed");
        }
        let mut workers: Vec<Worker> = self.retired.lock().drain(..).collect();
        workers.extend(self.worker.lock().take());
        for worker in workers {
            worker.cancel.cancel();
            if let Err(e) = worker.handle.await {
                warn!(error = %e, "Capture worker ended abnormally");
            }
        }
        self.inner.acquisition.finish();
    }
}

impl EngineInner {
    fn check_exposure_range(&self, duration: Duration) -> CameraResult<()> {
        match self.exposure_range {
            Some((min, max)) if duration < min || duration > max => {
                Err(CameraError::InvalidArgument(format!(
                    "exposure {:.6}s outside [{:.6}s, {:.1}s]",
                    duration.as_secs_f64(),
                    min.as_secs_f64(),
                    max.as_secs_f64()
                )))
            }
            _ => Ok(()),
        }
    }

    /// Validate and align a layout, then push it to the camera.
    fn apply_layout(&self, candidate: FrameLayout) -> CameraResult<FrameLayout> {
        let property = self.device.property();
        let bin = candidate.bin;
        if !property.supported_bins.contains(&bin) {
            return Err(CameraError::InvalidArgument(format!(
                "binning {bin}x{bin} not supported (supported: {:?})",
                property.supported_bins
            )));
        }

        let fits = |origin: u32, size: u32, max: u32| {
            size > 0 && origin.checked_add(size).is_some_and(|end| end <= max)
        };
        if !fits(candidate.x, candidate.width, property.max_width)
            || !fits(candidate.y, candidate.height, property.max_height)
        {
            return Err(CameraError::InvalidArgument(format!(
                "frame {}x{}+{}+{} outside sensor {}x{}",
                candidate.width,
                candidate.height,
                candidate.x,
                candidate.y,
                property.max_width,
                property.max_height
            )));
        }

        // Binned width must be a multiple of 8 and height a multiple of 2
        let binned_width = (candidate.width / bin) / 8 * 8;
        let binned_height = (candidate.height / bin) / 2 * 2;
        if binned_width == 0 || binned_height == 0 {
            return Err(CameraError::InvalidArgument(format!(
                "frame {}x{} too small for {bin}x{bin} binning",
                candidate.width, candidate.height
            )));
        }

        let aligned = FrameLayout {
            width: binned_width * bin,
            height: binned_height * bin,
            ..candidate
        };
        aligned.frame_size()?;

        let roi = RoiFormat {
            start_x: aligned.x,
            start_y: aligned.y,
            width: binned_width,
            height: binned_height,
            bin,
        };
        self.device.call(|sdk, id| sdk.set_roi_format(id, roi))?;
        debug!(?roi, "Frame geometry updated");
        Ok(aligned)
    }

    async fn run_exposure(self: Arc<Self>, cancel: CancelToken, layout: FrameLayout, duration: Duration) {
        let budget = self.config.exposure_retries.max(1);
        let mut attempt = 1;

        let outcome = loop {
            match self.attempt(&cancel, &layout, duration, attempt > 1).await {
                Attempt::Failed(e) if attempt < budget && !cancel.is_cancelled() => {
                    warn!(attempt, budget, error = %e, "Exposure attempt failed, retrying");
                    attempt += 1;
                    self.acquisition.set_retries_left(budget - attempt);
                }
                other => break other,
            }
        };

        self.exposure_left.publish(0.0);
        match outcome {
            Attempt::Frame(pixels) => {
                if self.acquisition.complete_exposure() {
                    let delivery = self.dispatcher.dispatch(pixels, &layout, duration);
                    if until_cancelled(&cancel, delivery).await {
                        info!(attempts = attempt, "Exposure complete");
                    } else {
                        warn!("Capture stopped before the sink took the frame, frame dropped");
                    }
                    return;
                }
                info!("Exposure aborted, frame discarded");
            }
            Attempt::Cancelled => {
                self.stop_device_exposure();
                info!("Exposure aborted");
            }
            Attempt::Failed(e) => {
                if self.acquisition.complete_exposure() {
                    let report = self.dispatcher.fail(CameraError::CaptureFailed {
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                    if !until_cancelled(&cancel, report).await {
                        warn!("Capture stopped before the failure was reported");
                    }
                    return;
                }
                self.stop_device_exposure();
                info!(error = %e, "Exposure aborted after failed attempt");
            }
        }

        // Aborted
        self.acquisition.finish();
    }

    /// One integrate-and-read cycle. Retries restart the exposure first.
    async fn attempt(
        &self,
        cancel: &CancelToken,
        layout: &FrameLayout,
        duration: Duration,
        restart: bool,
    ) -> Attempt {
        if restart {
            if let Err(e) = self.device.call(|sdk, id| sdk.start_exposure(id, duration)) {
                return Attempt::Failed(e);
            }
        }
        match self.await_integration(cancel, duration).await {
            Ok(true) => {}
            Ok(false) => return Attempt::Cancelled,
            Err(e) => return Attempt::Failed(e),
        }
        match self.read_frame(layout).await {
            Ok(pixels) => Attempt::Frame(pixels),
            Err(e) => Attempt::Failed(e),
        }
    }

    /// Poll until the sensor finishes integrating. `Ok(false)` means the
    /// token was cancelled first.
    async fn await_integration(&self, cancel: &CancelToken, duration: Duration) -> CameraResult<bool> {
        let started = Instant::now();
        let deadline = duration + INTEGRATION_GRACE;
        loop {
            if cancel.is_cancelled() {
                return Ok(false);
            }

            let elapsed = started.elapsed();
            self.exposure_left
                .publish(duration.saturating_sub(elapsed).as_secs_f64());

            match self.device.call(|sdk, id| sdk.exposure_status(id))? {
                ExposureStatus::Success => return Ok(true),
                ExposureStatus::Failed => {
                    return Err(SdkError::new(SdkError::GENERAL, "exposure failed").into())
                }
                ExposureStatus::Idle | ExposureStatus::Working if elapsed > deadline => {
                    return Err(SdkError::new(SdkError::TIMEOUT, "exposure did not complete").into())
                }
                ExposureStatus::Idle | ExposureStatus::Working => {}
            }

            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    async fn read_frame(&self, layout: &FrameLayout) -> CameraResult<Vec<u8>> {
        let size = layout.frame_size()?;
        let device = self.device.clone();
        tokio::task::spawn_blocking(move || -> CameraResult<Vec<u8>> {
            let mut buf = vec![0u8; size.bytes];
            device.call(|sdk, id| sdk.read_frame(id, &mut buf))?;
            Ok(buf)
        })
        .await
        .map_err(|e| SdkError::new(SdkError::GENERAL, format!("readout task failed: {e}")))?
    }

    fn stop_device_exposure(&self) {
        if let Err(e) = self.device.call(|sdk, id| sdk.stop_exposure(id)) {
            warn!(error = %e, "Failed to stop exposure");
        }
    }

    /// Switch the camera to free-running video and return the frame interval.
    fn begin_video(&self, layout: &FrameLayout) -> CameraResult<Duration> {
        layout.frame_size()?;
        let (exposure_us, _) = self.device.control_value(ControlType::Exposure)?;
        self.device.call(|sdk, id| {
            sdk.set_soft_trigger_mode(id, false)?;
            sdk.start_video_capture(id)
        })?;
        Ok(Duration::from_micros(exposure_us.max(0) as u64))
    }

    async fn run_stream(self: Arc<Self>, cancel: CancelToken, layout: FrameLayout, frame_interval: Duration) {
        let limit = self.config.stream_failure_limit.max(1);
        let mut failures = 0;
        let mut delivered = 0u64;

        while !cancel.is_cancelled() {
            match self.read_video_frame(&layout).await {
                Ok(Some(pixels)) => {
                    failures = 0;
                    if cancel.is_cancelled() {
                        break;
                    }
                    let delivery = self.dispatcher.dispatch(pixels, &layout, frame_interval);
                    if !until_cancelled(&cancel, delivery).await {
                        debug!("Stream stopped while the sink was full, frame dropped");
                        break;
                    }
                    delivered += 1;
                }
                Ok(None) => tokio::time::sleep(self.config.poll_interval()).await,
                Err(e) => {
                    failures += 1;
                    warn!(failures, limit, error = %e, "Streaming read failed");
                    if failures >= limit {
                        let report = self.dispatcher.fail(CameraError::CaptureFailed {
                            attempts: failures,
                            last_error: e.to_string(),
                        });
                        until_cancelled(&cancel, report).await;
                        break;
                    }
                    tokio::time::sleep(self.config.poll_interval()).await;
                }
            }
        }

        let stopped = self.device.call(|sdk, id| {
            sdk.stop_video_capture(id)?;
            sdk.set_soft_trigger_mode(id, true)
        });
        if let Err(e) = stopped {
            warn!(error = %e, "Failed to stop video capture");
        }
        info!(frames = delivered, "Streaming stopped");
        self.acquisition.finish();
    }

    async fn read_video_frame(&self, layout: &FrameLayout) -> CameraResult<Option<Vec<u8>>> {
        let size = layout.frame_size()?;
        let device = self.device.clone();
        tokio::task::spawn_blocking(move || -> CameraResult<Option<Vec<u8>>> {
            let mut buf = vec![0u8; size.bytes];
            let ready = device.call(|sdk, id| sdk.read_video_frame(id, &mut buf))?;
            Ok(ready.then_some(buf))
        })
        .await
        .map_err(|e| SdkError::new(SdkError::GENERAL, format!("video read task failed: {e}")))?
    }
}

/// Drive `delivery` unless the token is cancelled first. Returns whether the
/// delivery completed.
async fn until_cancelled(cancel: &CancelToken, delivery: impl Future<Output = ()>) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = delivery => true,
    }
}
