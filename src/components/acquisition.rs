//! Acquisition state shared by the capture engine and the control synchronizer.
//!
//! One [`Acquisition`] exists per device. It holds the [`AcquisitionState`]
//! and the [`FrameLayout`] used to size readout buffers. All transitions take
//! the same lock, so checking "is the device idle" and acting on the answer
//! is atomic with respect to starting a capture.
//!
//! Legal transitions:
//!
//! ```text
//! Idle -> Exposing -> Idle
//! Idle -> Streaming -> Idle
//! Exposing | Streaming -> Aborting -> Idle
//! ```

use crate::sdk::{CameraProperty, CameraPropertyExtended, VideoFormat};
use ccd_core::frame::{BayerPattern, PixelEncoding};
use ccd_core::limits::{validate_frame_size, FrameSize};
use ccd_core::{CameraError, CameraResult};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

/// What the sensor is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Idle,
    Exposing {
        duration: Duration,
        started_at: Instant,
        retries_left: u32,
    },
    Streaming,
    Aborting,
}

impl AcquisitionState {
    pub fn name(&self) -> &'static str {
        match self {
            AcquisitionState::Idle => "idle",
            AcquisitionState::Exposing { .. } => "exposing",
            AcquisitionState::Streaming => "streaming",
            AcquisitionState::Aborting => "aborting",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, AcquisitionState::Idle)
    }

    /// Whether `next` is reachable from `self` in one step.
    pub fn can_transition_to(&self, next: &AcquisitionState) -> bool {
        use AcquisitionState::*;
        matches!(
            (self, next),
            (Idle, Exposing { .. })
                | (Idle, Streaming)
                | (Exposing { .. }, Idle)
                | (Streaming, Idle)
                | (Exposing { .. }, Aborting)
                | (Streaming, Aborting)
                | (Aborting, Idle)
        )
    }
}

/// Readout geometry and encoding used by the next capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    /// Origin in unbinned sensor pixels.
    pub x: u32,
    pub y: u32,
    /// Size in unbinned sensor pixels.
    pub width: u32,
    pub height: u32,
    pub bin: u32,
    pub format: VideoFormat,
}

impl FrameLayout {
    pub fn full_frame(property: &CameraProperty, format: VideoFormat) -> Self {
        Self {
            x: 0,
            y: 0,
            width: property.max_width,
            height: property.max_height,
            bin: 1,
            format,
        }
    }

    /// Size of the frame the SDK delivers.
    pub fn binned_size(&self) -> (u32, u32) {
        let bin = self.bin.max(1);
        (self.width / bin, self.height / bin)
    }

    /// Buffer sizing for the current format and binning.
    pub fn frame_size(&self) -> CameraResult<FrameSize> {
        let (width, height) = self.binned_size();
        validate_frame_size(width, height, self.format.bytes_per_pixel())
    }

    /// Mono-bin merges colour channels when binning on supporting sensors.
    pub fn mono_bin_active(&self, property_ex: &CameraPropertyExtended) -> bool {
        property_ex.supports_mono_bin && self.bin > 1
    }

    /// Bayer pattern to report, if frames are raw colour mosaics.
    pub fn bayer(
        &self,
        property: &CameraProperty,
        property_ex: &CameraPropertyExtended,
    ) -> Option<BayerPattern> {
        let colour = property.is_color && !self.mono_bin_active(property_ex);
        (colour && self.format.is_raw()).then_some(property.bayer_pattern)
    }

    pub fn encoding(
        &self,
        property: &CameraProperty,
        property_ex: &CameraPropertyExtended,
    ) -> PixelEncoding {
        self.format.encoding(self.bayer(property, property_ex))
    }
}

/// Per-device acquisition state cell.
pub struct Acquisition {
    transition: Mutex<()>,
    state: watch::Sender<AcquisitionState>,
    layout: Mutex<FrameLayout>,
}

impl Acquisition {
    pub fn new(layout: FrameLayout) -> Self {
        let (state, _) = watch::channel(AcquisitionState::Idle);
        Self {
            transition: Mutex::new(()),
            state,
            layout: Mutex::new(layout),
        }
    }

    pub fn state(&self) -> AcquisitionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AcquisitionState> {
        self.state.subscribe()
    }

    pub fn layout(&self) -> FrameLayout {
        *self.layout.lock()
    }

    /// Move to `next` if the current state satisfies `allowed`.
    ///
    /// Returns the state that was replaced, or `InvalidState` naming
    /// `operation` and leaving the state untouched.
    pub fn transition(
        &self,
        operation: &'static str,
        allowed: impl FnOnce(&AcquisitionState) -> bool,
        next: AcquisitionState,
    ) -> CameraResult<AcquisitionState> {
        let _guard = self.transition.lock();
        let current = self.state();
        if !allowed(&current) || !current.can_transition_to(&next) {
            return Err(CameraError::InvalidState {
                operation,
                state: current.name(),
            });
        }
        self.state.send_replace(next);
        debug!(from = current.name(), to = next.name(), "Acquisition state changed");
        Ok(current)
    }

    /// Leave Idle for `next` and return the layout the capture must use.
    ///
    /// The layout is read under the transition lock, so a geometry change
    /// either lands before the capture or is rejected.
    pub fn begin(
        &self,
        operation: &'static str,
        next: AcquisitionState,
    ) -> CameraResult<FrameLayout> {
        let _guard = self.transition.lock();
        let current = self.state();
        if !current.is_idle() || !current.can_transition_to(&next) {
            return Err(CameraError::InvalidState {
                operation,
                state: current.name(),
            });
        }
        let layout = *self.layout.lock();
        self.state.send_replace(next);
        debug!(from = current.name(), to = next.name(), "Acquisition state changed");
        Ok(layout)
    }

    /// Claim a finished still exposure: Exposing goes to Idle and `true` is
    /// returned. Any other state, Aborting included, is left alone.
    pub fn complete_exposure(&self) -> bool {
        self.transition(
            "complete exposure",
            |state| matches!(state, AcquisitionState::Exposing { .. }),
            AcquisitionState::Idle,
        )
        .is_ok()
    }

    /// Return to Idle from whatever active state the worker ended in.
    pub fn finish(&self) {
        let _guard = self.transition.lock();
        let current = self.state();
        if !current.is_idle() {
            self.state.send_replace(AcquisitionState::Idle);
            debug!(from = current.name(), to = "idle", "Acquisition state changed");
        }
    }

    /// Update the retry budget of an in-flight exposure.
    pub fn set_retries_left(&self, retries: u32) {
        let _guard = self.transition.lock();
        self.state.send_if_modified(|state| match state {
            AcquisitionState::Exposing { retries_left, .. } => {
                *retries_left = retries;
                true
            }
            _ => false,
        });
    }

    /// Run `f` only while Idle, holding off any capture start until it returns.
    pub fn while_idle<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut FrameLayout) -> CameraResult<T>,
    ) -> CameraResult<T> {
        let _guard = self.transition.lock();
        let current = self.state();
        if !current.is_idle() {
            return Err(CameraError::InvalidState {
                operation,
                state: current.name(),
            });
        }
        let mut layout = self.layout.lock();
        let mut candidate = *layout;
        let result = f(&mut candidate)?;
        *layout = candidate;
        Ok(result)
    }
}
