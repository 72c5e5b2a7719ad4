//! SVBONY Guide Port
//!
//! Timed directional pulses on two independent axes. Each axis holds at most
//! one pulse: a new pulse on a busy axis replaces the pending one and restarts
//! its timer, while the opposite axis is left alone. The axis returns to idle
//! when its timer fires and the stop command has been issued.

use crate::components::connection::DeviceHandle;
use crate::sdk::{GuideAxis, GuideDirection};
use ccd_core::{CameraError, CameraResult, Observable};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Immediate result of a pulse request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseStatus {
    /// Pulse is running; the axis goes idle when it expires.
    Busy,
    /// The camera rejected the guide command.
    Alert,
}

/// Observable state of one guide axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisState {
    Idle,
    Pulsing {
        direction: GuideDirection,
        until: Instant,
    },
}

impl AxisState {
    pub fn is_idle(&self) -> bool {
        matches!(self, AxisState::Idle)
    }
}

struct ActivePulse {
    direction: GuideDirection,
    generation: u64,
    timer: JoinHandle<()>,
}

struct AxisSlot {
    pulse: Mutex<Option<ActivePulse>>,
    state: Observable<AxisState>,
    generation: Mutex<u64>,
}

impl AxisSlot {
    fn new(name: &str) -> Self {
        Self {
            pulse: Mutex::new(None),
            state: Observable::new(name, AxisState::Idle).read_only(),
            generation: Mutex::new(0),
        }
    }

    fn next_generation(&self) -> u64 {
        let mut generation = self.generation.lock();
        *generation += 1;
        *generation
    }
}

struct GuideInner {
    device: Arc<DeviceHandle>,
    north_south: AxisSlot,
    east_west: AxisSlot,
}

impl GuideInner {
    fn slot(&self, axis: GuideAxis) -> &AxisSlot {
        match axis {
            GuideAxis::NorthSouth => &self.north_south,
            GuideAxis::EastWest => &self.east_west,
        }
    }

    fn try_pulse_off(&self, direction: GuideDirection) -> CameraResult<()> {
        self.device.call(|sdk, id| sdk.pulse_guide_off(id, direction))
    }

    fn pulse_off(&self, direction: GuideDirection) {
        if let Err(e) = self.try_pulse_off(direction) {
            warn!(?direction, error = %e, "Failed to end guide pulse");
        }
    }

    /// Timer expiry. A stale timer (replaced pulse) leaves the axis alone.
    fn expire(&self, axis: GuideAxis, generation: u64) {
        let slot = self.slot(axis);
        let mut pulse = slot.pulse.lock();
        let current = pulse.as_ref().is_some_and(|p| p.generation == generation);
        if !current {
            return;
        }
        if let Some(active) = pulse.take() {
            self.pulse_off(active.direction);
            slot.state.publish(AxisState::Idle);
            debug!(?axis, direction = ?active.direction, "Guide pulse finished");
        }
    }
}

/// Issues timed guide pulses through the camera's guide port.
pub struct GuideController {
    inner: Arc<GuideInner>,
}

impl GuideController {
    pub fn new(device: Arc<DeviceHandle>) -> Self {
        Self {
            inner: Arc::new(GuideInner {
                device,
                north_south: AxisSlot::new("Guide NS"),
                east_west: AxisSlot::new("Guide WE"),
            }),
        }
    }

    /// Pulse `direction` for `duration`.
    ///
    /// Returns `Busy` once the pulse is on, `Alert` if the camera refused the
    /// command, or `Unsupported` without a guide port. Must be called within
    /// a Tokio runtime.
    ///
    /// A pending pulse keeps its timer until the replacement is confirmed on,
    /// so a refused command never leaves the port driven without a stop.
    pub fn guide_pulse(&self, direction: GuideDirection, duration: Duration) -> CameraResult<PulseStatus> {
        if !self.inner.device.has_guider() {
            return Err(CameraError::Unsupported("guide port".into()));
        }

        let axis = direction.axis();
        let slot = self.inner.slot(axis);
        let mut pulse = slot.pulse.lock();

        let previous = pulse.take();
        if let Some(active) = previous.as_ref().filter(|p| p.direction != direction) {
            if let Err(e) = self.inner.try_pulse_off(active.direction) {
                warn!(direction = ?active.direction, error = %e, "Failed to end replaced guide pulse");
                *pulse = previous;
                return Ok(PulseStatus::Alert);
            }
        }

        if let Err(e) = self.inner.device.call(|sdk, id| sdk.pulse_guide_on(id, direction)) {
            warn!(?direction, error = %e, "Guide command failed");
            match previous {
                // Still on in the same direction; its timer will stop it
                Some(active) if active.direction == direction => *pulse = Some(active),
                other => {
                    if let Some(active) = other {
                        active.timer.abort();
                    }
                    slot.state.publish(AxisState::Idle);
                }
            }
            return Ok(PulseStatus::Alert);
        }

        if let Some(active) = previous {
            active.timer.abort();
            debug!(?axis, replaced = ?active.direction, "Guide pulse replaced");
        }

        let generation = slot.next_generation();
        let inner = self.inner.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            inner.expire(axis, generation);
        });
        *pulse = Some(ActivePulse {
            direction,
            generation,
            timer,
        });
        slot.state.publish(AxisState::Pulsing {
            direction,
            until: Instant::now() + duration,
        });

        debug!(?direction, duration_ms = duration.as_millis() as u64, "Guide pulse started");
        Ok(PulseStatus::Busy)
    }

    /// End any pulse on `axis` now.
    pub fn cancel(&self, axis: GuideAxis) {
        let slot = self.inner.slot(axis);
        let mut pulse = slot.pulse.lock();
        if let Some(active) = pulse.take() {
            active.timer.abort();
            self.inner.pulse_off(active.direction);
            debug!(?axis, "Guide pulse cancelled");
        }
        slot.state.publish(AxisState::Idle);
    }

    /// End pulses on both axes.
    pub fn stop(&self) {
        self.cancel(GuideAxis::NorthSouth);
        self.cancel(GuideAxis::EastWest);
    }

    pub fn axis_state(&self, axis: GuideAxis) -> AxisState {
        self.inner.slot(axis).state.get()
    }

    pub fn subscribe(&self, axis: GuideAxis) -> tokio::sync::watch::Receiver<AxisState> {
        self.inner.slot(axis).state.subscribe()
    }
}

impl Drop for GuideController {
    fn drop(&mut self) {
        for axis in [GuideAxis::NorthSouth, GuideAxis::EastWest] {
            if let Some(active) = self.inner.slot(axis).pulse.lock().take() {
                active.timer.abort();
            }
        }
    }
}
