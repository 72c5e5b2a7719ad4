//! SVBONY Cooler Regulation
//!
//! The camera runs its own regulation loop; this controller forwards the
//! target and cooler switch to it and reports the readback. A periodic tick
//! reads temperature and cooler power and publishes them whether or not the
//! target has been reached.
//!
//! Temperatures cross the SDK boundary in tenths of a degree Celsius.

use crate::components::connection::DeviceHandle;
use crate::config::ThermalConfig;
use crate::sdk::ControlType;
use ccd_core::{CameraError, CameraResult, Observable};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Latest cooler readback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThermalState {
    pub target_c: f64,
    pub current_c: f64,
    pub cooler_enabled: bool,
    /// Cooler drive in percent.
    pub cooler_power: f64,
}

/// Regulation status shown to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThermalStatus {
    /// Cooler off.
    Idle,
    /// Moving toward the target.
    Busy,
    /// Within the threshold of the target.
    Ok,
    /// Last readout or command failed.
    Alert,
}

/// Result of a new temperature target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegulationStatus {
    Reached,
    InProgress,
}

fn to_celsius(raw: i64) -> f64 {
    raw as f64 / 10.0
}

fn to_raw(celsius: f64) -> i64 {
    (celsius * 10.0).round() as i64
}

struct ThermalInner {
    device: Arc<DeviceHandle>,
    config: ThermalConfig,
    target_range: (f64, f64),
    state: Observable<ThermalState>,
    status: Observable<ThermalStatus>,
    temperature: watch::Sender<f64>,
}

impl ThermalInner {
    fn read_state(&self) -> CameraResult<ThermalState> {
        let (current, _) = self.device.control_value(ControlType::CurrentTemperature)?;
        let (power, _) = self.device.control_value(ControlType::CoolerPower)?;
        let (enabled, _) = self.device.control_value(ControlType::CoolerEnable)?;
        let (target, _) = self.device.control_value(ControlType::TargetTemperature)?;
        Ok(ThermalState {
            target_c: to_celsius(target),
            current_c: to_celsius(current),
            cooler_enabled: enabled != 0,
            cooler_power: power as f64,
        })
    }

    fn classify(&self, state: &ThermalState) -> ThermalStatus {
        if !state.cooler_enabled {
            ThermalStatus::Idle
        } else if (state.current_c - state.target_c).abs() <= self.config.threshold_c {
            ThermalStatus::Ok
        } else {
            ThermalStatus::Busy
        }
    }

    fn tick(&self) -> CameraResult<ThermalState> {
        match self.read_state() {
            Ok(state) => {
                self.state.publish(state);
                self.temperature.send_replace(state.current_c);
                self.status.publish_if_changed(self.classify(&state));
                debug!(
                    current_c = state.current_c,
                    target_c = state.target_c,
                    power = state.cooler_power,
                    "Thermal tick"
                );
                Ok(state)
            }
            Err(e) => {
                if self.status.publish_if_changed(ThermalStatus::Alert) {
                    warn!(error = %e, "Temperature readout failed");
                }
                Err(e)
            }
        }
    }

    /// Mark the status as alert when a cooler command fails.
    fn alert_on_error<T>(&self, result: CameraResult<T>) -> CameraResult<T> {
        if let Err(e) = &result {
            warn!(error = %e, "Cooler command failed");
            self.status.publish(ThermalStatus::Alert);
        }
        result
    }
}

/// Periodic temperature readout and cooler commands for one camera.
pub struct ThermalController {
    inner: Arc<ThermalInner>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl ThermalController {
    /// Reads the target range and an initial state. Fails with `Unsupported`
    /// on cameras without a cooler.
    pub fn new(device: Arc<DeviceHandle>, config: ThermalConfig) -> CameraResult<Self> {
        if !device.has_cooler() {
            return Err(CameraError::Unsupported("cooler".into()));
        }

        let target_range = device
            .control_caps()?
            .into_iter()
            .find(|caps| caps.control == ControlType::TargetTemperature)
            .map(|caps| (to_celsius(caps.min), to_celsius(caps.max)))
            .ok_or_else(|| CameraError::Unsupported("target temperature control".into()))?;

        let initial = ThermalState {
            target_c: 0.0,
            current_c: 0.0,
            cooler_enabled: false,
            cooler_power: 0.0,
        };
        let (temperature, _) = watch::channel(0.0);
        let inner = Arc::new(ThermalInner {
            device,
            config,
            target_range,
            state: Observable::new("CCD Temperature", initial).read_only(),
            status: Observable::new("Cooler Status", ThermalStatus::Idle).read_only(),
            temperature,
        });
        // A failed first read leaves the status at Alert; the timer retries.
        let _ = inner.tick();

        Ok(Self {
            inner,
            timer: Mutex::new(None),
        })
    }

    /// Start the periodic readout. Must be called within a Tokio runtime.
    pub fn start(&self) {
        let mut timer = self.timer.lock();
        if timer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let inner = self.inner.clone();
        let period = inner.config.poll_interval();
        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                // Failures are reported through the status property
                let _ = inner.tick();
            }
        }));
        info!(interval_ms = period.as_millis() as u64, "Thermal timer started");
    }

    pub fn stop(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
            info!("Thermal timer stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Read and publish the current temperature now.
    pub fn tick(&self) -> CameraResult<ThermalState> {
        self.inner.tick()
    }

    /// Set the regulation target, switching the cooler on if needed.
    pub fn set_temperature(&self, target_c: f64) -> CameraResult<RegulationStatus> {
        let (min, max) = self.inner.target_range;
        if !target_c.is_finite() || target_c < min || target_c > max {
            return Err(CameraError::InvalidArgument(format!(
                "target temperature {target_c} °C outside [{min}, {max}]"
            )));
        }

        let device = &self.inner.device;
        self.inner.alert_on_error(
            device.set_control_value(ControlType::TargetTemperature, to_raw(target_c), false),
        )?;
        let (enabled, _) = self
            .inner
            .alert_on_error(device.control_value(ControlType::CoolerEnable))?;
        if enabled == 0 {
            self.inner
                .alert_on_error(device.set_control_value(ControlType::CoolerEnable, 1, false))?;
            info!("Cooler enabled");
        }

        let state = self.inner.tick()?;
        info!(target_c, current_c = state.current_c, "Temperature target set");
        if (state.current_c - target_c).abs() <= self.inner.config.threshold_c {
            Ok(RegulationStatus::Reached)
        } else {
            self.inner.status.publish(ThermalStatus::Busy);
            Ok(RegulationStatus::InProgress)
        }
    }

    /// Switch the cooler on or off, keeping the current target.
    pub fn activate_cooler(&self, enable: bool) -> CameraResult<()> {
        self.inner.alert_on_error(self.inner.device.set_control_value(
            ControlType::CoolerEnable,
            i64::from(enable),
            false,
        ))?;
        info!(enable, "Cooler switched");
        self.inner.tick().map(|_| ())
    }

    pub fn state(&self) -> ThermalState {
        self.inner.state.get()
    }

    pub fn status(&self) -> ThermalStatus {
        self.inner.status.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<ThermalState> {
        self.inner.state.subscribe()
    }

    /// Current sensor temperature, for frame metadata.
    pub fn temperature(&self) -> watch::Receiver<f64> {
        self.inner.temperature.subscribe()
    }

    /// Allowed target range in Celsius.
    pub fn target_range(&self) -> (f64, f64) {
        self.inner.target_range
    }
}

impl Drop for ThermalController {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::connection::CameraSelector;
    use crate::sdk::simulated::{SimulatedCameraSpec, SimulatedSdk};
    use std::time::Duration;

    fn controller() -> (Arc<SimulatedSdk>, ThermalController) {
        let sdk = Arc::new(SimulatedSdk::new());
        let device = Arc::new(DeviceHandle::open(sdk.clone(), &CameraSelector::First).unwrap());
        let config = ThermalConfig {
            poll_interval_ms: 10,
            ..ThermalConfig::default()
        };
        (sdk, ThermalController::new(device, config).unwrap())
    }

    #[test]
    fn test_initial_readout() {
        let (_sdk, thermal) = controller();
        let state = thermal.state();
        assert_eq!(state.current_c, 20.0);
        assert!(!state.cooler_enabled);
        assert_eq!(thermal.status(), ThermalStatus::Idle);
        assert_eq!(thermal.target_range(), (-35.0, 30.0));
    }

    #[test]
    fn test_target_out_of_range() {
        let (sdk, thermal) = controller();
        let err = thermal.set_temperature(-50.0).unwrap_err();
        assert!(matches!(err, CameraError::InvalidArgument(_)));
        assert_eq!(sdk.raw_control(ControlType::CoolerEnable), Some(0));
    }

    #[test]
    fn test_set_temperature_enables_cooler() {
        let (sdk, thermal) = controller();
        let status = thermal.set_temperature(-10.0).unwrap();
        assert_eq!(status, RegulationStatus::InProgress);
        assert_eq!(sdk.raw_control(ControlType::CoolerEnable), Some(1));
        assert_eq!(sdk.raw_control(ControlType::TargetTemperature), Some(-100));
        assert_eq!(thermal.status(), ThermalStatus::Busy);
    }

    #[test]
    fn test_target_at_current_is_reached() {
        let (_sdk, thermal) = controller();
        assert_eq!(thermal.set_temperature(20.0).unwrap(), RegulationStatus::Reached);
    }

    #[test]
    fn test_readout_failure_is_alert() {
        let (sdk, thermal) = controller();
        sdk.fail_temperature_reads(true);
        assert!(thermal.tick().is_err());
        assert_eq!(thermal.status(), ThermalStatus::Alert);

        sdk.fail_temperature_reads(false);
        thermal.tick().unwrap();
        assert_eq!(thermal.status(), ThermalStatus::Idle);
    }

    #[test]
    fn test_cooler_off() {
        let (sdk, thermal) = controller();
        thermal.activate_cooler(true).unwrap();
        assert!(thermal.state().cooler_enabled);
        thermal.activate_cooler(false).unwrap();
        assert_eq!(sdk.raw_control(ControlType::CoolerEnable), Some(0));
        assert_eq!(thermal.status(), ThermalStatus::Idle);
    }

    #[tokio::test]
    async fn test_timer_publishes() {
        let (_sdk, thermal) = controller();
        let mut rx = thermal.subscribe();
        thermal.start();
        assert!(thermal.is_running());

        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .unwrap()
            .unwrap();
        thermal.stop();
        assert!(!thermal.is_running());
    }
}
