//! SVBONY Camera Driver
//!
//! [`SvbonyCamera`] owns every component for one connected camera and is the
//! surface the hosting framework talks to.
//!
//! # Example
//!
//! ```rust,ignore
//! let sdk = Arc::new(SimulatedSdk::new());
//! let (sink, mut frames) = ChannelSink::new(16);
//! let camera = SvbonyCamera::connect(sdk, DriverConfig::default(), Arc::new(sink))?;
//!
//! camera.set_control(ControlType::Gain, 200.0)?;
//! camera.start_exposure(Duration::from_secs(2))?;
//! if let Some(FrameEvent::Frame(frame)) = frames.recv().await {
//!     println!("{}x{} frame", frame.width, frame.height);
//! }
//! camera.disconnect().await?;
//! ```

use crate::components::acquisition::{Acquisition, AcquisitionState, FrameLayout};
use crate::components::capture::CaptureEngine;
use crate::components::connection::DeviceHandle;
use crate::components::controls::{ControlSynchronizer, FlipAxis, RecorderFormat};
use crate::components::dispatch::{FrameSink, ImageDispatcher};
use crate::components::guide::{AxisState, GuideController, PulseStatus};
use crate::components::settings::{PersistedSettings, SettingsStore};
use crate::components::thermal::{RegulationStatus, ThermalController, ThermalState, ThermalStatus};
use crate::config::DriverConfig;
use crate::sdk::{CameraSdk, ControlType, GuideAxis, GuideDirection, RoiFormat, VideoFormat};
use ccd_core::{CameraError, CameraResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Name the driver registers under before a camera is attached.
pub const DEFAULT_NAME: &str = "SVBONY CCD";

/// Header record value.
#[derive(Debug, Clone, PartialEq)]
pub enum FitsValue {
    Int(i64),
    Float(f64),
    Text(String),
}

/// One header record the framework adds to every frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FitsKeyword {
    pub name: &'static str,
    pub value: FitsValue,
    pub comment: &'static str,
}

impl FitsKeyword {
    fn new(name: &'static str, value: FitsValue, comment: &'static str) -> Self {
        Self {
            name,
            value,
            comment,
        }
    }
}

/// One connected SVBONY camera.
pub struct SvbonyCamera {
    device: Arc<DeviceHandle>,
    acquisition: Arc<Acquisition>,
    controls: ControlSynchronizer,
    capture: CaptureEngine,
    guide: GuideController,
    thermal: Option<ThermalController>,
    settings: Option<SettingsStore>,
}

impl SvbonyCamera {
    pub fn default_name() -> &'static str {
        DEFAULT_NAME
    }

    /// Open the configured camera and bring every component up.
    ///
    /// Selects the camera, reads its capabilities, builds the control
    /// catalog, sets a full-frame 1x1 region with the first advertised video
    /// format, switches to soft-trigger stills, restores saved settings and
    /// starts the thermal timer on cooled cameras. Must be called within a
    /// Tokio runtime.
    pub fn connect(
        sdk: Arc<dyn CameraSdk>,
        config: DriverConfig,
        sink: Arc<dyn FrameSink>,
    ) -> CameraResult<Self> {
        config.validate()?;
        let device = Arc::new(DeviceHandle::open(sdk, &config.selector())?);

        let property = device.property();
        let format = *property
            .supported_video_formats
            .first()
            .ok_or_else(|| CameraError::Unsupported("any advertised video format".into()))?;
        let layout = FrameLayout::full_frame(property, format);
        let roi = RoiFormat {
            start_x: 0,
            start_y: 0,
            width: property.max_width,
            height: property.max_height,
            bin: 1,
        };
        layout.frame_size()?;
        device.call(|sdk, id| {
            sdk.set_roi_format(id, roi)?;
            sdk.set_video_format(id, format)?;
            sdk.set_soft_trigger_mode(id, true)
        })?;

        let acquisition = Arc::new(Acquisition::new(layout));
        let controls = ControlSynchronizer::new(device.clone(), acquisition.clone());
        let advertised = device.control_caps()?.len();
        controls.create_controls(advertised)?;
        controls.update_controls()?;

        let thermal = if device.has_cooler() {
            Some(ThermalController::new(device.clone(), config.thermal)?)
        } else {
            None
        };
        let dispatcher = Arc::new(ImageDispatcher::new(
            device.clone(),
            sink,
            thermal.as_ref().map(ThermalController::temperature),
        ));
        let capture = CaptureEngine::new(
            device.clone(),
            acquisition.clone(),
            dispatcher,
            config.capture,
        )?;
        let guide = GuideController::new(device.clone());

        let camera = Self {
            device,
            acquisition,
            controls,
            capture,
            guide,
            thermal,
            settings: config.settings_path.clone().map(SettingsStore::new),
        };

        camera.restore_settings();
        if let Some(thermal) = &camera.thermal {
            thermal.start();
        }

        info!(
            name = %camera.device_name(),
            controls = camera.controls.control_count(),
            cooler = camera.thermal.is_some(),
            guider = camera.device.has_guider(),
            "Camera connected"
        );
        Ok(camera)
    }

    /// Abort any capture, stop the timers and close the SDK session.
    /// Later commands fail with `NotConnected`.
    pub async fn disconnect(&self) -> CameraResult<()> {
        if !self.device.is_open() {
            return Ok(());
        }
        self.capture.shutdown().await;
        self.guide.stop();
        if let Some(thermal) = &self.thermal {
            thermal.stop();
        }
        self.device.close()?;
        info!(name = %self.device_name(), "Camera disconnected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.device.is_open()
    }

    fn ensure_connected(&self) -> CameraResult<()> {
        if self.device.is_open() {
            Ok(())
        } else {
            Err(CameraError::NotConnected)
        }
    }

    /// "SVBONY CCD <camera name>"
    pub fn device_name(&self) -> String {
        format!("{DEFAULT_NAME} {}", self.device.info().name)
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    pub fn controls(&self) -> &ControlSynchronizer {
        &self.controls
    }

    // =========================================================================
    // Acquisition
    // =========================================================================

    pub fn state(&self) -> AcquisitionState {
        self.acquisition.state()
    }

    pub fn subscribe_state(&self) -> tokio::sync::watch::Receiver<AcquisitionState> {
        self.acquisition.subscribe()
    }

    pub fn frame_layout(&self) -> FrameLayout {
        self.acquisition.layout()
    }

    pub fn start_exposure(&self, duration: Duration) -> CameraResult<()> {
        self.ensure_connected()?;
        self.capture.start_exposure(duration)
    }

    pub fn abort_exposure(&self) -> CameraResult<()> {
        self.capture.abort_exposure()
    }

    pub fn start_streaming(&self) -> CameraResult<()> {
        self.ensure_connected()?;
        self.capture.start_streaming()
    }

    pub fn stop_streaming(&self) -> CameraResult<()> {
        self.capture.stop_streaming()
    }

    pub fn update_frame(&self, x: u32, y: u32, width: u32, height: u32) -> CameraResult<()> {
        self.ensure_connected()?;
        self.capture.update_frame(x, y, width, height)
    }

    pub fn update_binning(&self, bin: u32) -> CameraResult<()> {
        self.ensure_connected()?;
        self.capture.update_binning(bin)?;
        // Mono-bin may have changed the colour tag
        self.controls.publish_format();
        Ok(())
    }

    /// Resolve once no capture is running.
    pub async fn wait_idle(&self) {
        self.capture.wait_idle().await;
    }

    /// Remaining exposure time in seconds.
    pub fn exposure_left(&self) -> f64 {
        self.capture.exposure_left().get()
    }

    // =========================================================================
    // Controls
    // =========================================================================

    pub fn create_controls(&self, count: usize) -> CameraResult<()> {
        self.ensure_connected()?;
        self.controls.create_controls(count)
    }

    pub fn update_controls(&self) -> CameraResult<()> {
        self.ensure_connected()?;
        self.controls.update_controls()
    }

    pub fn set_control(&self, control: ControlType, value: f64) -> CameraResult<()> {
        self.ensure_connected()?;
        self.controls.set_control(control, value)
    }

    pub fn control(&self, control: ControlType) -> CameraResult<f64> {
        self.controls.control(control)
    }

    pub fn set_auto(&self, control: ControlType, enabled: bool) -> CameraResult<()> {
        self.ensure_connected()?;
        self.controls.set_auto(control, enabled)
    }

    pub fn set_flip(&self, axis: FlipAxis, enabled: bool) -> CameraResult<()> {
        self.ensure_connected()?;
        self.controls.set_flip(axis, enabled)
    }

    pub fn set_video_format(&self, index: usize) -> CameraResult<VideoFormat> {
        self.ensure_connected()?;
        self.controls.set_video_format(index)
    }

    /// Capture format selection by advertised index.
    pub fn set_capture_format(&self, index: usize) -> CameraResult<VideoFormat> {
        self.set_video_format(index)
    }

    pub fn video_format(&self) -> VideoFormat {
        self.controls.video_format()
    }

    pub fn recorder_format(&self) -> RecorderFormat {
        self.controls.recorder_format()
    }

    /// Bayer pattern string for the current format, when frames are raw
    /// colour mosaics.
    pub fn bayer_string(&self) -> Option<&'static str> {
        self.acquisition
            .layout()
            .bayer(self.device.property(), self.device.property_ex())
            .map(|pattern| pattern.as_str())
    }

    // =========================================================================
    // Guiding
    // =========================================================================

    pub fn guide_pulse(&self, direction: GuideDirection, duration: Duration) -> CameraResult<PulseStatus> {
        self.ensure_connected()?;
        self.guide.guide_pulse(direction, duration)
    }

    pub fn guide_north(&self, ms: u64) -> CameraResult<PulseStatus> {
        self.guide_pulse(GuideDirection::North, Duration::from_millis(ms))
    }

    pub fn guide_south(&self, ms: u64) -> CameraResult<PulseStatus> {
        self.guide_pulse(GuideDirection::South, Duration::from_millis(ms))
    }

    pub fn guide_east(&self, ms: u64) -> CameraResult<PulseStatus> {
        self.guide_pulse(GuideDirection::East, Duration::from_millis(ms))
    }

    pub fn guide_west(&self, ms: u64) -> CameraResult<PulseStatus> {
        self.guide_pulse(GuideDirection::West, Duration::from_millis(ms))
    }

    pub fn guide_axis(&self, axis: GuideAxis) -> AxisState {
        self.guide.axis_state(axis)
    }

    pub fn guide_subscribe(&self, axis: GuideAxis) -> tokio::sync::watch::Receiver<AxisState> {
        self.guide.subscribe(axis)
    }

    // =========================================================================
    // Cooling
    // =========================================================================

    fn thermal(&self) -> CameraResult<&ThermalController> {
        self.thermal
            .as_ref()
            .ok_or_else(|| CameraError::Unsupported("cooler".into()))
    }

    pub fn has_cooler(&self) -> bool {
        self.thermal.is_some()
    }

    pub fn set_temperature(&self, target_c: f64) -> CameraResult<RegulationStatus> {
        self.ensure_connected()?;
        self.thermal()?.set_temperature(target_c)
    }

    pub fn activate_cooler(&self, enable: bool) -> CameraResult<()> {
        self.ensure_connected()?;
        self.thermal()?.activate_cooler(enable)
    }

    pub fn thermal_state(&self) -> CameraResult<ThermalState> {
        Ok(self.thermal()?.state())
    }

    pub fn thermal_status(&self) -> CameraResult<ThermalStatus> {
        Ok(self.thermal()?.status())
    }

    pub fn thermal_subscribe(&self) -> CameraResult<tokio::sync::watch::Receiver<ThermalState>> {
        Ok(self.thermal()?.subscribe())
    }

    // =========================================================================
    // Metadata and settings
    // =========================================================================

    /// Header records for the next frame.
    pub fn fits_keywords(&self) -> Vec<FitsKeyword> {
        let mut keywords = Vec::new();

        if let Ok(gain) = self.controls.control(ControlType::Gain) {
            keywords.push(FitsKeyword::new("GAIN", FitsValue::Float(gain), "Gain"));
        }
        if let Ok(offset) = self.controls.control(ControlType::BlackLevel) {
            keywords.push(FitsKeyword::new("OFFSET", FitsValue::Float(offset), "Offset"));
        }
        if let Some(thermal) = &self.thermal {
            let state = thermal.state();
            keywords.push(FitsKeyword::new(
                "CCD-TEMP",
                FitsValue::Float(state.current_c),
                "CCD Temperature (Celsius)",
            ));
            if state.cooler_enabled {
                keywords.push(FitsKeyword::new(
                    "SET-TEMP",
                    FitsValue::Float(state.target_c),
                    "CCD Temperature Setpoint (Celsius)",
                ));
            }
        }
        if let Some(pattern) = self.bayer_string() {
            keywords.push(FitsKeyword::new(
                "XBAYROFF",
                FitsValue::Int(0),
                "X offset of Bayer array",
            ));
            keywords.push(FitsKeyword::new(
                "YBAYROFF",
                FitsValue::Int(0),
                "Y offset of Bayer array",
            ));
            keywords.push(FitsKeyword::new(
                "BAYERPAT",
                FitsValue::Text(pattern.to_string()),
                "Bayer color pattern",
            ));
        }
        keywords.push(FitsKeyword::new(
            "SVB-SN",
            FitsValue::Text(self.device.info().serial_number.clone()),
            "SVBONY Camera serial number",
        ));
        keywords
    }

    /// Values that survive a reconnect.
    pub fn save_settings(&self) -> PersistedSettings {
        PersistedSettings {
            video_format: Some(self.controls.video_format()),
            flip_horizontal: self.controls.flip(FlipAxis::Horizontal),
            flip_vertical: self.controls.flip(FlipAxis::Vertical),
        }
    }

    /// Write [`Self::save_settings`] to the configured settings file.
    pub fn persist_settings(&self) -> anyhow::Result<()> {
        match &self.settings {
            Some(store) => store.save(&self.save_settings()),
            None => Ok(()),
        }
    }

    /// Apply saved settings. Values the camera cannot honour are skipped.
    pub fn apply_settings(&self, settings: &PersistedSettings) {
        if let Some(format) = settings.video_format {
            match self.controls.video_formats().iter().position(|f| *f == format) {
                Some(index) => {
                    if let Err(e) = self.controls.set_video_format(index) {
                        warn!(?format, error = %e, "Failed to restore video format");
                    }
                }
                None => warn!(?format, "Saved video format not offered by camera, ignored"),
            }
        }
        self.controls
            .restore_flip(FlipAxis::Horizontal, settings.flip_horizontal);
        self.controls
            .restore_flip(FlipAxis::Vertical, settings.flip_vertical);
    }

    fn restore_settings(&self) {
        let Some(store) = &self.settings else {
            return;
        };
        match store.load() {
            Ok(Some(settings)) => {
                self.apply_settings(&settings);
                info!(path = %store.path().display(), "Settings restored");
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to load saved settings"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::dispatch::ChannelSink;
    use crate::sdk::simulated::{SimulatedCameraSpec, SimulatedSdk};

    fn connect(spec: SimulatedCameraSpec, config: DriverConfig) -> (Arc<SimulatedSdk>, SvbonyCamera) {
        let sdk = Arc::new(SimulatedSdk::with_cameras(vec![spec]));
        let (sink, _rx) = ChannelSink::new(4);
        let camera = SvbonyCamera::connect(sdk.clone(), config, Arc::new(sink)).unwrap();
        (sdk, camera)
    }

    #[tokio::test]
    async fn test_connect_configures_device() {
        let (sdk, camera) = connect(SimulatedCameraSpec::cooled_color(), DriverConfig::default());

        assert_eq!(SvbonyCamera::default_name(), "SVBONY CCD");
        assert_eq!(camera.device_name(), "SVBONY CCD SVBONY SV605CC");
        assert_eq!(sdk.active_format(), Some(VideoFormat::Raw8));
        assert_eq!(sdk.active_roi().map(|roi| roi.bin), Some(1));
        assert!(camera.has_cooler());
        assert_eq!(camera.bayer_string(), Some("RGGB"));
        camera.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_after_disconnect() {
        let (sdk, camera) = connect(SimulatedCameraSpec::cooled_color(), DriverConfig::default());
        camera.disconnect().await.unwrap();

        assert!(!sdk.is_open());
        assert_eq!(
            camera.start_exposure(Duration::from_secs(1)).unwrap_err(),
            CameraError::NotConnected
        );
        assert_eq!(
            camera.set_control(ControlType::Gain, 10.0).unwrap_err(),
            CameraError::NotConnected
        );
        // Second disconnect is a no-op
        camera.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_uncooled_camera() {
        let (_sdk, camera) = connect(SimulatedCameraSpec::mono_guider(), DriverConfig::default());
        assert!(!camera.has_cooler());
        assert!(matches!(
            camera.set_temperature(-10.0),
            Err(CameraError::Unsupported(_))
        ));
        assert_eq!(camera.bayer_string(), None);
    }

    #[tokio::test]
    async fn test_fits_keywords() {
        let (_sdk, camera) = connect(SimulatedCameraSpec::cooled_color(), DriverConfig::default());
        camera.set_temperature(-5.0).unwrap();

        let keywords = camera.fits_keywords();
        let find = |name: &str| keywords.iter().find(|k| k.name == name).map(|k| k.value.clone());
        assert_eq!(find("GAIN"), Some(FitsValue::Float(100.0)));
        assert_eq!(find("OFFSET"), Some(FitsValue::Float(10.0)));
        assert_eq!(find("SET-TEMP"), Some(FitsValue::Float(-5.0)));
        assert_eq!(find("BAYERPAT"), Some(FitsValue::Text("RGGB".into())));
        assert_eq!(find("SVB-SN"), Some(FitsValue::Text("SIM0605CC0001".into())));
        assert!(find("CCD-TEMP").is_some());

        // Luma formats carry no Bayer records
        camera.set_video_format(2).unwrap();
        assert!(camera.fits_keywords().iter().all(|k| k.name != "BAYERPAT"));
    }

    #[tokio::test]
    async fn test_settings_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = DriverConfig {
            settings_path: Some(dir.path().join("sv605.toml")),
            ..DriverConfig::default()
        };

        let (_sdk, camera) = connect(SimulatedCameraSpec::cooled_color(), config.clone());
        camera.set_video_format(1).unwrap();
        camera.set_flip(FlipAxis::Vertical, true).unwrap();
        camera.persist_settings().unwrap();
        camera.disconnect().await.unwrap();

        let (sdk, camera) = connect(SimulatedCameraSpec::cooled_color(), config);
        assert_eq!(camera.video_format(), VideoFormat::Raw16);
        assert_eq!(sdk.active_format(), Some(VideoFormat::Raw16));
        assert_eq!(sdk.raw_control(ControlType::Flip), Some(crate::sdk::FLIP_VERTICAL));
        camera.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_saved_format_ignored() {
        let (_sdk, camera) = connect(SimulatedCameraSpec::mono_guider(), DriverConfig::default());
        camera.apply_settings(&PersistedSettings {
            video_format: Some(VideoFormat::Rgb24),
            flip_horizontal: true,
            flip_vertical: false,
        });
        assert_eq!(camera.video_format(), VideoFormat::Y8);
    }
}
