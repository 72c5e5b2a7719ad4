//! Simulated SVBONY SDK
//!
//! Stands in for the vendor library so the driver can be exercised without a
//! camera attached. The simulation keeps just enough physics to be useful:
//!
//! - Exposures complete after their requested duration (wall clock).
//! - Streaming produces a frame every exposure interval.
//! - The sensor temperature relaxes toward the cooler target (cooler on) or
//!   the ambient temperature (cooler off) at a fixed rate.
//! - Readout and command failures can be injected for retry/alert testing.
//!
//! Every call completes without sleeping, so the simulation is safe to call
//! from async tasks.

use super::{
    CameraId, CameraInfo, CameraProperty, CameraPropertyExtended, CameraSdk, ControlCaps,
    ControlType, ExposureStatus, GuideDirection, RoiFormat, VideoFormat,
};
use ccd_core::frame::BayerPattern;
use ccd_core::SdkError;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Sensor temperature change rate in °C per second.
const THERMAL_RATE_C_PER_SEC: f64 = 5.0;
/// Shortest frame interval produced while streaming.
const MIN_FRAME_INTERVAL: Duration = Duration::from_millis(1);

const ERR_INVALID_ID: i32 = -2;
const ERR_INVALID_CONTROL: i32 = -3;
const ERR_CAMERA_CLOSED: i32 = -4;
const ERR_OUT_OF_BOUNDARY: i32 = -8;
const ERR_INVALID_SEQUENCE: i32 = -10;
const ERR_BUFFER_TOO_SMALL: i32 = -12;

/// Description of one simulated camera.
#[derive(Debug, Clone)]
pub struct SimulatedCameraSpec {
    pub name: String,
    pub serial_number: String,
    pub nickname: Option<String>,
    pub property: CameraProperty,
    pub property_ex: CameraPropertyExtended,
    pub controls: Vec<ControlCaps>,
    /// Ambient temperature in Celsius.
    pub ambient_c: f64,
}

fn caps(
    control: ControlType,
    name: &str,
    min: i64,
    max: i64,
    default: i64,
    is_auto_supported: bool,
    is_writable: bool,
) -> ControlCaps {
    ControlCaps {
        control,
        name: name.to_string(),
        description: format!("{name} control"),
        min,
        max,
        default,
        is_auto_supported,
        is_writable,
    }
}

impl SimulatedCameraSpec {
    /// Cooled colour camera with a guide port and flip support.
    pub fn cooled_color() -> Self {
        Self {
            name: "SVBONY SV605CC".to_string(),
            serial_number: "SIM0605CC0001".to_string(),
            nickname: None,
            property: CameraProperty {
                max_width: 640,
                max_height: 480,
                is_color: true,
                bayer_pattern: BayerPattern::Rg,
                supported_bins: vec![1, 2, 3, 4],
                supported_video_formats: vec![
                    VideoFormat::Raw8,
                    VideoFormat::Raw16,
                    VideoFormat::Y8,
                    VideoFormat::Y16,
                    VideoFormat::Rgb24,
                ],
                max_bit_depth: 14,
                is_trigger_camera: true,
                pixel_size_um: 3.76,
            },
            property_ex: CameraPropertyExtended {
                supports_pulse_guide: true,
                supports_control_temp: true,
                supports_mono_bin: true,
            },
            controls: vec![
                caps(ControlType::Gain, "Gain", 0, 600, 100, true, true),
                caps(ControlType::Exposure, "Exposure", 29, 2_000_000_000, 1_000_000, true, true),
                caps(ControlType::Gamma, "Gamma", 0, 1000, 100, false, true),
                caps(ControlType::WbR, "WB_R", 0, 511, 128, true, true),
                caps(ControlType::WbG, "WB_G", 0, 511, 128, true, true),
                caps(ControlType::WbB, "WB_B", 0, 511, 128, true, true),
                caps(ControlType::Flip, "Flip", 0, 3, 0, false, true),
                caps(ControlType::FrameSpeedMode, "FrameSpeed", 0, 2, 1, false, true),
                caps(ControlType::Contrast, "Contrast", 0, 100, 50, false, true),
                caps(ControlType::Sharpness, "Sharpness", 0, 100, 0, false, true),
                caps(ControlType::Saturation, "Saturation", 0, 255, 128, false, true),
                caps(ControlType::BlackLevel, "Offset", 0, 255, 10, false, true),
                caps(ControlType::CoolerEnable, "CoolerEnable", 0, 1, 0, false, true),
                caps(ControlType::TargetTemperature, "TargetTemp", -350, 300, 0, false, true),
                caps(ControlType::CurrentTemperature, "CurrentTemp", -500, 800, 200, false, false),
                caps(ControlType::CoolerPower, "CoolerPower", 0, 100, 0, false, false),
                caps(ControlType::BadPixelCorrection, "BadPixelCorrection", 0, 1, 1, false, true),
            ],
            ambient_c: 20.0,
        }
    }

    /// Uncooled mono guide camera without flip.
    pub fn mono_guider() -> Self {
        Self {
            name: "SVBONY SV305M".to_string(),
            serial_number: "SIM0305M00001".to_string(),
            nickname: Some("guider".to_string()),
            property: CameraProperty {
                max_width: 320,
                max_height: 240,
                is_color: false,
                bayer_pattern: BayerPattern::Rg,
                supported_bins: vec![1, 2],
                supported_video_formats: vec![VideoFormat::Y8, VideoFormat::Y12],
                max_bit_depth: 12,
                is_trigger_camera: true,
                pixel_size_um: 2.9,
            },
            property_ex: CameraPropertyExtended {
                supports_pulse_guide: true,
                supports_control_temp: false,
                supports_mono_bin: false,
            },
            controls: vec![
                caps(ControlType::Gain, "Gain", 0, 720, 10, false, true),
                caps(ControlType::Exposure, "Exposure", 100, 60_000_000, 500_000, false, true),
                caps(ControlType::BlackLevel, "Offset", 0, 255, 0, false, true),
            ],
            ambient_c: 20.0,
        }
    }

    fn find(&self, control: ControlType) -> Option<&ControlCaps> {
        self.controls.iter().find(|c| c.control == control)
    }
}

impl Default for SimulatedCameraSpec {
    fn default() -> Self {
        Self::cooled_color()
    }
}

/// One guide port transition recorded by the simulation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuideEvent {
    pub direction: GuideDirection,
    pub on: bool,
    pub at: Instant,
}

struct SimExposure {
    started: Instant,
    duration: Duration,
    stopped: bool,
}

#[derive(Default)]
struct Faults {
    readouts: u32,
    exposure_starts: u32,
    guide: bool,
    temperature: bool,
    property: bool,
}

struct SimCamera {
    spec: SimulatedCameraSpec,
    open: bool,
    values: HashMap<ControlType, (i64, bool)>,
    roi: RoiFormat,
    format: VideoFormat,
    soft_trigger: bool,
    exposure: Option<SimExposure>,
    video_last_frame: Option<Instant>,
    frame_counter: u64,
    temperature_c: f64,
    thermal_updated: Instant,
    faults: Faults,
    guide_events: Vec<GuideEvent>,
    exposure_starts: u32,
}

impl SimCamera {
    fn new(spec: SimulatedCameraSpec) -> Self {
        let values = spec
            .controls
            .iter()
            .map(|c| (c.control, (c.default, false)))
            .collect();
        let roi = RoiFormat {
            start_x: 0,
            start_y: 0,
            width: spec.property.max_width,
            height: spec.property.max_height,
            bin: 1,
        };
        let format = spec
            .property
            .supported_video_formats
            .first()
            .copied()
            .unwrap_or(VideoFormat::Raw8);
        let temperature_c = spec.ambient_c;
        Self {
            spec,
            open: false,
            values,
            roi,
            format,
            soft_trigger: false,
            exposure: None,
            video_last_frame: None,
            frame_counter: 0,
            temperature_c,
            thermal_updated: Instant::now(),
            faults: Faults::default(),
            guide_events: Vec::new(),
            exposure_starts: 0,
        }
    }

    fn ensure_open(&self) -> Result<(), SdkError> {
        if self.open {
            Ok(())
        } else {
            Err(SdkError::new(ERR_CAMERA_CLOSED, "camera closed"))
        }
    }

    fn value(&self, control: ControlType) -> i64 {
        self.values.get(&control).map(|(v, _)| *v).unwrap_or(0)
    }

    fn cooler_on(&self) -> bool {
        self.spec.property_ex.supports_control_temp && self.value(ControlType::CoolerEnable) != 0
    }

    fn target_c(&self) -> f64 {
        self.value(ControlType::TargetTemperature) as f64 / 10.0
    }

    /// Advance the thermal model to `now`.
    fn update_thermal(&mut self, now: Instant) {
        let dt = now.duration_since(self.thermal_updated).as_secs_f64();
        self.thermal_updated = now;

        let goal = if self.cooler_on() {
            self.target_c()
        } else {
            self.spec.ambient_c
        };
        let step = THERMAL_RATE_C_PER_SEC * dt;
        let diff = goal - self.temperature_c;
        self.temperature_c = if diff.abs() <= step {
            goal
        } else {
            self.temperature_c + step * diff.signum()
        };

        let power = if self.cooler_on() {
            let load = (self.spec.ambient_c - self.target_c()).max(0.0) * 1.5;
            let pull = (self.temperature_c - self.target_c()).max(0.0) * 8.0;
            (load + pull).clamp(0.0, 100.0).round() as i64
        } else {
            0
        };

        let temp_raw = (self.temperature_c * 10.0).round() as i64;
        self.values
            .insert(ControlType::CurrentTemperature, (temp_raw, false));
        self.values.insert(ControlType::CoolerPower, (power, false));
    }

    fn frame_len(&self) -> usize {
        self.roi.width as usize * self.roi.height as usize * self.format.bytes_per_pixel()
    }

    /// Fill `buf` with a moving gradient plus a little noise.
    fn fill_frame(&mut self, buf: &mut [u8]) -> Result<(), SdkError> {
        let len = self.frame_len();
        if buf.len() < len {
            return Err(SdkError::new(
                ERR_BUFFER_TOO_SMALL,
                format!("buffer {} bytes, frame needs {len}", buf.len()),
            ));
        }

        self.frame_counter += 1;
        let bpp = self.format.bytes_per_pixel();
        let width = self.roi.width as usize;
        let shift = 16u32.saturating_sub(self.format.bit_depth());
        let mut rng = rand::thread_rng();

        for (row_index, row) in buf[..len].chunks_mut(width * bpp).enumerate() {
            let noise: u64 = rng.gen_range(0..4);
            for (col, pixel) in row.chunks_mut(bpp).enumerate() {
                let level = (col as u64 + row_index as u64 + self.frame_counter + noise) % 256;
                match bpp {
                    2 => {
                        let value = ((level << 8) as u16) >> shift;
                        pixel.copy_from_slice(&value.to_le_bytes());
                    }
                    _ => pixel.fill(level as u8),
                }
            }
        }
        Ok(())
    }
}

/// In-process stand-in for the vendor SDK.
pub struct SimulatedSdk {
    version: String,
    cameras: Mutex<Vec<SimCamera>>,
}

impl SimulatedSdk {
    /// Simulation with one default (cooled colour) camera attached.
    pub fn new() -> Self {
        Self::with_cameras(vec![SimulatedCameraSpec::default()])
    }

    pub fn with_cameras(specs: Vec<SimulatedCameraSpec>) -> Self {
        Self {
            version: "1.12.6-sim".to_string(),
            cameras: Mutex::new(specs.into_iter().map(SimCamera::new).collect()),
        }
    }

    fn with_camera<T>(
        &self,
        id: CameraId,
        f: impl FnOnce(&mut SimCamera) -> Result<T, SdkError>,
    ) -> Result<T, SdkError> {
        let mut cameras = self.cameras.lock();
        let camera = usize::try_from(id.0)
            .ok()
            .and_then(|index| cameras.get_mut(index))
            .ok_or_else(|| SdkError::new(ERR_INVALID_ID, format!("invalid camera id {}", id.0)))?;
        f(camera)
    }

    fn first_camera<T>(&self, f: impl FnOnce(&mut SimCamera) -> T) -> Option<T> {
        self.cameras.lock().first_mut().map(f)
    }

    /// Fail the next `count` frame readouts (still or streamed).
    pub fn fail_next_readouts(&self, count: u32) {
        self.first_camera(|c| c.faults.readouts = count);
    }

    /// Fail the next `count` calls to start an exposure.
    pub fn fail_next_exposure_starts(&self, count: u32) {
        self.first_camera(|c| c.faults.exposure_starts = count);
    }

    /// Make every guide port command fail.
    pub fn fail_guide_commands(&self, fail: bool) {
        self.first_camera(|c| c.faults.guide = fail);
    }

    /// Make temperature reads fail.
    pub fn fail_temperature_reads(&self, fail: bool) {
        self.first_camera(|c| c.faults.temperature = fail);
    }

    /// Make camera property queries fail.
    pub fn fail_property_reads(&self, fail: bool) {
        self.first_camera(|c| c.faults.property = fail);
    }

    pub fn guide_events(&self) -> Vec<GuideEvent> {
        self.first_camera(|c| c.guide_events.clone())
            .unwrap_or_default()
    }

    /// Raw control value as stored in the simulated camera.
    pub fn raw_control(&self, control: ControlType) -> Option<i64> {
        self.first_camera(|c| c.values.get(&control).map(|(v, _)| *v))
            .flatten()
    }

    /// Overwrite a control value behind the driver's back.
    pub fn set_raw_control(&self, control: ControlType, value: i64) {
        self.first_camera(|c| c.values.insert(control, (value, false)));
    }

    pub fn frames_produced(&self) -> u64 {
        self.first_camera(|c| c.frame_counter).unwrap_or(0)
    }

    pub fn exposure_starts(&self) -> u32 {
        self.first_camera(|c| c.exposure_starts).unwrap_or(0)
    }

    pub fn active_format(&self) -> Option<VideoFormat> {
        self.first_camera(|c| c.format)
    }

    pub fn active_roi(&self) -> Option<RoiFormat> {
        self.first_camera(|c| c.roi)
    }

    pub fn is_open(&self) -> bool {
        self.first_camera(|c| c.open).unwrap_or(false)
    }
}

impl Default for SimulatedSdk {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraSdk for SimulatedSdk {
    fn sdk_version(&self) -> String {
        self.version.clone()
    }

    fn camera_count(&self) -> usize {
        self.cameras.lock().len()
    }

    fn camera_info(&self, index: usize) -> Result<CameraInfo, SdkError> {
        let cameras = self.cameras.lock();
        let camera = cameras
            .get(index)
            .ok_or_else(|| SdkError::new(ERR_INVALID_ID, format!("no camera at index {index}")))?;
        Ok(CameraInfo {
            name: camera.spec.name.clone(),
            id: CameraId(index as i32),
            unique_id: format!("sim-usb-{index}"),
            serial_number: camera.spec.serial_number.clone(),
            nickname: camera.spec.nickname.clone(),
        })
    }

    fn open(&self, id: CameraId) -> Result<(), SdkError> {
        self.with_camera(id, |c| {
            c.open = true;
            c.thermal_updated = Instant::now();
            info!(camera = %c.spec.name, "Simulated camera opened");
            Ok(())
        })
    }

    fn close(&self, id: CameraId) -> Result<(), SdkError> {
        self.with_camera(id, |c| {
            c.open = false;
            c.exposure = None;
            c.video_last_frame = None;
            info!(camera = %c.spec.name, "Simulated camera closed");
            Ok(())
        })
    }

    fn camera_property(&self, id: CameraId) -> Result<CameraProperty, SdkError> {
        self.with_camera(id, |c| {
            c.ensure_open()?;
            if c.faults.property {
                return Err(SdkError::new(SdkError::GENERAL, "property query failed"));
            }
            Ok(c.spec.property.clone())
        })
    }

    fn camera_property_ex(&self, id: CameraId) -> Result<CameraPropertyExtended, SdkError> {
        self.with_camera(id, |c| {
            c.ensure_open()?;
            Ok(c.spec.property_ex.clone())
        })
    }

    fn control_caps(&self, id: CameraId) -> Result<Vec<ControlCaps>, SdkError> {
        self.with_camera(id, |c| {
            c.ensure_open()?;
            Ok(c.spec.controls.clone())
        })
    }

    fn control_value(&self, id: CameraId, control: ControlType) -> Result<(i64, bool), SdkError> {
        self.with_camera(id, |c| {
            c.ensure_open()?;
            if matches!(
                control,
                ControlType::CurrentTemperature | ControlType::CoolerPower
            ) {
                if c.faults.temperature {
                    return Err(SdkError::new(SdkError::GENERAL, "temperature sensor fault"));
                }
                c.update_thermal(Instant::now());
            }
            c.values
                .get(&control)
                .copied()
                .ok_or_else(|| SdkError::new(ERR_INVALID_CONTROL, format!("{control:?} not supported")))
        })
    }

    fn set_control_value(
        &self,
        id: CameraId,
        control: ControlType,
        value: i64,
        auto: bool,
    ) -> Result<(), SdkError> {
        self.with_camera(id, |c| {
            c.ensure_open()?;
            let caps = c
                .spec
                .find(control)
                .ok_or_else(|| SdkError::new(ERR_INVALID_CONTROL, format!("{control:?} not supported")))?;
            if !caps.is_writable {
                return Err(SdkError::new(ERR_INVALID_CONTROL, format!("{control:?} is read-only")));
            }
            if !caps.contains(value) {
                return Err(SdkError::new(
                    ERR_OUT_OF_BOUNDARY,
                    format!("{control:?} value {value} out of boundary"),
                ));
            }
            // Settle the thermal model before the cooler state changes.
            c.update_thermal(Instant::now());
            c.values.insert(control, (value, auto));
            debug!(?control, value, auto, "Simulated control set");
            Ok(())
        })
    }

    fn set_roi_format(&self, id: CameraId, roi: RoiFormat) -> Result<(), SdkError> {
        self.with_camera(id, |c| {
            c.ensure_open()?;
            let property = &c.spec.property;
            let fits_x = roi.start_x + roi.width * roi.bin <= property.max_width;
            let fits_y = roi.start_y + roi.height * roi.bin <= property.max_height;
            if !property.supported_bins.contains(&roi.bin)
                || roi.width == 0
                || roi.height == 0
                || !fits_x
                || !fits_y
            {
                return Err(SdkError::new(ERR_OUT_OF_BOUNDARY, format!("invalid ROI {roi:?}")));
            }
            c.roi = roi;
            Ok(())
        })
    }

    fn set_video_format(&self, id: CameraId, format: VideoFormat) -> Result<(), SdkError> {
        self.with_camera(id, |c| {
            c.ensure_open()?;
            if !c.spec.property.supported_video_formats.contains(&format) {
                return Err(SdkError::new(
                    ERR_OUT_OF_BOUNDARY,
                    format!("{format:?} not supported"),
                ));
            }
            c.format = format;
            Ok(())
        })
    }

    fn set_soft_trigger_mode(&self, id: CameraId, enabled: bool) -> Result<(), SdkError> {
        self.with_camera(id, |c| {
            c.ensure_open()?;
            c.soft_trigger = enabled;
            Ok(())
        })
    }

    fn start_exposure(&self, id: CameraId, duration: Duration) -> Result<(), SdkError> {
        self.with_camera(id, |c| {
            c.ensure_open()?;
            if c.video_last_frame.is_some() {
                return Err(SdkError::new(ERR_INVALID_SEQUENCE, "video capture running"));
            }
            if c.faults.exposure_starts > 0 {
                c.faults.exposure_starts -= 1;
                return Err(SdkError::new(SdkError::GENERAL, "trigger rejected"));
            }
            c.exposure_starts += 1;
            c.exposure = Some(SimExposure {
                started: Instant::now(),
                duration,
                stopped: false,
            });
            Ok(())
        })
    }

    fn stop_exposure(&self, id: CameraId) -> Result<(), SdkError> {
        self.with_camera(id, |c| {
            if let Some(exposure) = c.exposure.as_mut() {
                exposure.stopped = true;
            }
            Ok(())
        })
    }

    fn exposure_status(&self, id: CameraId) -> Result<ExposureStatus, SdkError> {
        self.with_camera(id, |c| {
            c.ensure_open()?;
            Ok(match &c.exposure {
                None => ExposureStatus::Idle,
                Some(e) if e.stopped => ExposureStatus::Idle,
                Some(e) if e.started.elapsed() < e.duration => ExposureStatus::Working,
                Some(_) => ExposureStatus::Success,
            })
        })
    }

    fn read_frame(&self, id: CameraId, buf: &mut [u8]) -> Result<(), SdkError> {
        self.with_camera(id, |c| {
            c.ensure_open()?;
            let ready = matches!(
                &c.exposure,
                Some(e) if !e.stopped && e.started.elapsed() >= e.duration
            );
            if !ready {
                return Err(SdkError::new(ERR_INVALID_SEQUENCE, "no completed exposure"));
            }
            c.exposure = None;
            if c.faults.readouts > 0 {
                c.faults.readouts -= 1;
                return Err(SdkError::new(SdkError::TIMEOUT, "readout timed out"));
            }
            c.fill_frame(buf)
        })
    }

    fn start_video_capture(&self, id: CameraId) -> Result<(), SdkError> {
        self.with_camera(id, |c| {
            c.ensure_open()?;
            c.video_last_frame = Some(Instant::now());
            Ok(())
        })
    }

    fn stop_video_capture(&self, id: CameraId) -> Result<(), SdkError> {
        self.with_camera(id, |c| {
            c.video_last_frame = None;
            Ok(())
        })
    }

    fn read_video_frame(&self, id: CameraId, buf: &mut [u8]) -> Result<bool, SdkError> {
        self.with_camera(id, |c| {
            c.ensure_open()?;
            let last = c
                .video_last_frame
                .ok_or_else(|| SdkError::new(ERR_INVALID_SEQUENCE, "video capture not running"))?;
            let interval = Duration::from_micros(c.value(ControlType::Exposure).max(0) as u64)
                .max(MIN_FRAME_INTERVAL);
            if last.elapsed() < interval {
                return Ok(false);
            }
            c.video_last_frame = Some(Instant::now());
            if c.faults.readouts > 0 {
                c.faults.readouts -= 1;
                return Err(SdkError::new(SdkError::TIMEOUT, "video frame timed out"));
            }
            c.fill_frame(buf)?;
            Ok(true)
        })
    }

    fn pulse_guide_on(&self, id: CameraId, direction: GuideDirection) -> Result<(), SdkError> {
        self.with_camera(id, |c| {
            c.ensure_open()?;
            if c.faults.guide {
                return Err(SdkError::new(SdkError::GENERAL, "guide port fault"));
            }
            c.guide_events.push(GuideEvent {
                direction,
                on: true,
                at: Instant::now(),
            });
            Ok(())
        })
    }

    fn pulse_guide_off(&self, id: CameraId, direction: GuideDirection) -> Result<(), SdkError> {
        self.with_camera(id, |c| {
            c.ensure_open()?;
            if c.faults.guide {
                return Err(SdkError::new(SdkError::GENERAL, "guide port fault"));
            }
            c.guide_events.push(GuideEvent {
                direction,
                on: false,
                at: Instant::now(),
            });
            Ok(())
        })
    }
}
