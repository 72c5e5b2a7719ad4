//! SVBONY SDK capability boundary.
//!
//! The driver talks to the camera only through [`CameraSdk`]. The trait mirrors
//! the vendor C API: every call takes the camera id, returns immediately (or
//! after a bounded hardware wait) and reports failures as an [`SdkError`].
//! The real vendor library is one implementation; [`simulated::SimulatedSdk`]
//! is another, used for tests and the `svbony_sim` binary.
//!
//! Calls are synchronous. The driver serializes them through the device handle
//! and keeps long waits (integration, readout) on the acquisition worker.

pub mod simulated;

use ccd_core::frame::{BayerPattern, PixelEncoding};
use ccd_core::SdkError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Camera id assigned by the SDK at enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CameraId(pub i32);

/// Identity of an attached camera. Fixed once connected.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraInfo {
    pub name: String,
    pub id: CameraId,
    /// Vendor port/unique id string.
    pub unique_id: String,
    pub serial_number: String,
    /// User-assigned nickname, if the camera stores one.
    pub nickname: Option<String>,
}

/// Sensor capabilities reported at connect time.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraProperty {
    pub max_width: u32,
    pub max_height: u32,
    pub is_color: bool,
    pub bayer_pattern: BayerPattern,
    /// Supported symmetric binning factors, ascending.
    pub supported_bins: Vec<u32>,
    /// Video formats in the order the SDK advertises them.
    pub supported_video_formats: Vec<VideoFormat>,
    pub max_bit_depth: u32,
    pub is_trigger_camera: bool,
    /// Pixel pitch in micrometres.
    pub pixel_size_um: f64,
}

/// Extended capabilities reported at connect time.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraPropertyExtended {
    pub supports_pulse_guide: bool,
    pub supports_control_temp: bool,
    /// Binned colour frames are summed to mono on the sensor.
    pub supports_mono_bin: bool,
}

/// Hardware controls the SDK can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlType {
    Gain,
    Exposure,
    Gamma,
    GammaContrast,
    WbR,
    WbG,
    WbB,
    Flip,
    FrameSpeedMode,
    Contrast,
    Sharpness,
    Saturation,
    AutoTargetBrightness,
    BlackLevel,
    CoolerEnable,
    TargetTemperature,
    CurrentTemperature,
    CoolerPower,
    BadPixelCorrection,
}

/// Bits of the `Flip` control value.
pub const FLIP_HORIZONTAL: i64 = 0b01;
pub const FLIP_VERTICAL: i64 = 0b10;

/// One advertised control with its range.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlCaps {
    pub control: ControlType,
    pub name: String,
    pub description: String,
    pub min: i64,
    pub max: i64,
    pub default: i64,
    pub is_auto_supported: bool,
    pub is_writable: bool,
}

impl ControlCaps {
    pub fn contains(&self, value: i64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

/// Pixel/image encodings the camera can output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoFormat {
    Raw8,
    Raw10,
    Raw12,
    Raw14,
    Raw16,
    Y8,
    Y10,
    Y12,
    Y14,
    Y16,
    Rgb24,
    Rgb32,
}

impl VideoFormat {
    /// Name shown to the client.
    pub fn label(&self) -> &'static str {
        match self {
            VideoFormat::Raw8 => "RAW 8",
            VideoFormat::Raw10 => "RAW 10",
            VideoFormat::Raw12 => "RAW 12",
            VideoFormat::Raw14 => "RAW 14",
            VideoFormat::Raw16 => "RAW 16",
            VideoFormat::Y8 => "Y 8",
            VideoFormat::Y10 => "Y 10",
            VideoFormat::Y12 => "Y 12",
            VideoFormat::Y14 => "Y 14",
            VideoFormat::Y16 => "Y 16",
            VideoFormat::Rgb24 => "RGB 24",
            VideoFormat::Rgb32 => "RGB 32",
        }
    }

    /// Significant bits per channel.
    pub fn bit_depth(&self) -> u32 {
        match self {
            VideoFormat::Raw8 | VideoFormat::Y8 | VideoFormat::Rgb24 | VideoFormat::Rgb32 => 8,
            VideoFormat::Raw10 | VideoFormat::Y10 => 10,
            VideoFormat::Raw12 | VideoFormat::Y12 => 12,
            VideoFormat::Raw14 | VideoFormat::Y14 => 14,
            VideoFormat::Raw16 | VideoFormat::Y16 => 16,
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            VideoFormat::Raw8 | VideoFormat::Y8 => 1,
            VideoFormat::Rgb24 => 3,
            VideoFormat::Rgb32 => 4,
            _ => 2,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(
            self,
            VideoFormat::Raw8
                | VideoFormat::Raw10
                | VideoFormat::Raw12
                | VideoFormat::Raw14
                | VideoFormat::Raw16
        )
    }

    pub fn is_rgb(&self) -> bool {
        matches!(self, VideoFormat::Rgb24 | VideoFormat::Rgb32)
    }

    /// Encoding of frames produced in this format. The Bayer tag is dropped
    /// when the sensor is mono or mono-bin has merged the colour channels.
    pub fn encoding(&self, bayer: Option<BayerPattern>) -> PixelEncoding {
        if self.is_rgb() {
            return PixelEncoding::Rgb;
        }
        match (self.is_raw(), bayer) {
            (true, Some(pattern)) => PixelEncoding::Bayer(pattern),
            _ => PixelEncoding::Mono,
        }
    }
}

/// Region of interest in the SDK's terms: origin in unbinned pixels, size in
/// binned pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoiFormat {
    pub start_x: u32,
    pub start_y: u32,
    pub width: u32,
    pub height: u32,
    pub bin: u32,
}

/// State of a still exposure as reported by the SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureStatus {
    Idle,
    Working,
    Success,
    Failed,
}

/// Guide port directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuideDirection {
    North,
    South,
    East,
    West,
}

impl GuideDirection {
    pub fn axis(&self) -> GuideAxis {
        match self {
            GuideDirection::North | GuideDirection::South => GuideAxis::NorthSouth,
            GuideDirection::East | GuideDirection::West => GuideAxis::EastWest,
        }
    }
}

/// Independent guide axes. Each carries at most one active pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuideAxis {
    NorthSouth,
    EastWest,
}

/// Vendor SDK operations used by the driver.
pub trait CameraSdk: Send + Sync {
    fn sdk_version(&self) -> String;

    /// Number of cameras currently attached.
    fn camera_count(&self) -> usize;

    fn camera_info(&self, index: usize) -> Result<CameraInfo, SdkError>;

    fn open(&self, id: CameraId) -> Result<(), SdkError>;

    fn close(&self, id: CameraId) -> Result<(), SdkError>;

    fn camera_property(&self, id: CameraId) -> Result<CameraProperty, SdkError>;

    fn camera_property_ex(&self, id: CameraId) -> Result<CameraPropertyExtended, SdkError>;

    fn control_caps(&self, id: CameraId) -> Result<Vec<ControlCaps>, SdkError>;

    /// Current value and auto flag of a control.
    fn control_value(&self, id: CameraId, control: ControlType) -> Result<(i64, bool), SdkError>;

    fn set_control_value(
        &self,
        id: CameraId,
        control: ControlType,
        value: i64,
        auto: bool,
    ) -> Result<(), SdkError>;

    fn set_roi_format(&self, id: CameraId, roi: RoiFormat) -> Result<(), SdkError>;

    fn set_video_format(&self, id: CameraId, format: VideoFormat) -> Result<(), SdkError>;

    /// Switch between free-running video and software-triggered stills.
    fn set_soft_trigger_mode(&self, id: CameraId, enabled: bool) -> Result<(), SdkError>;

    /// Begin integrating a still frame.
    fn start_exposure(&self, id: CameraId, duration: Duration) -> Result<(), SdkError>;

    fn stop_exposure(&self, id: CameraId) -> Result<(), SdkError>;

    fn exposure_status(&self, id: CameraId) -> Result<ExposureStatus, SdkError>;

    /// Read out the completed still frame into `buf`.
    fn read_frame(&self, id: CameraId, buf: &mut [u8]) -> Result<(), SdkError>;

    fn start_video_capture(&self, id: CameraId) -> Result<(), SdkError>;

    fn stop_video_capture(&self, id: CameraId) -> Result<(), SdkError>;

    /// Copy the next streamed frame into `buf`. Returns `Ok(false)` when no
    /// new frame is ready yet.
    fn read_video_frame(&self, id: CameraId, buf: &mut [u8]) -> Result<bool, SdkError>;

    fn pulse_guide_on(&self, id: CameraId, direction: GuideDirection) -> Result<(), SdkError>;

    fn pulse_guide_off(&self, id: CameraId, direction: GuideDirection) -> Result<(), SdkError>;
}
