//! SVBONY Control Synchronization
//!
//! Mirrors the hardware controls into the client-facing property catalog and
//! pushes client edits back to the camera.
//!
//! # Catalog
//!
//! [`ControlSynchronizer::create_controls`] builds one [`ControlEntry`] per
//! advertised [`ControlCaps`], in the order the camera reported them. Calling
//! it again rebuilds the catalog rather than appending to it.
//!
//! # Writes
//!
//! Out-of-range writes are rejected with `InvalidArgument` and never clamped;
//! the camera keeps its previous value. A manual write turns the control's
//! auto mode off, as the SDK does.

use crate::components::acquisition::Acquisition;
use crate::components::connection::DeviceHandle;
use crate::sdk::{ControlCaps, ControlType, VideoFormat, FLIP_HORIZONTAL, FLIP_VERTICAL};
use ccd_core::frame::PixelEncoding;
use ccd_core::{CameraError, CameraResult, Observable, PropertySet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

const CONTROLS_GROUP: &str = "Controls";
const INFO_GROUP: &str = "General Info";

/// One generated control, backed by a single advertised capability.
#[derive(Debug, Clone)]
pub struct ControlEntry {
    pub caps: ControlCaps,
    pub value: Observable<f64>,
    /// Present only for auto-capable controls.
    pub auto: Option<Observable<bool>>,
}

/// Which image axis a flip switch mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipAxis {
    Horizontal,
    Vertical,
}

impl FlipAxis {
    fn mask(&self) -> i64 {
        match self {
            FlipAxis::Horizontal => FLIP_HORIZONTAL,
            FlipAxis::Vertical => FLIP_VERTICAL,
        }
    }
}

/// Pixel format handed to an attached raw-video recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderFormat {
    pub format: VideoFormat,
    pub encoding: PixelEncoding,
    pub bit_depth: u32,
}

/// Read-only identity properties.
#[derive(Debug, Clone)]
pub struct IdentityProperties {
    pub serial_number: Observable<String>,
    pub nickname: Observable<String>,
    pub sdk_version: Observable<String>,
    pub adc_depth: Observable<f64>,
}

struct Catalog {
    entries: Vec<ControlEntry>,
    properties: PropertySet,
}

/// Keeps the property model and the camera's control values in step.
pub struct ControlSynchronizer {
    device: Arc<DeviceHandle>,
    acquisition: Arc<Acquisition>,
    catalog: RwLock<Catalog>,
    flip_horizontal: Observable<bool>,
    flip_vertical: Observable<bool>,
    video_format: Observable<VideoFormat>,
    recorder_format: Observable<RecorderFormat>,
    identity: IdentityProperties,
}

impl ControlSynchronizer {
    pub fn new(device: Arc<DeviceHandle>, acquisition: Arc<Acquisition>) -> Self {
        let layout = acquisition.layout();
        let recorder = RecorderFormat {
            format: layout.format,
            encoding: layout.encoding(device.property(), device.property_ex()),
            bit_depth: layout.format.bit_depth(),
        };
        let identity = IdentityProperties {
            serial_number: Observable::new("Serial Number", device.info().serial_number.clone())
                .with_group(INFO_GROUP)
                .read_only(),
            nickname: Observable::new("Nickname", device.nickname().to_string())
                .with_group(INFO_GROUP)
                .read_only(),
            sdk_version: Observable::new("SDK Version", device.sdk_version().to_string())
                .with_group(INFO_GROUP)
                .read_only(),
            adc_depth: Observable::new("ADC Depth", device.property().max_bit_depth as f64)
                .with_label("ADC Depth (bits)")
                .with_group(INFO_GROUP)
                .read_only(),
        };

        Self {
            device,
            acquisition,
            catalog: RwLock::new(Catalog {
                entries: Vec::new(),
                properties: PropertySet::new(),
            }),
            flip_horizontal: Observable::new("Flip Horizontal", false).with_group(CONTROLS_GROUP),
            flip_vertical: Observable::new("Flip Vertical", false).with_group(CONTROLS_GROUP),
            video_format: Observable::new("Video Format", layout.format).with_group(CONTROLS_GROUP),
            recorder_format: Observable::new("Recorder Format", recorder).read_only(),
            identity,
        }
    }

    /// Build the catalog from the first `count` advertised controls.
    pub fn create_controls(&self, count: usize) -> CameraResult<()> {
        let advertised = self.device.control_caps()?;
        if count > advertised.len() {
            return Err(CameraError::InvalidArgument(format!(
                "camera advertises {} controls, {count} requested",
                advertised.len()
            )));
        }

        let entries: Vec<ControlEntry> = advertised
            .into_iter()
            .take(count)
            .map(|caps| {
                let mut value = Observable::new(caps.name.clone(), caps.default as f64)
                    .with_label(caps.description.clone())
                    .with_group(CONTROLS_GROUP)
                    .with_range(caps.min as f64, caps.max as f64);
                if !caps.is_writable {
                    value = value.read_only();
                }
                let auto = caps.is_auto_supported.then(|| {
                    Observable::new(format!("{} Auto", caps.name), false).with_group(CONTROLS_GROUP)
                });
                ControlEntry { caps, value, auto }
            })
            .collect();

        let mut properties = PropertySet::new();
        for entry in &entries {
            properties.register(entry.value.clone());
            if let Some(auto) = &entry.auto {
                properties.register(auto.clone());
            }
        }
        if self.has_flip_control_in(&entries) {
            properties.register(self.flip_horizontal.clone());
            properties.register(self.flip_vertical.clone());
        }
        properties.register(self.video_format.clone());
        properties.register(self.identity.serial_number.clone());
        properties.register(self.identity.nickname.clone());
        properties.register(self.identity.sdk_version.clone());
        properties.register(self.identity.adc_depth.clone());

        info!(controls = entries.len(), "Control catalog built");
        *self.catalog.write() = Catalog {
            entries,
            properties,
        };
        Ok(())
    }

    /// Re-read every advertised control from the camera.
    pub fn update_controls(&self) -> CameraResult<()> {
        let catalog = self.catalog.read();
        for entry in &catalog.entries {
            let (value, auto) = self.device.control_value(entry.caps.control)?;
            entry.value.publish(value as f64);
            if let Some(auto_switch) = &entry.auto {
                auto_switch.publish(auto);
            }
            if entry.caps.control == ControlType::Flip {
                self.publish_flip(value);
            }
        }
        self.publish_format();
        Ok(())
    }

    fn has_flip_control_in(&self, entries: &[ControlEntry]) -> bool {
        entries.iter().any(|e| e.caps.control == ControlType::Flip)
    }

    /// Whether the camera can mirror the image.
    pub fn has_flip_control(&self) -> bool {
        self.has_flip_control_in(&self.catalog.read().entries)
    }

    fn entry(&self, control: ControlType) -> CameraResult<ControlEntry> {
        self.catalog
            .read()
            .entries
            .iter()
            .find(|e| e.caps.control == control)
            .cloned()
            .ok_or_else(|| CameraError::Unsupported(format!("{control:?} control")))
    }

    /// Write a control value. Rejects values outside the advertised range.
    pub fn set_control(&self, control: ControlType, value: f64) -> CameraResult<()> {
        let entry = self.entry(control)?;
        entry.value.validate(&value)?;

        let raw = value.round() as i64;
        self.device.set_control_value(control, raw, false)?;
        entry.value.publish(raw as f64);
        if let Some(auto) = &entry.auto {
            auto.publish(false);
        }
        if control == ControlType::Flip {
            self.publish_flip(raw);
        }
        debug!(control = %entry.caps.name, value = raw, "Control set");
        Ok(())
    }

    /// Enable or disable automatic regulation of a control.
    pub fn set_auto(&self, control: ControlType, enabled: bool) -> CameraResult<()> {
        let entry = self.entry(control)?;
        let auto = entry
            .auto
            .as_ref()
            .ok_or_else(|| CameraError::Unsupported(format!("auto mode for {}", entry.caps.name)))?;

        let (current, _) = self.device.control_value(control)?;
        self.device.set_control_value(control, current, enabled)?;
        auto.publish(enabled);
        debug!(control = %entry.caps.name, enabled, "Control auto mode set");
        Ok(())
    }

    /// Current value of a control as mirrored in the catalog.
    pub fn control(&self, control: ControlType) -> CameraResult<f64> {
        Ok(self.entry(control)?.value.get())
    }

    /// Toggle one flip switch, keeping the other axis as it is.
    pub fn set_flip(&self, axis: FlipAxis, enabled: bool) -> CameraResult<()> {
        let entry = self
            .entry(ControlType::Flip)
            .map_err(|_| CameraError::Unsupported("image flip".into()))?;

        let (current, _) = self.device.control_value(ControlType::Flip)?;
        let next = if enabled {
            current | axis.mask()
        } else {
            current & !axis.mask()
        };
        self.device.set_control_value(ControlType::Flip, next, false)?;
        entry.value.publish(next as f64);
        self.publish_flip(next);
        info!(?axis, enabled, "Flip updated");
        Ok(())
    }

    pub fn flip(&self, axis: FlipAxis) -> bool {
        match axis {
            FlipAxis::Horizontal => self.flip_horizontal.get(),
            FlipAxis::Vertical => self.flip_vertical.get(),
        }
    }

    fn publish_flip(&self, value: i64) {
        self.flip_horizontal
            .publish(value & FLIP_HORIZONTAL != 0);
        self.flip_vertical.publish(value & FLIP_VERTICAL != 0);
    }

    /// Video formats in advertised order.
    pub fn video_formats(&self) -> &[VideoFormat] {
        &self.device.property().supported_video_formats
    }

    /// Select a video format by advertised index. Only legal while idle.
    pub fn set_video_format(&self, index: usize) -> CameraResult<VideoFormat> {
        let format = *self.video_formats().get(index).ok_or_else(|| {
            CameraError::InvalidArgument(format!("video format index {index} not advertised"))
        })?;

        self.acquisition
            .while_idle("change video format", |layout| {
                let mut candidate = *layout;
                candidate.format = format;
                candidate.frame_size()?;
                self.device.call(|sdk, id| sdk.set_video_format(id, format))?;
                *layout = candidate;
                Ok(())
            })?;

        self.publish_format();
        info!(format = format.label(), "Video format changed");
        Ok(format)
    }

    pub fn video_format(&self) -> VideoFormat {
        self.video_format.get()
    }

    /// Reflect the active layout into the format and recorder properties.
    pub fn publish_format(&self) {
        let layout = self.acquisition.layout();
        self.video_format.publish(layout.format);
        let recorder = RecorderFormat {
            format: layout.format,
            encoding: layout.encoding(self.device.property(), self.device.property_ex()),
            bit_depth: layout.format.bit_depth(),
        };
        if self.recorder_format.publish_if_changed(recorder) {
            debug!(?recorder, "Recorder format updated");
        }
    }

    pub fn recorder_format(&self) -> RecorderFormat {
        self.recorder_format.get()
    }

    pub fn identity(&self) -> &IdentityProperties {
        &self.identity
    }

    /// Number of generated control entries.
    pub fn control_count(&self) -> usize {
        self.catalog.read().entries.len()
    }

    pub fn entries(&self) -> Vec<ControlEntry> {
        self.catalog.read().entries.clone()
    }

    /// Names of every property in the catalog, in definition order.
    pub fn property_names(&self) -> Vec<String> {
        self.catalog
            .read()
            .properties
            .names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// JSON snapshot of the whole catalog.
    pub fn snapshot(&self) -> CameraResult<Vec<(String, serde_json::Value)>> {
        self.catalog.read().properties.snapshot()
    }

    /// Apply a value restored from persisted settings, logging instead of
    /// failing when the camera cannot honour it.
    pub fn restore_flip(&self, axis: FlipAxis, enabled: bool) {
        if !self.has_flip_control() {
            if enabled {
                warn!(?axis, "Saved flip setting ignored, camera cannot flip");
            }
            return;
        }
        if let Err(e) = self.set_flip(axis, enabled) {
            warn!(?axis, error = %e, "Failed to restore flip setting");
        }
    }
}
