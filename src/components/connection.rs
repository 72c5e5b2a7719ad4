//! SVBONY Connection Management
//!
//! Owns the open SDK session for one camera together with its immutable
//! capability description. Every other component reaches the hardware through
//! [`DeviceHandle::call`], which serializes commands: the camera accepts one
//! command at a time.

use crate::sdk::{
    CameraId, CameraInfo, CameraProperty, CameraPropertyExtended, CameraSdk, ControlCaps,
    ControlType,
};
use ccd_core::{CameraError, CameraResult, SdkError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// How to pick a camera among the attached ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraSelector {
    /// First camera the SDK enumerates.
    First,
    /// Enumeration index.
    Index(usize),
    /// Exact camera name; falls back to the first camera when not found.
    Name(String),
}

/// Open connection to one physical camera.
pub struct DeviceHandle {
    sdk: Arc<dyn CameraSdk>,
    info: CameraInfo,
    property: CameraProperty,
    property_ex: CameraPropertyExtended,
    sdk_version: String,
    command_lock: Mutex<()>,
    open: AtomicBool,
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("info", &self.info)
            .field("open", &self.is_open())
            .finish()
    }
}

impl DeviceHandle {
    /// Enumerate attached cameras, open the selected one and read its
    /// capabilities.
    pub fn open(sdk: Arc<dyn CameraSdk>, selector: &CameraSelector) -> CameraResult<Self> {
        let total = sdk.camera_count();
        if total == 0 {
            return Err(CameraError::Device(SdkError::new(
                SdkError::GENERAL,
                "no SVBONY cameras detected",
            )));
        }

        let index = match selector {
            CameraSelector::First => 0,
            CameraSelector::Index(index) => *index,
            CameraSelector::Name(name) => {
                let found = (0..total).find(|&i| {
                    sdk.camera_info(i)
                        .map(|info| &info.name == name)
                        .unwrap_or(false)
                });
                found.unwrap_or_else(|| {
                    warn!(camera = %name, "Camera not found, using first available");
                    0
                })
            }
        };

        let info = sdk.camera_info(index)?;
        sdk.open(info.id)?;

        let described = (|| -> Result<_, SdkError> {
            Ok((
                sdk.camera_property(info.id)?,
                sdk.camera_property_ex(info.id)?,
            ))
        })();
        let (property, property_ex) = match described {
            Ok(described) => described,
            Err(e) => {
                if let Err(close) = sdk.close(info.id) {
                    warn!(camera = %info.name, error = %close, "Failed to close camera after open error");
                }
                return Err(e.into());
            }
        };

        let sdk_version = sdk.sdk_version();
        info!(
            camera = %info.name,
            serial = %info.serial_number,
            width = property.max_width,
            height = property.max_height,
            sdk_version = %sdk_version,
            "Camera opened"
        );

        Ok(Self {
            sdk,
            info,
            property,
            property_ex,
            sdk_version,
            command_lock: Mutex::new(()),
            open: AtomicBool::new(true),
        })
    }

    /// Issue one serialized SDK command.
    pub fn call<T>(
        &self,
        f: impl FnOnce(&dyn CameraSdk, CameraId) -> Result<T, SdkError>,
    ) -> CameraResult<T> {
        let _guard = self.command_lock.lock();
        if !self.is_open() {
            return Err(CameraError::NotConnected);
        }
        f(self.sdk.as_ref(), self.info.id).map_err(CameraError::from)
    }

    /// Close the session. Further commands fail with `NotConnected`.
    pub fn close(&self) -> CameraResult<()> {
        let _guard = self.command_lock.lock();
        if self.open.swap(false, Ordering::SeqCst) {
            self.sdk.close(self.info.id)?;
            info!(camera = %self.info.name, "Camera closed");
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> &CameraInfo {
        &self.info
    }

    pub fn property(&self) -> &CameraProperty {
        &self.property
    }

    pub fn property_ex(&self) -> &CameraPropertyExtended {
        &self.property_ex
    }

    pub fn sdk_version(&self) -> &str {
        &self.sdk_version
    }

    /// Nickname, falling back to the camera name.
    pub fn nickname(&self) -> &str {
        self.info
            .nickname
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.info.name)
    }

    pub fn has_guider(&self) -> bool {
        self.property_ex.supports_pulse_guide
    }

    pub fn has_cooler(&self) -> bool {
        self.property_ex.supports_control_temp
    }

    /// Read the advertised controls, in device order.
    pub fn control_caps(&self) -> CameraResult<Vec<ControlCaps>> {
        self.call(|sdk, id| sdk.control_caps(id))
    }

    pub fn control_value(&self, control: ControlType) -> CameraResult<(i64, bool)> {
        self.call(|sdk, id| sdk.control_value(id, control))
    }

    pub fn set_control_value(&self, control: ControlType, value: i64, auto: bool) -> CameraResult<()> {
        self.call(|sdk, id| sdk.set_control_value(id, control, value, auto))
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(camera = %self.info.name, error = %e, "Failed to close camera on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::simulated::{SimulatedCameraSpec, SimulatedSdk};

    fn two_cameras() -> Arc<SimulatedSdk> {
        Arc::new(SimulatedSdk::with_cameras(vec![
            SimulatedCameraSpec::cooled_color(),
            SimulatedCameraSpec::mono_guider(),
        ]))
    }

    #[test]
    fn test_open_by_name() {
        let sdk = two_cameras();
        let handle = DeviceHandle::open(sdk, &CameraSelector::Name("SVBONY SV305M".into())).unwrap();
        assert_eq!(handle.info().id, CameraId(1));
        assert_eq!(handle.nickname(), "guider");
        assert!(!handle.has_cooler());
    }

    #[test]
    fn test_unknown_name_falls_back_to_first() {
        let sdk = two_cameras();
        let handle = DeviceHandle::open(sdk, &CameraSelector::Name("nope".into())).unwrap();
        assert_eq!(handle.info().id, CameraId(0));
        assert_eq!(handle.nickname(), "SVBONY SV605CC");
    }

    #[test]
    fn test_no_cameras() {
        let sdk = Arc::new(SimulatedSdk::with_cameras(Vec::new()));
        let err = DeviceHandle::open(sdk, &CameraSelector::First).unwrap_err();
        assert!(err.is_device_error());
    }

    #[test]
    fn test_failed_describe_closes_session() {
        let sdk = Arc::new(SimulatedSdk::new());
        sdk.fail_property_reads(true);
        let err = DeviceHandle::open(sdk.clone(), &CameraSelector::First).unwrap_err();
        assert!(err.is_device_error());
        assert!(!sdk.is_open());

        sdk.fail_property_reads(false);
        assert!(DeviceHandle::open(sdk, &CameraSelector::First).is_ok());
    }

    #[test]
    fn test_commands_after_close_fail() {
        let sdk = Arc::new(SimulatedSdk::new());
        let handle = DeviceHandle::open(sdk.clone(), &CameraSelector::First).unwrap();
        assert!(sdk.is_open());

        handle.close().unwrap();
        assert!(!sdk.is_open());
        assert_eq!(
            handle.control_value(ControlType::Gain).unwrap_err(),
            CameraError::NotConnected
        );
        // Closing twice is harmless
        handle.close().unwrap();
    }
}
