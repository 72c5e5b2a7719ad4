//! Control core of the SVBONY astronomical camera driver.
//!
//! The driver sequences calls into the vendor SDK for one camera: still
//! exposures and live streaming on a worker task, timed guide pulses, cooler
//! regulation and the mirror of hardware controls into a property model.
//!
//! - [`sdk`]: the vendor SDK boundary and a simulated camera
//! - [`components`]: one module per concern (connection, capture, controls,
//!   guiding, cooling, frame dispatch, persisted settings)
//! - [`camera`]: [`camera::SvbonyCamera`], which wires the components to a
//!   single device
//! - [`config`]: figment-backed driver configuration
//!
//! Shared types (errors, observable properties, frame records) live in the
//! `ccd-core` crate and are re-exported here.

pub mod camera;
pub mod components;
pub mod config;
pub mod sdk;

pub use camera::{SvbonyCamera, DEFAULT_NAME};
pub use ccd_core::{CameraError, CameraResult, CapturedFrame, SdkError};
pub use components::dispatch::{ChannelSink, FrameEvent, FrameSink};
pub use config::DriverConfig;
