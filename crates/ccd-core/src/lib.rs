//! Core types shared by the SVBONY camera driver.
//!
//! - [`error`]: the driver error taxonomy
//! - [`observable`]: watch-backed property values mirrored to clients
//! - [`limits`]: frame geometry limits
//! - [`frame`]: the immutable record of a captured frame

pub mod error;
pub mod frame;
pub mod limits;
pub mod observable;

pub use error::{CameraError, CameraResult, SdkError};
pub use frame::{BayerPattern, CapturedFrame, PixelEncoding};
pub use observable::{Observable, PropertyBase, PropertyMetadata, PropertySet};
