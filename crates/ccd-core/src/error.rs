//! Error taxonomy shared by every driver component.
//!
//! `CameraError` is the single error type returned by driver operations. The
//! variants map one-to-one onto the ways a request can be refused:
//!
//! - **`InvalidState`**: the operation is not legal in the current acquisition
//!   state (starting an exposure while streaming, resizing mid-capture).
//! - **`InvalidArgument`**: a value outside the advertised control range or an
//!   unknown format index.
//! - **`Device`**: the vendor SDK rejected a call. Wraps the raw [`SdkError`].
//! - **`CaptureFailed`**: readout kept failing until the retry budget ran out.
//! - **`Unsupported`**: the capability is absent on this device (no guide port,
//!   no flip, no cooler).
//!
//! `InvalidState` and `InvalidArgument` are always raised synchronously and are
//! never retried. A rejected operation leaves the device state untouched.

use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type CameraResult<T> = std::result::Result<T, CameraError>;

/// Error code reported by the vendor SDK.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("SDK error {code}: {message}")]
pub struct SdkError {
    /// Raw vendor error code.
    pub code: i32,
    /// Human-readable description of the code.
    pub message: String,
}

impl SdkError {
    /// Vendor code for "timed out waiting for data".
    pub const TIMEOUT: i32 = -11;
    /// Vendor code for "general error".
    pub const GENERAL: i32 = -13;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CameraError {
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Device error: {0}")]
    Device(#[from] SdkError),

    #[error("Capture failed after {attempts} attempts: {last_error}")]
    CaptureFailed { attempts: u32, last_error: String },

    #[error("Not supported by this camera: {0}")]
    Unsupported(String),

    #[error("Camera is not connected")]
    NotConnected,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Frame too large: {bytes} bytes exceeds maximum {max_bytes}")]
    FrameTooLarge { bytes: usize, max_bytes: usize },

    #[error("Frame dimensions {width}x{height} exceed maximum {max_dimension}")]
    FrameDimensionsTooLarge {
        width: u32,
        height: u32,
        max_dimension: u32,
    },

    #[error("Size overflow computing {context}")]
    SizeOverflow { context: &'static str },
}

impl CameraError {
    /// Whether the failure came from the hardware rather than from the caller.
    pub fn is_device_error(&self) -> bool {
        matches!(self, CameraError::Device(_) | CameraError::CaptureFailed { .. })
    }
}
