//! Hard limits on frame geometry to prevent unbounded buffer allocations.

use crate::error::CameraError;

/// Maximum allowed frame payload in bytes (default: 256MB).
pub const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;
/// Maximum supported width/height for frames.
pub const MAX_FRAME_DIMENSION: u32 = 65_536;

/// Validated frame sizing information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    pub pixels: usize,
    pub bytes: usize,
}

/// Validate binned frame dimensions and compute the readout buffer size.
pub fn validate_frame_size(
    width: u32,
    height: u32,
    bytes_per_pixel: usize,
) -> Result<FrameSize, CameraError> {
    if width > MAX_FRAME_DIMENSION || height > MAX_FRAME_DIMENSION {
        return Err(CameraError::FrameDimensionsTooLarge {
            width,
            height,
            max_dimension: MAX_FRAME_DIMENSION,
        });
    }

    let pixels = (width as usize)
        .checked_mul(height as usize)
        .ok_or(CameraError::SizeOverflow {
            context: "frame pixel count",
        })?;

    let bytes = pixels
        .checked_mul(bytes_per_pixel)
        .ok_or(CameraError::SizeOverflow {
            context: "frame byte size",
        })?;

    if bytes > MAX_FRAME_BYTES {
        return Err(CameraError::FrameTooLarge {
            bytes,
            max_bytes: MAX_FRAME_BYTES,
        });
    }

    Ok(FrameSize { pixels, bytes })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_for_16bit_sensor() {
        let size = validate_frame_size(3096, 2080, 2).unwrap();
        assert_eq!(size.pixels, 3096 * 2080);
        assert_eq!(size.bytes, 3096 * 2080 * 2);
    }

    #[test]
    fn test_rejects_oversized_dimension() {
        let err = validate_frame_size(MAX_FRAME_DIMENSION + 1, 10, 1).unwrap_err();
        assert!(matches!(err, CameraError::FrameDimensionsTooLarge { .. }));
    }

    #[test]
    fn test_rejects_oversized_payload() {
        let err = validate_frame_size(60_000, 60_000, 4).unwrap_err();
        assert!(matches!(err, CameraError::FrameTooLarge { .. }));
    }
}
