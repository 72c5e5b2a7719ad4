//! Captured frame record handed to the delivery path.
//!
//! A `CapturedFrame` is built once per successful capture and never mutated
//! afterwards. Pixel data lives in a [`Bytes`] buffer so every consumer
//! (encoder, recorder, preview) shares the same allocation.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Colour-filter mosaic layout of the sensor, named by its top-left 2x2 cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BayerPattern {
    Rg,
    Bg,
    Gr,
    Gb,
}

impl BayerPattern {
    /// Pattern string used in image headers (e.g. `BAYERPAT`).
    pub fn as_str(&self) -> &'static str {
        match self {
            BayerPattern::Rg => "RGGB",
            BayerPattern::Bg => "BGGR",
            BayerPattern::Gr => "GRBG",
            BayerPattern::Gb => "GBRG",
        }
    }
}

/// How the pixel bytes of a frame must be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelEncoding {
    /// Single channel luminance.
    Mono,
    /// Raw sensor data behind a colour filter mosaic.
    Bayer(BayerPattern),
    /// Interleaved colour (BGR24 / BGRA32).
    Rgb,
}

impl PixelEncoding {
    pub fn bayer(&self) -> Option<BayerPattern> {
        match self {
            PixelEncoding::Bayer(pattern) => Some(*pattern),
            _ => None,
        }
    }
}

/// One completed capture plus the metadata needed to encode it.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Driver-assigned monotonic frame number.
    pub frame_number: u64,
    /// Time the readout completed.
    pub timestamp: DateTime<Utc>,
    /// Width in pixels (after binning).
    pub width: u32,
    /// Height in pixels (after binning).
    pub height: u32,
    /// Significant bits per channel.
    pub bit_depth: u32,
    /// Bytes each pixel occupies in `pixels`.
    pub bytes_per_pixel: usize,
    pub encoding: PixelEncoding,
    /// Requested integration time.
    pub exposure: Duration,
    /// Sensor temperature at readout, in Celsius.
    pub temperature_c: Option<f64>,
    /// Binning factors (x, y).
    pub binning: (u32, u32),
    /// Top-left corner of the region of interest, in unbinned pixels.
    pub roi_origin: (u32, u32),
    pub pixels: Bytes,
}

impl CapturedFrame {
    /// Number of bytes a frame with this geometry should occupy.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.bytes_per_pixel
    }

    /// Whether the pixel buffer matches the advertised geometry.
    pub fn is_consistent(&self) -> bool {
        self.pixels.len() == self.expected_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bayer_strings() {
        assert_eq!(BayerPattern::Rg.as_str(), "RGGB");
        assert_eq!(BayerPattern::Gb.as_str(), "GBRG");
        assert_eq!(
            PixelEncoding::Bayer(BayerPattern::Gr).bayer(),
            Some(BayerPattern::Gr)
        );
        assert_eq!(PixelEncoding::Mono.bayer(), None);
    }

    #[test]
    fn test_frame_consistency() {
        let frame = CapturedFrame {
            frame_number: 1,
            timestamp: Utc::now(),
            width: 4,
            height: 2,
            bit_depth: 16,
            bytes_per_pixel: 2,
            encoding: PixelEncoding::Mono,
            exposure: Duration::from_millis(10),
            temperature_c: None,
            binning: (1, 1),
            roi_origin: (0, 0),
            pixels: Bytes::from(vec![0u8; 16]),
        };
        assert!(frame.is_consistent());
    }
}
