//! Driver Configuration using Figment
//!
//! Configuration is layered, highest precedence last:
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `SVBONY_` (nested keys split on `__`)
//!
//! ```text
//! SVBONY_CAMERA="SVBONY SV605CC"
//! SVBONY_CAPTURE__POLL_INTERVAL_MS=10
//! SVBONY_THERMAL__THRESHOLD_C=0.5
//! ```

use ccd_core::{CameraError, CameraResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::components::connection::CameraSelector;

const ENV_PREFIX: &str = "SVBONY_";
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level driver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Camera to open: a camera name, an enumeration index, or empty for the
    /// first one found
    #[serde(default)]
    pub camera: Option<String>,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub thermal: ThermalConfig,
    /// Frames buffered between the driver and the delivery path
    #[serde(default = "default_frame_channel_capacity")]
    pub frame_channel_capacity: usize,
    /// File holding the persisted video format and flip switches
    #[serde(default)]
    pub settings_path: Option<PathBuf>,
}

/// Acquisition worker settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Cancellation poll interval; bounds abort latency
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Readout attempts per exposure before the capture is failed
    #[serde(default = "default_exposure_retries")]
    pub exposure_retries: u32,
    /// Consecutive streaming read failures before the stream is failed
    #[serde(default = "default_stream_failure_limit")]
    pub stream_failure_limit: u32,
}

/// Thermal regulation settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThermalConfig {
    #[serde(default = "default_thermal_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Distance from target, in Celsius, counted as reached
    #[serde(default = "default_threshold_c")]
    pub threshold_c: f64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_frame_channel_capacity() -> usize {
    16
}

fn default_poll_interval_ms() -> u64 {
    20
}

fn default_exposure_retries() -> u32 {
    3
}

fn default_stream_failure_limit() -> u32 {
    3
}

fn default_thermal_poll_interval_ms() -> u64 {
    1000
}

fn default_threshold_c() -> f64 {
    0.25
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            exposure_retries: default_exposure_retries(),
            stream_failure_limit: default_stream_failure_limit(),
        }
    }
}

impl CaptureConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_thermal_poll_interval_ms(),
            threshold_c: default_threshold_c(),
        }
    }
}

impl ThermalConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            camera: None,
            log_level: default_log_level(),
            capture: CaptureConfig::default(),
            thermal: ThermalConfig::default(),
            frame_channel_capacity: default_frame_channel_capacity(),
            settings_path: None,
        }
    }
}

impl DriverConfig {
    /// Load defaults, then `path` if given, then `SVBONY_` environment
    /// overrides, and validate the result.
    ///
    /// # Errors
    ///
    /// Returns `CameraError::Config` if the file cannot be parsed or a value
    /// fails validation.
    pub fn load(path: Option<&Path>) -> CameraResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(DriverConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    fn extract(figment: Figment) -> CameraResult<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| CameraError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> CameraResult<()> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(CameraError::Config(format!(
                "invalid log_level '{}', must be one of: {}",
                self.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        let zero = [
            ("capture.poll_interval_ms", self.capture.poll_interval_ms == 0),
            ("capture.exposure_retries", self.capture.exposure_retries == 0),
            (
                "capture.stream_failure_limit",
                self.capture.stream_failure_limit == 0,
            ),
            ("thermal.poll_interval_ms", self.thermal.poll_interval_ms == 0),
            ("frame_channel_capacity", self.frame_channel_capacity == 0),
        ];
        if let Some((field, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(CameraError::Config(format!("{field} must be greater than zero")));
        }

        if !(self.thermal.threshold_c.is_finite() && self.thermal.threshold_c > 0.0) {
            return Err(CameraError::Config(format!(
                "thermal.threshold_c must be a positive number, got {}",
                self.thermal.threshold_c
            )));
        }
        Ok(())
    }

    /// Camera selection derived from `camera`: a number picks by index,
    /// anything else by name.
    pub fn selector(&self) -> CameraSelector {
        match self.camera.as_deref().map(str::trim) {
            None | Some("") => CameraSelector::First,
            Some(value) => match value.parse::<usize>() {
                Ok(index) => CameraSelector::Index(index),
                Err(_) => CameraSelector::Name(value.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.capture.poll_interval(), Duration::from_millis(20));
        assert_eq!(config.capture.exposure_retries, 3);
        assert_eq!(config.thermal.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.selector(), CameraSelector::First);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
camera = "SVBONY SV305M"
log_level = "debug"

[capture]
poll_interval_ms = 5
"#
        )
        .unwrap();

        let config = DriverConfig::extract(
            Figment::from(Serialized::defaults(DriverConfig::default()))
                .merge(Toml::file(file.path())),
        )
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.capture.poll_interval_ms, 5);
        // Unset keys keep their defaults
        assert_eq!(config.capture.exposure_retries, 3);
        assert_eq!(
            config.selector(),
            CameraSelector::Name("SVBONY SV305M".to_string())
        );
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut config = DriverConfig::default();
        config.capture.poll_interval_ms = 0;
        assert!(matches!(config.validate(), Err(CameraError::Config(_))));

        let mut config = DriverConfig::default();
        config.frame_channel_capacity = 0;
        assert!(matches!(config.validate(), Err(CameraError::Config(_))));
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let config = DriverConfig {
            log_level: "verbose".into(),
            ..DriverConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_numeric_camera_selects_index() {
        let config = DriverConfig {
            camera: Some("1".into()),
            ..DriverConfig::default()
        };
        assert_eq!(config.selector(), CameraSelector::Index(1));
    }
}
