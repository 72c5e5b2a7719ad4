//! Persisted per-camera settings: the active video format and flip switches,
//! stored as TOML and restored on the next connect.

use crate::sdk::VideoFormat;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistedSettings {
    #[serde(default)]
    pub video_format: Option<VideoFormat>,
    #[serde(default)]
    pub flip_horizontal: bool,
    #[serde(default)]
    pub flip_vertical: bool,
}

/// Reads and writes [`PersistedSettings`] at a fixed path.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when nothing has been saved yet.
    pub fn load(&self) -> Result<Option<PersistedSettings>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading settings from {}", self.path.display()))?;
        let settings = toml::from_str(&text)
            .with_context(|| format!("parsing settings in {}", self.path.display()))?;
        debug!(path = %self.path.display(), "Settings loaded");
        Ok(Some(settings))
    }

    pub fn save(&self, settings: &PersistedSettings) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let text = toml::to_string_pretty(settings).context("serializing settings")?;
        std::fs::write(&self.path, text)
            .with_context(|| format!("writing settings to {}", self.path.display()))?;
        debug!(path = %self.path.display(), "Settings saved");
        Ok(())
    }
}
