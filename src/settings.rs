//! Daemon settings
//!
//! Read from `~/.config/padkill/config.toml` (for the system service this is
//! root's config directory). Every field is optional; a missing file means
//! defaults.

use crate::decoder::ComboCodes;
use crate::device::DEFAULT_CONTROLLER_NAMES;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const SYSTEM_RUNTIME_DIR: &str = "/run";

/// Daemon settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Seconds between device scans
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Exact product names of controllers to monitor
    #[serde(default = "default_controller_names")]
    pub controller_names: Vec<String>,

    /// Key code of the Home (PS) button
    #[serde(default = "default_home_code")]
    pub home_code: u16,

    /// Key code of the Triangle button
    #[serde(default = "default_triangle_code")]
    pub triangle_code: u16,

    /// Scratch directory for the worker registry
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

fn default_scan_interval() -> u64 {
    5
}

fn default_controller_names() -> Vec<String> {
    DEFAULT_CONTROLLER_NAMES.iter().map(|s| s.to_string()).collect()
}

fn default_home_code() -> u16 {
    ComboCodes::default().home
}

fn default_triangle_code() -> u16 {
    ComboCodes::default().triangle
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval(),
            controller_names: default_controller_names(),
            home_code: default_home_code(),
            triangle_code: default_triangle_code(),
            state_dir: None,
        }
    }
}

impl Settings {
    /// Get the settings file path
    pub fn settings_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("padkill");
        Ok(config_dir.join("config.toml"))
    }

    /// Load settings from the default location (or use defaults)
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::settings_path()?)
    }

    /// Load settings from a file (or use defaults if it does not exist)
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No settings file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let settings: Settings =
            toml::from_str(&content).with_context(|| format!("Invalid settings file {:?}", path))?;
        settings.validate()?;
        info!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.scan_interval_secs == 0 {
            anyhow::bail!("scan_interval_secs must be at least 1");
        }
        if self.controller_names.is_empty() {
            anyhow::bail!("controller_names must not be empty");
        }
        if self.home_code == self.triangle_code {
            anyhow::bail!("home_code and triangle_code must differ");
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn combo_codes(&self) -> ComboCodes {
        ComboCodes {
            home: self.home_code,
            triangle: self.triangle_code,
        }
    }

    /// Scratch directory unless configured: `$XDG_RUNTIME_DIR/padkill`, or
    /// `/run/padkill` for the system service
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::runtime_dir()
                .unwrap_or_else(|| PathBuf::from(SYSTEM_RUNTIME_DIR))
                .join("padkill")
        })
    }
}
