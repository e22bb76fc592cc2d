//! Configuration file support for bootlink.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (BOOTLINK_*)
//! 3. Local config file (./bootlink.toml)
//! 4. Global config file (~/.config/bootlink/config.toml)

use bootlink::{DeviceInfo, EngineConfig};
use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Local configuration file name.
pub const LOCAL_CONFIG: &str = "bootlink.toml";

/// Serial port settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
}

/// Backing store of the emulated device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Flash image file.
    pub image: Option<PathBuf>,
    /// Firmware area size in bytes.
    pub capacity: Option<u32>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Identity of the emulated device.
    pub device: Option<DeviceInfo>,
    /// Protocol engine tuning.
    pub engine: Option<EngineConfig>,
    /// Flash image configuration.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                if let Some(global_config) = Self::load_from_file(&global_path) {
                    debug!("Loaded global config from {}", global_path.display());
                    config.merge(global_config);
                }
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "bootlink").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Engine settings, defaults when not configured.
    pub fn engine_config(&self) -> EngineConfig {
        self.engine.clone().unwrap_or_default()
    }

    /// Device identity, defaults when not configured.
    pub fn device_info(&self) -> DeviceInfo {
        self.device.clone().unwrap_or_default()
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.port.serial.is_some() {
            self.port.serial = other.port.serial;
        }
        if other.port.baud.is_some() {
            self.port.baud = other.port.baud;
        }
        if other.device.is_some() {
            self.device = other.device;
        }
        if other.engine.is_some() {
            self.engine = other.engine;
        }
        if other.flash.image.is_some() {
            self.flash.image = other.flash.image;
        }
        if other.flash.capacity.is_some() {
            self.flash.capacity = other.flash.capacity;
        }
    }

    /// Remember the serial port in the local config file.
    pub fn remember_port(&mut self, serial: &str) -> anyhow::Result<()> {
        self.port.serial = Some(serial.to_string());

        let path = Path::new(LOCAL_CONFIG);
        let mut stored = Self::load_from_file(path).unwrap_or_default();
        stored.port.serial = Some(serial.to_string());

        let content = toml::to_string_pretty(&stored)?;
        fs::write(path, content)?;
        info!("Saved port configuration to {}", path.display());

        Ok(())
    }
}
