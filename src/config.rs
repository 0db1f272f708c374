//! Configuration management for Mixbridge.
//!
//! Handles loading, parsing, and hot-reloading of the YAML configuration file.

pub mod watcher;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::noise::NoiseReductionLevel;
use crate::protocol::ParserSettings;
use crate::targets::TargetMapping;

/// Root configuration structure.
///
/// Components receive this as a value snapshot at construction plus a
/// reload-notification channel; nothing reaches into shared mutable config.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Which sessions each slider drives.
    #[serde(default = "TargetMapping::master_only")]
    pub slider_mapping: TargetMapping,

    /// Which sessions each button addresses.
    #[serde(default)]
    pub button_mapping: TargetMapping,

    /// Flip every slider: deck fully up means silent.
    #[serde(default)]
    pub invert_sliders: bool,

    /// Noise reduction tier: "low", "default" or "high".
    #[serde(default)]
    pub noise_reduction: String,

    /// Serial port name, e.g. "COM4" or "/dev/ttyUSB0".
    #[serde(default = "default_com_port")]
    pub com_port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Listen over raw HID instead of the serial port.
    #[serde(default)]
    pub enable_hid_listen: bool,

    #[serde(default)]
    pub vendor_id: u16,
    #[serde(default)]
    pub product_id: u16,
    #[serde(default)]
    pub usage_page: u16,
    #[serde(default)]
    pub usage: u16,

    /// Session matching policy: "default" for process-binary names,
    /// anything else enables the extended media/device naming.
    #[serde(default = "default_matching")]
    pub matching: String,
}

impl AppConfig {
    /// Load configuration from file
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML config: {}", path))?;

        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, path: &str) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config to YAML")?;

        fs::write(path, yaml)
            .await
            .with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }

    /// Parser-facing view of this config.
    pub fn parser_settings(&self) -> ParserSettings {
        ParserSettings {
            invert_sliders: self.invert_sliders,
            noise_reduction: NoiseReductionLevel::from_config(&self.noise_reduction),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            slider_mapping: TargetMapping::master_only(),
            button_mapping: TargetMapping::default(),
            invert_sliders: false,
            noise_reduction: String::new(),
            com_port: default_com_port(),
            baud_rate: default_baud_rate(),
            enable_hid_listen: false,
            vendor_id: 0,
            product_id: 0,
            usage_page: 0,
            usage: 0,
            matching: default_matching(),
        }
    }
}

/// Default config file location: `<user config dir>/mixbridge/config.yaml`,
/// falling back to a file in the working directory.
pub fn default_config_path() -> String {
    dirs::config_dir()
        .map(|dir| {
            dir.join("mixbridge")
                .join("config.yaml")
                .to_string_lossy()
                .into_owned()
        })
        .unwrap_or_else(|| "config.yaml".to_string())
}

// Default value functions
fn default_com_port() -> String {
    "COM4".to_string()
}
fn default_baud_rate() -> u32 {
    9600
}
fn default_matching() -> String {
    "default".to_string()
}
