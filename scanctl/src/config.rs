/*!
Configuration management for the scan control client.
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use shared::AxisTransforms;

/// Main microscope configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicroscopeConfig {
    pub server: ServerConfig,
    pub transforms: TransformConfig,
    pub pin_map: PinMapConfig,
    /// Magnification -> field of view in meters, keyed by the
    /// magnification written as a decimal string (TOML keys are strings)
    #[serde(default)]
    pub magnification_table: BTreeMap<String, f64>,
    pub capture: CaptureDefaults,
}

impl MicroscopeConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self {
            server: ServerConfig::default(),
            transforms: TransformConfig::default(),
            pin_map: PinMapConfig::default(),
            magnification_table: BTreeMap::new(),
            capture: CaptureDefaults::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: MicroscopeConfig =
            toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Axis mapping for capture, as configured
    pub fn axis_transforms(&self) -> AxisTransforms {
        AxisTransforms {
            x_flip: self.transforms.x_flip,
            y_flip: self.transforms.y_flip,
            rotate90: self.transforms.rotate90,
        }
    }

    /// Field of view in meters at a given magnification, if calibrated
    pub fn field_of_view(&self, magnification: u32) -> Option<f64> {
        self.magnification_table
            .get(&magnification.to_string())
            .copied()
    }
}

impl Default for MicroscopeConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Scan server endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Scan server host
    pub host: String,

    /// Scan server TCP port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2224,
        }
    }
}

/// Image orientation relative to the raw scan axes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Mirror the image left-right
    #[serde(default)]
    pub x_flip: bool,

    /// Mirror the image top-bottom
    #[serde(default)]
    pub y_flip: bool,

    /// Rotate the image a quarter turn
    #[serde(default)]
    pub rotate90: bool,
}

/// Digital IO pin names for the beam control lines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinMapConfig {
    /// Pin asserted while a scan is running
    pub scan_enable: String,

    /// Pin enabling the blanking amplifier
    pub blank_enable: String,

    /// Pin carrying the blanking signal itself
    pub blank: String,
}

impl Default for PinMapConfig {
    fn default() -> Self {
        Self {
            scan_enable: "0".to_string(),
            blank_enable: "1".to_string(),
            blank: "2".to_string(),
        }
    }
}

/// Capture parameters used when the CLI does not override them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureDefaults {
    /// Full-frame resolution in X
    pub x_resolution: u16,

    /// Full-frame resolution in Y
    pub y_resolution: u16,

    /// Dwell time per pixel in clock cycles
    pub dwell_cycles: u16,

    /// Sample width in bits (8 or 16)
    pub output_bits: u8,

    /// Scan continuously instead of capturing one frame
    pub free_run: bool,
}

impl Default for CaptureDefaults {
    fn default() -> Self {
        Self {
            x_resolution: 1024,
            y_resolution: 1024,
            dwell_cycles: 2,
            output_bits: 16,
            free_run: false,
        }
    }
}
