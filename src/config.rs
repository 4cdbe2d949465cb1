//! Command-line tool configuration
//!
//! An optional `qdl.toml` in the platform configuration directory can
//! override the USB identity the device locator searches for, the baud rate
//! the channel is opened at, and the default execution-failure policy.

use std::{fs::read_to_string, path::PathBuf};

use directories::ProjectDirs;
use log::debug;
use miette::{IntoDiagnostic, Result, WrapErr};
use serde::{Deserialize, Serialize};

/// A configured USB device identity
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct UsbDevice {
    /// USB Vendor ID
    #[serde(
        serialize_with = "serialize_u16_to_hex",
        deserialize_with = "deserialize_hex_to_u16"
    )]
    pub vid: u16,
    /// USB Product ID
    #[serde(
        serialize_with = "serialize_u16_to_hex",
        deserialize_with = "deserialize_hex_to_u16"
    )]
    pub pid: u16,
}

fn deserialize_hex_to_u16<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let hex = String::deserialize(deserializer)?.to_lowercase();
    let hex = hex.trim_start_matches("0x");

    let int = u16::from_str_radix(hex, 16).map_err(serde::de::Error::custom)?;

    Ok(int)
}

fn serialize_u16_to_hex<S>(decimal: &u16, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let hex_string = format!("{decimal:04x}");
    serializer.serialize_str(&hex_string)
}

/// Tool configuration
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    /// USB identity to search for instead of the emergency-download default
    pub usb_device: Option<UsbDevice>,
    /// Baud rate to open the channel at instead of the 115200 default
    pub baud: Option<u32>,
    /// Treat an execution-phase failure as a process failure
    #[serde(default)]
    pub strict: bool,
}

impl Config {
    /// Load the configuration file, if one exists.
    pub fn load() -> Result<Self> {
        let Some(path) = Self::config_path() else {
            return Ok(Self::default());
        };

        if !path.is_file() {
            return Ok(Self::default());
        }

        debug!("Loading configuration file: {}", path.display());
        let contents = read_to_string(&path)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to read {}", path.display()))?;

        toml::from_str(&contents)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to parse {}", path.display()))
    }

    fn config_path() -> Option<PathBuf> {
        let dirs = ProjectDirs::from("", "", "qdl")?;
        Some(dirs.config_dir().join("qdl.toml"))
    }
}
