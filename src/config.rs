// ─────────────────────────────────────────────────────────────────────────────
//  vuflash :: config  —  device configuration file
//
//  Known device identities live in device_config.json next to the binary.
//  A missing or unparsable file falls back to the built-in defaults so the
//  tool keeps working out of the box.
// ─────────────────────────────────────────────────────────────────────────────

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FlashError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "device_config.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceEntry {
    pub vendor_id:  String,
    pub product_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcu: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverSettings {
    pub auto_download:   bool,
    pub timeout_seconds: u64,
    pub require_admin:   bool,
}

impl Default for DriverSettings {
    fn default() -> Self {
        DriverSettings {
            auto_download: true,
            timeout_seconds: 30,
            require_admin: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// Device display name → identity.  BTreeMap keeps listings stable.
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceEntry>,
    #[serde(default)]
    pub driver_settings: DriverSettings,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let mut devices = BTreeMap::new();
        devices.insert(
            "Button Box".to_owned(),
            DeviceEntry {
                vendor_id: "0x16c0".into(),
                product_id: "0x05df".into(),
                description: "Arduino Button Box (V-USB)".into(),
                mcu: Some("atmega328p".into()),
            },
        );
        DeviceConfig {
            devices,
            driver_settings: DriverSettings::default(),
        }
    }
}

impl DeviceConfig {
    /// Load from `path`, falling back to the defaults if the file is absent
    /// or unparsable.
    pub fn load(path: &Path) -> Self {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(_) => {
                log::warn!("config file not found: {}, using defaults", path.display());
                return Self::default();
            }
        };

        match serde_json::from_str(&data) {
            Ok(cfg) => cfg,
            Err(e) => {
                log::warn!("unparsable config {}: {}, using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| FlashError::Other(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Look up a configured device by display name.
    pub fn device(&self, name: &str) -> Result<&DeviceEntry> {
        self.devices
            .get(name)
            .ok_or_else(|| FlashError::UnknownDevice(name.to_owned()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────────────────────
