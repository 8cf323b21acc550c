// Lock settings persistence
//
// Each tunable is stored under `settings:<name>` as a JSON integer. A cold
// read falls back to the configured default, persists it, and serves the
// stored value from then on.

use crate::config::GatewayConfig;
use crate::store::backend::StorageBackend;
use crate::GatewayError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const SETTINGS_PREFIX: &str = "settings:";

/// Name, default location and wire tag of one lock tunable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingDescriptor {
    pub name: &'static str,
    /// Dotted path into the configuration tree
    pub config_path: &'static str,
    pub tag: &'static str,
}

/// Every lock tunable, in push order
pub const SETTINGS_CATALOGUE: &[SettingDescriptor] = &[
    SettingDescriptor {
        name: "mainServoUnlockFrequency",
        config_path: "lock.settings.main_servo.frequencies.unlock",
        tag: "m_xlk",
    },
    SettingDescriptor {
        name: "mainServoLockFrequency",
        config_path: "lock.settings.main_servo.frequencies.lock",
        tag: "m_lk",
    },
    SettingDescriptor {
        name: "mainServoIdleFrequency",
        config_path: "lock.settings.main_servo.frequencies.idle",
        tag: "m_idl",
    },
    SettingDescriptor {
        name: "linearServoEngagedAngle",
        config_path: "lock.settings.linear_servo.angles.engaged",
        tag: "l_en",
    },
    SettingDescriptor {
        name: "linearServoDisengagedAngle",
        config_path: "lock.settings.linear_servo.angles.disengaged",
        tag: "l_xen",
    },
    SettingDescriptor {
        name: "linearServoStep",
        config_path: "lock.settings.linear_servo.step",
        tag: "l_step",
    },
    SettingDescriptor {
        name: "linearServoMs",
        config_path: "lock.settings.linear_servo.ms",
        tag: "l_ms",
    },
    SettingDescriptor {
        name: "adxlReadSampleCount",
        config_path: "lock.settings.adxl.max_read_count",
        tag: "a_rdct",
    },
    SettingDescriptor {
        name: "adxlLockAngle",
        config_path: "lock.settings.adxl.angles.locked",
        tag: "a_lk",
    },
    SettingDescriptor {
        name: "adxlUnlockAngle",
        config_path: "lock.settings.adxl.angles.unlocked",
        tag: "a_xlk",
    },
    SettingDescriptor {
        name: "oledDebugDisplay",
        config_path: "lock.settings.oled.debug_display",
        tag: "o_dbg",
    },
];

pub fn descriptor(name: &str) -> Option<&'static SettingDescriptor> {
    SETTINGS_CATALOGUE.iter().find(|entry| entry.name == name)
}

pub fn descriptor_for_tag(tag: &str) -> Option<&'static SettingDescriptor> {
    SETTINGS_CATALOGUE.iter().find(|entry| entry.tag == tag)
}

/// A setting with its current value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingEntry {
    pub name: String,
    pub tag: String,
    pub value: i64,
}

#[derive(Clone)]
pub struct SettingsStore {
    backend: Arc<dyn StorageBackend>,
    config: Arc<GatewayConfig>,
}

impl SettingsStore {
    pub fn new(backend: Arc<dyn StorageBackend>, config: Arc<GatewayConfig>) -> Self {
        Self { backend, config }
    }

    fn key(name: &str) -> String {
        format!("{}{}", SETTINGS_PREFIX, name)
    }

    pub fn get_setting_value(&self, name: &str) -> Result<i64, GatewayError> {
        let entry = descriptor(name).ok_or_else(|| GatewayError::UnknownSetting(name.to_string()))?;
        let key = Self::key(name);

        if let Some(data) = self
            .backend
            .get(key.as_bytes())
            .map_err(GatewayError::Storage)?
        {
            return serde_json::from_slice(&data)
                .map_err(|e| GatewayError::Storage(format!("corrupt setting {}: {}", name, e)));
        }

        let value = self.config.lookup_integer(entry.config_path).ok_or_else(|| {
            GatewayError::UnknownSetting(format!("{} (no default at {})", name, entry.config_path))
        })?;
        debug!("Seeding setting {} = {} from configuration", name, value);
        self.write(&key, value)?;
        Ok(value)
    }

    /// Every catalogued setting with its current value, in catalogue order
    pub fn get_settings_map(&self) -> Result<Vec<SettingEntry>, GatewayError> {
        SETTINGS_CATALOGUE
            .iter()
            .map(|entry| {
                Ok(SettingEntry {
                    name: entry.name.to_string(),
                    tag: entry.tag.to_string(),
                    value: self.get_setting_value(entry.name)?,
                })
            })
            .collect()
    }

    pub fn save_setting(&self, name: &str, value: i64) -> Result<(), GatewayError> {
        if descriptor(name).is_none() {
            return Err(GatewayError::UnknownSetting(name.to_string()));
        }
        self.write(&Self::key(name), value)
    }

    fn write(&self, key: &str, value: i64) -> Result<(), GatewayError> {
        let data = serde_json::to_vec(&value).map_err(|e| GatewayError::Storage(e.to_string()))?;
        self.backend
            .put(key.as_bytes(), &data)
            .map_err(GatewayError::Storage)
    }
}
