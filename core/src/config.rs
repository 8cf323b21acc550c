//! Gateway configuration
//!
//! Static configuration consumed by the engine. Loading it from disk is the
//! binary's job; everything here has a usable `Default`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Hardware addresses of the peripherals to bridge
    pub peripherals: PeripheralsConfig,
    /// Discovery, subscription and heartbeat parameters
    pub connection: ConnectionConfig,
    /// Outbound queue parameters
    pub outbox: OutboxConfig,
    /// Protocol engine parameters
    pub engine: EngineConfig,
    /// Lock behaviour and setting defaults
    pub lock: LockConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeripheralsConfig {
    pub rfid_address: String,
    pub lock_address: String,
    /// Only used in test mode
    pub test_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    /// Delay between connect success and service discovery
    pub subscription_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_payload: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            service_uuid: Uuid::from_u128(0x0000_FFE0_0000_1000_8000_0080_5F9B_34FB),
            characteristic_uuid: Uuid::from_u128(0x0000_FFE1_0000_1000_8000_0080_5F9B_34FB),
            subscription_delay_ms: 1000,
            heartbeat_interval_ms: 1000,
            heartbeat_payload: "<hb>;".to_string(),
        }
    }
}

impl ConnectionConfig {
    pub fn subscription_delay(&self) -> Duration {
        Duration::from_millis(self.subscription_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Appended to every outbound frame
    pub delimiter: String,
    pub flush_interval_ms: u64,
    pub max_queue_depth: usize,
    /// Queued entries older than this are dropped instead of delivered
    pub entry_ttl_secs: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            delimiter: ";".to_string(),
            flush_interval_ms: 500,
            max_queue_depth: 256,
            entry_ttl_secs: 120,
        }
    }
}

impl OutboxConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on every correlated device round-trip
    pub response_timeout_ms: u64,
    /// Maximum history entries kept per peripheral
    pub history_limit: usize,
    pub log_flush_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 15_000,
            history_limit: 1000,
            log_flush_interval_ms: 500,
        }
    }
}

impl EngineConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn log_flush_interval(&self) -> Duration {
        Duration::from_millis(self.log_flush_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Delay before pushing settings if the lock has not asked for them
    pub initial_sync_delay_ms: u64,
    pub settings: LockSettingsDefaults,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            initial_sync_delay_ms: 5000,
            settings: LockSettingsDefaults::default(),
        }
    }
}

impl LockConfig {
    pub fn initial_sync_delay(&self) -> Duration {
        Duration::from_millis(self.initial_sync_delay_ms)
    }
}

/// Factory defaults for the lock's tunables, addressed by dotted path
/// (e.g. `lock.settings.main_servo.frequencies.unlock`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettingsDefaults {
    pub main_servo: MainServoDefaults,
    pub linear_servo: LinearServoDefaults,
    pub adxl: AdxlDefaults,
    pub oled: OledDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MainServoDefaults {
    pub frequencies: ServoFrequencies,
}

impl Default for MainServoDefaults {
    fn default() -> Self {
        Self {
            frequencies: ServoFrequencies {
                unlock: 1800,
                lock: 1200,
                idle: 1500,
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServoFrequencies {
    pub unlock: i64,
    pub lock: i64,
    pub idle: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearServoDefaults {
    pub angles: EngageAngles,
    pub step: i64,
    pub ms: i64,
}

impl Default for LinearServoDefaults {
    fn default() -> Self {
        Self {
            angles: EngageAngles {
                engaged: 90,
                disengaged: 0,
            },
            step: 5,
            ms: 15,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngageAngles {
    pub engaged: i64,
    pub disengaged: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdxlDefaults {
    pub max_read_count: i64,
    pub angles: LockAngles,
}

impl Default for AdxlDefaults {
    fn default() -> Self {
        Self {
            max_read_count: 10,
            angles: LockAngles {
                locked: 0,
                unlocked: 90,
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockAngles {
    pub locked: i64,
    pub unlocked: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OledDefaults {
    pub debug_display: i64,
}

impl GatewayConfig {
    /// Normalise hardware addresses to the lower-cased form used as map keys
    pub fn normalized(mut self) -> Self {
        self.peripherals.rfid_address = self.peripherals.rfid_address.trim().to_lowercase();
        self.peripherals.lock_address = self.peripherals.lock_address.trim().to_lowercase();
        self.peripherals.test_address = self
            .peripherals
            .test_address
            .map(|addr| addr.trim().to_lowercase())
            .filter(|addr| !addr.is_empty());
        self
    }

    /// Look up an integer by dotted path in the serialized configuration tree
    pub fn lookup_integer(&self, path: &str) -> Option<i64> {
        let tree = serde_json::to_value(self).ok()?;
        path.split('.')
            .try_fold(&tree, |node, segment| node.get(segment))
            .and_then(|value| value.as_i64())
    }
}

/// Shared secrets, loaded separately from the main configuration
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Secrets {
    /// Sent to the lock with every toggle command
    #[serde(default)]
    pub lock_secret: String,
    /// Bearer token expected by the HTTP control surface
    #[serde(default)]
    pub api_token: String,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("lock_secret", &"<redacted>")
            .field("api_token", &"<redacted>")
            .finish()
    }
}
