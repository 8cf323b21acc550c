//! Peripheral identity, roles and link state

use crate::config::GatewayConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized (lower-cased) hardware address of a peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(address.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for PeripheralId {
    fn from(address: String) -> Self {
        Self::new(address)
    }
}

/// What a peripheral is, which decides how its frames are dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeripheralRole {
    Rfid,
    Lock,
    /// Bench peripheral used in test mode
    Test,
}

impl fmt::Display for PeripheralRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeripheralRole::Rfid => write!(f, "RFID"),
            PeripheralRole::Lock => write!(f, "Lock"),
            PeripheralRole::Test => write!(f, "Test"),
        }
    }
}

/// Link state of a tracked peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Subscribing,
    Subscribed,
}

impl ConnectionState {
    /// Connecting, Subscribing or Subscribed
    pub fn is_active(&self) -> bool {
        !matches!(self, ConnectionState::Disconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Subscribing => write!(f, "subscribing"),
            ConnectionState::Subscribed => write!(f, "subscribed"),
        }
    }
}

/// The fixed set of peripherals this gateway bridges, in connection order
#[derive(Debug, Clone, Default)]
pub struct PeripheralRoster {
    entries: Vec<(PeripheralId, PeripheralRole)>,
}

impl PeripheralRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: impl Into<PeripheralId>, role: PeripheralRole) -> Self {
        let id = id.into();
        self.entries.retain(|(existing, _)| existing != &id);
        self.entries.push((id, role));
        self
    }

    /// RFID reader and door lock, as configured
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new()
            .with(config.peripherals.rfid_address.as_str(), PeripheralRole::Rfid)
            .with(config.peripherals.lock_address.as_str(), PeripheralRole::Lock)
    }

    /// Single bench peripheral
    pub fn test_mode(config: &GatewayConfig) -> Option<Self> {
        config
            .peripherals
            .test_address
            .as_deref()
            .map(|addr| Self::new().with(addr, PeripheralRole::Test))
    }

    pub fn role_of(&self, id: &PeripheralId) -> Option<PeripheralRole> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == id)
            .map(|(_, role)| *role)
    }

    pub fn id_of(&self, role: PeripheralRole) -> Option<&PeripheralId> {
        self.entries
            .iter()
            .find(|(_, entry_role)| *entry_role == role)
            .map(|(id, _)| id)
    }

    pub fn contains(&self, id: &PeripheralId) -> bool {
        self.role_of(id).is_some()
    }

    pub fn ids(&self) -> impl Iterator<Item = &PeripheralId> {
        self.entries.iter().map(|(id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
