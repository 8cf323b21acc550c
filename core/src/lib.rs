// Lockbridge Core: Connection & Protocol Engine
//
// Bridges BLE peripherals (an RFID reader and a door lock) to a control
// surface: link management, frame reassembly, the outbound queue, command
// correlation and the access-control logic on top of the wire protocol.

pub mod config;
pub mod gateway;
pub mod peripheral;
pub mod protocol;
pub mod store;
pub mod transport;

use thiserror::Error;

pub use config::{GatewayConfig, Secrets};
pub use gateway::{Gateway, GatewayHandle};
pub use peripheral::{ConnectionState, PeripheralId, PeripheralRole, PeripheralRoster};
pub use protocol::{HandlerSet, Message, ProcessState, ResponseFuture};
pub use store::{
    KeyStore, LogEntry, MemoryStorage, PeripheralLog, SettingEntry, SettingsStore, SledStorage,
    StorageBackend, SETTINGS_CATALOGUE,
};
pub use transport::{BleTransport, CharacteristicRef, TransportError, TransportEvent};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Timed out waiting for <{tag}> response")]
    TimedOut { tag: String },
    #[error("Request for <{tag}> was cancelled")]
    Cancelled { tag: String },
    #[error("Outbox full for peripheral {peripheral} ({depth} messages)")]
    OutboxFull { peripheral: String, depth: usize },
    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(String),
    #[error("Unknown setting: {0}")]
    UnknownSetting(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Gateway not running")]
    NotRunning,
}

pub type Result<T> = std::result::Result<T, GatewayError>;
