// BLE platform bridge
//
// The radio itself lives behind `BleTransport`: the binary supplies an
// implementation (btleplug on desktop/linux), tests supply a scripted one.
// Asynchronous hardware happenings (advertisements, link loss, notification
// payloads) are pushed by the implementation as `TransportEvent`s.

use crate::peripheral::PeripheralId;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Scan failed: {0}")]
    ScanFailed(String),
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Service discovery failed: {0}")]
    DiscoveryFailed(String),
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(String),
    #[error("Not connected")]
    NotConnected,
}

// ============================================================================
// DATA STRUCTURES
// ============================================================================

/// A GATT characteristic located by service discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    pub service_uuid: Uuid,
    pub uuid: Uuid,
}

/// Events pushed by the platform into the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// An advertisement was seen
    Discovered(PeripheralId),
    /// The link dropped (either side)
    Disconnected(PeripheralId),
    /// Notification payload from a subscribed characteristic
    Notification { id: PeripheralId, data: Vec<u8> },
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::Discovered(id) => write!(f, "Discovered {{ id: {} }}", id),
            TransportEvent::Disconnected(id) => write!(f, "Disconnected {{ id: {} }}", id),
            TransportEvent::Notification { id, data } => {
                write!(f, "Notification {{ id: {}, data_len: {} }}", id, data.len())
            }
        }
    }
}

// ============================================================================
// PLATFORM BRIDGE TRAIT
// ============================================================================

/// Platform-specific BLE central operations
///
/// Every method is a single native call. None of them retry; a failure is
/// reported once and the connection layer decides what to do with it.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Begin reporting advertisements as `TransportEvent::Discovered`
    async fn start_scan(&self) -> Result<(), TransportError>;

    /// Stop reporting advertisements
    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Establish the link. Returns once the link is up.
    async fn connect(&self, id: &PeripheralId) -> Result<(), TransportError>;

    /// Tear the link down
    async fn disconnect(&self, id: &PeripheralId) -> Result<(), TransportError>;

    /// Discover services and return the requested characteristic, if present
    async fn discover_characteristic(
        &self,
        id: &PeripheralId,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Result<Option<CharacteristicRef>, TransportError>;

    /// Enable notifications; payloads arrive as `TransportEvent::Notification`
    async fn subscribe(
        &self,
        id: &PeripheralId,
        characteristic: &CharacteristicRef,
    ) -> Result<(), TransportError>;

    /// Write raw bytes to a characteristic
    async fn write(
        &self,
        id: &PeripheralId,
        characteristic: &CharacteristicRef,
        data: &[u8],
    ) -> Result<(), TransportError>;
}

/// Writable handle to a subscribed peripheral
#[derive(Clone)]
pub struct WriteChannel {
    peripheral: PeripheralId,
    characteristic: CharacteristicRef,
    transport: Arc<dyn BleTransport>,
}

impl WriteChannel {
    pub fn new(
        peripheral: PeripheralId,
        characteristic: CharacteristicRef,
        transport: Arc<dyn BleTransport>,
    ) -> Self {
        Self {
            peripheral,
            characteristic,
            transport,
        }
    }

    pub fn peripheral(&self) -> &PeripheralId {
        &self.peripheral
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        self.transport
            .write(&self.peripheral, &self.characteristic, data)
            .await
    }
}

impl fmt::Debug for WriteChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteChannel")
            .field("peripheral", &self.peripheral)
            .field("characteristic", &self.characteristic)
            .finish()
    }
}

// ============================================================================
// MOCK PLATFORM BRIDGE (for testing)
// ============================================================================
