// btleplug-backed BLE central
//
// Peripherals are addressed by their hardware address (lower-cased). An
// advertisement is forwarded as `Discovered` only while scanning and only for
// peripherals that are not already connected.

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId as PlatformId};
use futures::StreamExt;
use lockbridge_core::{
    BleTransport, CharacteristicRef, PeripheralId, TransportError, TransportEvent,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

fn peripheral_id(address: BDAddr) -> PeripheralId {
    PeripheralId::new(address.to_string())
}

pub struct BtleplugTransport {
    adapter: Adapter,
    events: mpsc::Sender<TransportEvent>,
    scanning: AtomicBool,
    peripherals: RwLock<HashMap<PeripheralId, Peripheral>>,
    notification_pumps: Mutex<HashMap<PeripheralId, AbortHandle>>,
}

impl BtleplugTransport {
    /// Open the first available adapter
    pub async fn new(events: mpsc::Sender<TransportEvent>) -> anyhow::Result<Arc<Self>> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No Bluetooth adapter available"))?;

        match adapter.adapter_info().await {
            Ok(name) => info!("Using Bluetooth adapter {}", name),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        Ok(Arc::new(Self {
            adapter,
            events,
            scanning: AtomicBool::new(false),
            peripherals: RwLock::new(HashMap::new()),
            notification_pumps: Mutex::new(HashMap::new()),
        }))
    }

    /// Forward adapter events until the adapter's stream ends
    pub async fn watch(self: Arc<Self>) -> anyhow::Result<()> {
        let mut events = self.adapter.events().await?;
        while let Some(event) = events.next().await {
            match event {
                CentralEvent::DeviceDiscovered(platform_id)
                | CentralEvent::DeviceUpdated(platform_id) => {
                    self.on_advertisement(&platform_id).await;
                }
                CentralEvent::DeviceDisconnected(platform_id) => {
                    self.on_link_lost(&platform_id).await;
                }
                other => trace!("Unhandled BLE event: {:?}", other),
            }
        }
        warn!("Adapter event stream ended");
        Ok(())
    }

    async fn on_advertisement(&self, platform_id: &PlatformId) {
        let peripheral = match self.adapter.peripheral(platform_id).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                debug!("Advertisement from unknown peripheral {:?}: {}", platform_id, e);
                return;
            }
        };
        let id = peripheral_id(peripheral.address());
        self.peripherals
            .write()
            .await
            .insert(id.clone(), peripheral.clone());

        if !self.scanning.load(Ordering::SeqCst) {
            return;
        }
        if peripheral.is_connected().await.unwrap_or(false) {
            return;
        }
        let _ = self.events.send(TransportEvent::Discovered(id)).await;
    }

    async fn on_link_lost(&self, platform_id: &PlatformId) {
        let id = {
            let peripherals = self.peripherals.read().await;
            peripherals
                .iter()
                .find(|(_, peripheral)| &peripheral.id() == platform_id)
                .map(|(id, _)| id.clone())
        };
        let Some(id) = id else {
            return;
        };
        self.stop_notifications(&id).await;
        let _ = self.events.send(TransportEvent::Disconnected(id)).await;
    }

    async fn lookup(&self, id: &PeripheralId) -> Result<Peripheral, TransportError> {
        self.peripherals
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeripheral(id.to_string()))
    }

    fn characteristic(
        peripheral: &Peripheral,
        characteristic: &CharacteristicRef,
    ) -> Result<Characteristic, TransportError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service_uuid)
            .ok_or(TransportError::NotConnected)
    }

    async fn stop_notifications(&self, id: &PeripheralId) {
        if let Some(pump) = self.notification_pumps.lock().await.remove(id) {
            pump.abort();
        }
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn start_scan(&self) -> Result<(), TransportError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| TransportError::ScanFailed(e.to_string()))?;
        self.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.scanning.store(false, Ordering::SeqCst);
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| TransportError::ScanFailed(e.to_string()))
    }

    async fn connect(&self, id: &PeripheralId) -> Result<(), TransportError> {
        let peripheral = self.lookup(id).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))
    }

    async fn disconnect(&self, id: &PeripheralId) -> Result<(), TransportError> {
        self.stop_notifications(id).await;
        let peripheral = self.lookup(id).await?;
        peripheral
            .disconnect()
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))
    }

    async fn discover_characteristic(
        &self,
        id: &PeripheralId,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Result<Option<CharacteristicRef>, TransportError> {
        let peripheral = self.lookup(id).await?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| TransportError::DiscoveryFailed(e.to_string()))?;

        Ok(peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic_uuid && c.service_uuid == service_uuid)
            .map(|c| CharacteristicRef {
                service_uuid: c.service_uuid,
                uuid: c.uuid,
            }))
    }

    async fn subscribe(
        &self,
        id: &PeripheralId,
        characteristic: &CharacteristicRef,
    ) -> Result<(), TransportError> {
        let peripheral = self.lookup(id).await?;
        let target = Self::characteristic(&peripheral, characteristic)?;
        peripheral
            .subscribe(&target)
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;

        let events = self.events.clone();
        let source = id.clone();
        let uuid = characteristic.uuid;
        let pump = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != uuid {
                    continue;
                }
                let event = TransportEvent::Notification {
                    id: source.clone(),
                    data: notification.value,
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            debug!("[{}] Notification stream closed", source);
        });

        if let Some(previous) = self
            .notification_pumps
            .lock()
            .await
            .insert(id.clone(), pump.abort_handle())
        {
            previous.abort();
        }
        Ok(())
    }

    async fn write(
        &self,
        id: &PeripheralId,
        characteristic: &CharacteristicRef,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let peripheral = self.lookup(id).await?;
        let target = Self::characteristic(&peripheral, characteristic)?;
        let write_type = if target
            .properties
            .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
        {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };
        peripheral
            .write(&target, data, write_type)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }
}
