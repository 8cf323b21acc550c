//! Connection Manager: per-peripheral link state machine
//!
//! Drives each tracked peripheral through
//! `Disconnected → Connecting → Subscribing → Subscribed` and back.
//! Native calls are spawned as short tasks that report their completion as a
//! `LinkEvent` stamped with the peripheral's generation. Every transition into
//! `Connecting` or `Disconnected` bumps the generation, so completions and timer
//! fires that belong to an earlier attempt are dropped on arrival.
//!
//! Reconnection has no retry loop: a failed or lost link is simply reset and
//! picked up again on the next discovery event.

use crate::config::ConnectionConfig;
use crate::peripheral::{ConnectionState, PeripheralId};
use crate::transport::bridge::{BleTransport, CharacteristicRef, TransportError, WriteChannel};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Completion of a spawned native operation or timer
#[derive(Debug)]
pub enum LinkEvent {
    ConnectFinished {
        id: PeripheralId,
        generation: u64,
        result: Result<(), TransportError>,
    },
    SubscribeDelayElapsed {
        id: PeripheralId,
        generation: u64,
    },
    CharacteristicDiscovered {
        id: PeripheralId,
        generation: u64,
        result: Result<Option<CharacteristicRef>, TransportError>,
    },
    SubscribeFinished {
        id: PeripheralId,
        generation: u64,
        characteristic: CharacteristicRef,
        result: Result<(), TransportError>,
    },
}

impl LinkEvent {
    fn target(&self) -> (&PeripheralId, u64) {
        match self {
            LinkEvent::ConnectFinished { id, generation, .. }
            | LinkEvent::SubscribeDelayElapsed { id, generation }
            | LinkEvent::CharacteristicDiscovered { id, generation, .. }
            | LinkEvent::SubscribeFinished { id, generation, .. } => (id, *generation),
        }
    }
}

/// State changes the business layer reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTransition {
    Subscribed(PeripheralId),
    Disconnected(PeripheralId),
}

#[derive(Debug, Default)]
struct PeripheralConnection {
    state: ConnectionState,
    generation: u64,
    characteristic: Option<CharacteristicRef>,
    /// Present iff Subscribed
    write_channel: Option<WriteChannel>,
    /// Debounce timer and heartbeat
    timers: Vec<AbortHandle>,
}

impl PeripheralConnection {
    fn cancel_timers(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
    }
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    transport: Arc<dyn BleTransport>,
    links: HashMap<PeripheralId, PeripheralConnection>,
    /// Tracked ids in roster order
    order: Vec<PeripheralId>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    scanning: bool,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        ids: impl IntoIterator<Item = PeripheralId>,
        transport: Arc<dyn BleTransport>,
        link_tx: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        let order: Vec<PeripheralId> = ids.into_iter().collect();
        let links = order
            .iter()
            .map(|id| (id.clone(), PeripheralConnection::default()))
            .collect();

        Self {
            config,
            transport,
            links,
            order,
            link_tx,
            scanning: false,
        }
    }

    /// Begin discovery
    pub fn start(&mut self) {
        info!("Starting discovery for {} peripheral(s)", self.order.len());
        self.update_scanning();
    }

    pub fn state(&self, id: &PeripheralId) -> ConnectionState {
        self.links
            .get(id)
            .map(|link| link.state)
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, id: &PeripheralId) -> bool {
        self.state(id) == ConnectionState::Subscribed
    }

    pub fn generation(&self, id: &PeripheralId) -> Option<u64> {
        self.links.get(id).map(|link| link.generation)
    }

    /// Every tracked id with its current state, in roster order
    pub fn states(&self) -> Vec<(PeripheralId, ConnectionState)> {
        self.order
            .iter()
            .map(|id| (id.clone(), self.state(id)))
            .collect()
    }

    pub fn write_channel(&self, id: &PeripheralId) -> Option<WriteChannel> {
        self.links.get(id).and_then(|link| link.write_channel.clone())
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// An advertisement from `id` was seen
    pub fn on_discovered(&mut self, id: &PeripheralId) -> Option<LinkTransition> {
        let Some(link) = self.links.get(id) else {
            trace!("Ignoring advertisement from untracked {}", id);
            return None;
        };

        let mut transition = None;
        if link.state.is_active() {
            warn!("[{}] Discovered while {}; resetting link", id, link.state);
            transition = self.disconnect(id);
        }

        self.connect(id);
        transition
    }

    /// Issue the native connect for `id`
    pub fn connect(&mut self, id: &PeripheralId) {
        let Some(link) = self.links.get_mut(id) else {
            return;
        };

        link.cancel_timers();
        link.generation += 1;
        link.state = ConnectionState::Connecting;
        link.characteristic = None;
        link.write_channel = None;
        let generation = link.generation;

        info!("[{}] Connecting", id);
        self.update_scanning();

        let transport = self.transport.clone();
        let tx = self.link_tx.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let result = transport.connect(&id).await;
            let _ = tx.send(LinkEvent::ConnectFinished {
                id,
                generation,
                result,
            });
        });
    }

    /// Explicit disconnect: tear the native link down and reset
    pub fn disconnect(&mut self, id: &PeripheralId) -> Option<LinkTransition> {
        if !self.state(id).is_active() {
            return None;
        }

        let transport = self.transport.clone();
        let target = id.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.disconnect(&target).await {
                debug!("[{}] Native disconnect failed: {}", target, e);
            }
        });

        self.reset(id)
    }

    /// The platform reported link loss
    pub fn on_link_lost(&mut self, id: &PeripheralId) -> Option<LinkTransition> {
        if !self.state(id).is_active() {
            trace!("[{}] Link loss reported while already disconnected", id);
            return None;
        }
        warn!("[{}] Link lost", id);
        self.reset(id)
    }

    /// Disconnect everything (process shutdown)
    pub fn shutdown(&mut self) -> Vec<LinkTransition> {
        let ids = self.order.clone();
        let transitions = ids.iter().filter_map(|id| self.disconnect(id)).collect();
        self.set_scanning(false);
        transitions
    }

    /// Apply a spawned completion. Stale completions are dropped.
    pub fn handle_link_event(&mut self, event: LinkEvent) -> Option<LinkTransition> {
        let (id, generation) = event.target();
        let current = self.generation(id)?;
        if current != generation {
            debug!(
                "[{}] Dropping stale completion (generation {} != {})",
                id, generation, current
            );
            return None;
        }

        match event {
            LinkEvent::ConnectFinished { id, result, .. } => self.on_connect_finished(&id, result),
            LinkEvent::SubscribeDelayElapsed { id, .. } => {
                self.on_subscribe_delay_elapsed(&id);
                None
            }
            LinkEvent::CharacteristicDiscovered { id, result, .. } => {
                self.on_characteristic_discovered(&id, result)
            }
            LinkEvent::SubscribeFinished {
                id,
                characteristic,
                result,
                ..
            } => self.on_subscribe_finished(&id, characteristic, result),
        }
    }

    fn on_connect_finished(
        &mut self,
        id: &PeripheralId,
        result: Result<(), TransportError>,
    ) -> Option<LinkTransition> {
        if let Err(e) = result {
            warn!("[{}] {}", id, e);
            return self.disconnect(id);
        }

        let delay = self.config.subscription_delay();
        let tx = self.link_tx.clone();
        let link = self.links.get_mut(id)?;
        if link.state != ConnectionState::Connecting {
            return None;
        }

        debug!("[{}] Connected; subscribing in {:?}", id, delay);
        let generation = link.generation;
        let target = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(LinkEvent::SubscribeDelayElapsed {
                id: target,
                generation,
            });
        });
        link.timers.push(timer.abort_handle());
        None
    }

    fn on_subscribe_delay_elapsed(&mut self, id: &PeripheralId) {
        let Some(link) = self.links.get_mut(id) else {
            return;
        };
        if link.state != ConnectionState::Connecting {
            return;
        }
        link.state = ConnectionState::Subscribing;
        let generation = link.generation;

        debug!("[{}] Discovering services", id);
        let transport = self.transport.clone();
        let tx = self.link_tx.clone();
        let service_uuid = self.config.service_uuid;
        let characteristic_uuid = self.config.characteristic_uuid;
        let id = id.clone();
        tokio::spawn(async move {
            let result = transport
                .discover_characteristic(&id, service_uuid, characteristic_uuid)
                .await;
            let _ = tx.send(LinkEvent::CharacteristicDiscovered {
                id,
                generation,
                result,
            });
        });
    }

    fn on_characteristic_discovered(
        &mut self,
        id: &PeripheralId,
        result: Result<Option<CharacteristicRef>, TransportError>,
    ) -> Option<LinkTransition> {
        let characteristic = match result {
            Ok(Some(characteristic)) => characteristic,
            Ok(None) => {
                warn!(
                    "[{}] Characteristic {} not found",
                    id, self.config.characteristic_uuid
                );
                return self.disconnect(id);
            }
            Err(e) => {
                warn!("[{}] {}", id, e);
                return self.disconnect(id);
            }
        };

        let link = self.links.get_mut(id)?;
        if link.state != ConnectionState::Subscribing {
            return None;
        }
        link.characteristic = Some(characteristic);
        let generation = link.generation;

        let transport = self.transport.clone();
        let tx = self.link_tx.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let result = transport.subscribe(&id, &characteristic).await;
            let _ = tx.send(LinkEvent::SubscribeFinished {
                id,
                generation,
                characteristic,
                result,
            });
        });
        None
    }

    fn on_subscribe_finished(
        &mut self,
        id: &PeripheralId,
        characteristic: CharacteristicRef,
        result: Result<(), TransportError>,
    ) -> Option<LinkTransition> {
        if let Err(e) = result {
            warn!("[{}] {}", id, e);
            return self.disconnect(id);
        }

        let channel = WriteChannel::new(id.clone(), characteristic, self.transport.clone());
        let heartbeat = self.spawn_heartbeat(channel.clone());

        let link = self.links.get_mut(id)?;
        if link.state != ConnectionState::Subscribing {
            heartbeat.abort();
            return None;
        }
        link.state = ConnectionState::Subscribed;
        link.write_channel = Some(channel);
        link.timers.push(heartbeat);

        info!("[{}] Subscribed", id);
        self.update_scanning();
        Some(LinkTransition::Subscribed(id.clone()))
    }

    fn spawn_heartbeat(&self, channel: WriteChannel) -> AbortHandle {
        let period = self.config.heartbeat_interval();
        let payload = self.config.heartbeat_payload.clone().into_bytes();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if let Err(e) = channel.write(&payload).await {
                    warn!("[{}] Heartbeat failed: {}", channel.peripheral(), e);
                }
            }
        })
        .abort_handle()
    }

    fn reset(&mut self, id: &PeripheralId) -> Option<LinkTransition> {
        let link = self.links.get_mut(id)?;
        let was_active = link.state.is_active();

        link.cancel_timers();
        link.generation += 1;
        link.state = ConnectionState::Disconnected;
        link.characteristic = None;
        link.write_channel = None;

        if was_active {
            info!("[{}] Disconnected", id);
        }
        self.update_scanning();
        was_active.then(|| LinkTransition::Disconnected(id.clone()))
    }

    /// Scan unless a negotiation is in progress or every target is subscribed
    fn update_scanning(&mut self) {
        let negotiating = self.links.values().any(|link| {
            matches!(
                link.state,
                ConnectionState::Connecting | ConnectionState::Subscribing
            )
        });
        let all_subscribed = self
            .links
            .values()
            .all(|link| link.state == ConnectionState::Subscribed);

        self.set_scanning(!negotiating && !all_subscribed);
    }

    fn set_scanning(&mut self, enabled: bool) {
        if self.scanning == enabled {
            return;
        }
        self.scanning = enabled;

        let transport = self.transport.clone();
        tokio::spawn(async move {
            let result = if enabled {
                transport.start_scan().await
            } else {
                transport.stop_scan().await
            };
            if let Err(e) = result {
                warn!("Scan control failed: {}", e);
            }
        });
        debug!("Scanning {}", if enabled { "resumed" } else { "paused" });
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for link in self.links.values_mut() {
            link.cancel_timers();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::bridge::mock::{Call, MockBleTransport};
    use std::time::Duration;

    fn setup(ids: &[&str]) -> (
        ConnectionManager,
        mpsc::UnboundedReceiver<LinkEvent>,
        Arc<MockBleTransport>,
    ) {
        let transport = Arc::new(MockBleTransport::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(
            ConnectionConfig::default(),
            ids.iter().map(|id| PeripheralId::new(*id)),
            transport.clone(),
            tx,
        );
        (manager, rx, transport)
    }

    /// Feed completions back until a transition comes out
    async fn drive(
        manager: &mut ConnectionManager,
        rx: &mut mpsc::UnboundedReceiver<LinkEvent>,
    ) -> LinkTransition {
        loop {
            let event = rx.recv().await.expect("link channel open");
            if let Some(transition) = manager.handle_link_event(event) {
                return transition;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_to_subscribed() {
        let (mut manager, mut rx, transport) = setup(&["aa:01"]);
        let id = PeripheralId::new("aa:01");
        manager.start();

        assert!(manager.on_discovered(&id).is_none());
        assert_eq!(manager.state(&id), ConnectionState::Connecting);
        assert!(manager.write_channel(&id).is_none());

        let transition = drive(&mut manager, &mut rx).await;
        assert_eq!(transition, LinkTransition::Subscribed(id.clone()));
        assert_eq!(manager.state(&id), ConnectionState::Subscribed);
        assert!(manager.write_channel(&id).is_some());

        let calls = transport.calls();
        assert!(calls.contains(&Call::Connect(id.clone())));
        assert!(calls.contains(&Call::Discover(id.clone())));
        assert!(calls.contains(&Call::Subscribe(id.clone())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_clears_write_channel() {
        let (mut manager, mut rx, _transport) = setup(&["aa:01"]);
        let id = PeripheralId::new("aa:01");
        manager.on_discovered(&id);
        drive(&mut manager, &mut rx).await;

        let transition = manager.disconnect(&id);
        assert_eq!(transition, Some(LinkTransition::Disconnected(id.clone())));
        assert_eq!(manager.state(&id), ConnectionState::Disconnected);
        assert!(manager.write_channel(&id).is_none());

        // Second disconnect is a no-op
        assert!(manager.disconnect(&id).is_none());
        assert!(manager.on_link_lost(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_completion_is_dropped() {
        let (mut manager, mut rx, _transport) = setup(&["aa:01"]);
        let id = PeripheralId::new("aa:01");
        manager.on_discovered(&id);

        let connect_done = rx.recv().await.expect("connect completion");
        assert_eq!(
            manager.on_link_lost(&id),
            Some(LinkTransition::Disconnected(id.clone()))
        );

        assert!(manager.handle_link_event(connect_done).is_none());
        assert_eq!(manager.state(&id), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_timer_cancelled_on_disconnect() {
        let (mut manager, mut rx, transport) = setup(&["aa:01"]);
        let id = PeripheralId::new("aa:01");
        manager.on_discovered(&id);

        let connect_done = rx.recv().await.expect("connect completion");
        assert!(manager.handle_link_event(connect_done).is_none());
        manager.disconnect(&id);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
        assert!(!transport.calls().contains(&Call::Discover(id.clone())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_lost_before_subscribe_delay_fires() {
        let (mut manager, mut rx, transport) = setup(&["aa:01"]);
        let id = PeripheralId::new("aa:01");
        manager.start();
        manager.on_discovered(&id);

        let connect_done = rx.recv().await.expect("connect completion");
        assert!(manager.handle_link_event(connect_done).is_none());
        let delay_elapsed = rx.recv().await.expect("subscribe delay");
        assert!(matches!(delay_elapsed, LinkEvent::SubscribeDelayElapsed { .. }));
        assert!(!manager.is_scanning());

        assert_eq!(
            manager.on_link_lost(&id),
            Some(LinkTransition::Disconnected(id.clone()))
        );
        assert!(manager.is_scanning());

        assert!(manager.handle_link_event(delay_elapsed).is_none());
        assert_eq!(manager.state(&id), ConnectionState::Disconnected);
        tokio::task::yield_now().await;
        assert!(!transport.calls().contains(&Call::Discover(id.clone())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_lost_while_subscribing() {
        let (mut manager, mut rx, transport) = setup(&["aa:01"]);
        let id = PeripheralId::new("aa:01");
        manager.start();
        manager.on_discovered(&id);

        let connect_done = rx.recv().await.expect("connect completion");
        assert!(manager.handle_link_event(connect_done).is_none());
        let delay_elapsed = rx.recv().await.expect("subscribe delay");
        assert!(manager.handle_link_event(delay_elapsed).is_none());
        assert_eq!(manager.state(&id), ConnectionState::Subscribing);

        manager.on_link_lost(&id);
        assert!(manager.is_scanning());

        let discovered = rx.recv().await.expect("discovery completion");
        assert!(manager.handle_link_event(discovered).is_none());
        assert_eq!(manager.state(&id), ConnectionState::Disconnected);
        assert!(manager.write_channel(&id).is_none());
        assert!(!transport.calls().contains(&Call::Subscribe(id.clone())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_resets() {
        let (mut manager, mut rx, transport) = setup(&["aa:01"]);
        let id = PeripheralId::new("aa:01");
        transport.fail_connect(&id);

        manager.on_discovered(&id);
        let transition = drive(&mut manager, &mut rx).await;
        assert_eq!(transition, LinkTransition::Disconnected(id.clone()));
        assert_eq!(manager.state(&id), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_characteristic_resets() {
        let (mut manager, mut rx, transport) = setup(&["aa:01"]);
        let id = PeripheralId::new("aa:01");
        transport.hide_characteristic(&id);

        manager.on_discovered(&id);
        let transition = drive(&mut manager, &mut rx).await;
        assert_eq!(transition, LinkTransition::Disconnected(id.clone()));
        assert!(!transport.calls().contains(&Call::Subscribe(id.clone())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_discovery_forces_reset() {
        let (mut manager, mut rx, _transport) = setup(&["aa:01"]);
        let id = PeripheralId::new("aa:01");
        manager.on_discovered(&id);
        drive(&mut manager, &mut rx).await;
        let before = manager.generation(&id).expect("tracked");

        let transition = manager.on_discovered(&id);
        assert_eq!(transition, Some(LinkTransition::Disconnected(id.clone())));
        assert_eq!(manager.state(&id), ConnectionState::Connecting);
        assert!(manager.generation(&id).expect("tracked") > before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_untracked_discovery_ignored() {
        let (mut manager, _rx, transport) = setup(&["aa:01"]);
        assert!(manager.on_discovered(&PeripheralId::new("ff:ff")).is_none());
        tokio::task::yield_now().await;
        assert!(!transport
            .calls()
            .iter()
            .any(|call| matches!(call, Call::Connect(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scanning_paused_while_connecting() {
        let (mut manager, mut rx, _transport) = setup(&["aa:01", "aa:02"]);
        let first = PeripheralId::new("aa:01");
        manager.start();
        assert!(manager.is_scanning());

        manager.on_discovered(&first);
        assert!(!manager.is_scanning());

        drive(&mut manager, &mut rx).await;
        // One target is still missing
        assert!(manager.is_scanning());

        let second = PeripheralId::new("aa:02");
        manager.on_discovered(&second);
        drive(&mut manager, &mut rx).await;
        assert!(!manager.is_scanning());

        manager.on_link_lost(&second);
        assert!(manager.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_writes_until_disconnect() {
        let (mut manager, mut rx, transport) = setup(&["aa:01"]);
        let id = PeripheralId::new("aa:01");
        manager.on_discovered(&id);
        drive(&mut manager, &mut rx).await;

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let beats = transport.writes_to(&id);
        assert!(beats.len() >= 2);
        assert!(beats.iter().all(|payload| payload == "<hb>;"));

        manager.disconnect(&id);
        let count = transport.writes_to(&id).len();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(transport.writes_to(&id).len(), count);
    }
}
