// Gateway: the reactor task and its control handle
//
// `Gateway::run` is the only place per-peripheral state is mutated. It
// selects over platform events, link completions, engine timers, write
// completions and control commands. `GatewayHandle` is the cloneable front
// door used by the control surface; device round-trips are awaited on the
// caller's side, never inside the reactor.

use crate::config::{GatewayConfig, Secrets};
use crate::peripheral::{ConnectionState, PeripheralId, PeripheralRole, PeripheralRoster};
use crate::protocol::{
    EngineContext, EngineEffect, HandlerSet, Message, ProtocolEngine, ResponseFuture, TERMINATOR,
};
use crate::store::settings::descriptor;
use crate::store::{
    KeyStore, LogEntry, OutboxEntry, PeripheralLog, SettingEntry, SettingsStore, StorageBackend,
    SETTINGS_CATALOGUE,
};
use crate::transport::{
    BleTransport, ConnectionManager, LinkEvent, LinkTransition, TransportError, TransportEvent,
};
use crate::{GatewayError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

/// Commands accepted by the reactor
pub enum GatewayCommand {
    ToggleLock {
        reply: mpsc::Sender<Result<ResponseFuture>>,
    },
    LockStatus {
        reply: mpsc::Sender<Result<ResponseFuture>>,
    },
    LockSetting {
        tag: String,
        reply: mpsc::Sender<Result<ResponseFuture>>,
    },
    SendPeripheralSettings {
        peripheral: Option<PeripheralId>,
        name: Option<String>,
        value: Option<i64>,
        reply: mpsc::Sender<Result<usize>>,
    },
    SendData {
        peripheral: PeripheralId,
        payload: String,
        reply: mpsc::Sender<Result<()>>,
    },
    Reboot {
        role: PeripheralRole,
        reply: mpsc::Sender<Result<()>>,
    },
    History {
        peripheral: PeripheralId,
        reply: mpsc::Sender<Result<Vec<Message>>>,
    },
    ConnectionStates {
        reply: mpsc::Sender<Vec<(PeripheralId, ConnectionState)>>,
    },
    Shutdown,
}

/// Timer fires and write completions posted back to the reactor
#[derive(Debug)]
enum EngineEvent {
    InitialSyncDue {
        id: PeripheralId,
        generation: u64,
    },
    WriteFinished {
        entry: OutboxEntry,
        result: std::result::Result<(), TransportError>,
    },
}

/// Handle to communicate with the running gateway task
#[derive(Clone)]
pub struct GatewayHandle {
    command_tx: mpsc::Sender<GatewayCommand>,
    keys: KeyStore,
    settings: SettingsStore,
    log: PeripheralLog,
}

impl GatewayHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(mpsc::Sender<T>) -> GatewayCommand,
    ) -> Result<T> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| GatewayError::NotRunning)?;

        reply_rx.recv().await.ok_or(GatewayError::NotRunning)
    }

    /// Toggle the lock and wait for its status
    pub async fn toggle_lock(&self) -> Result<i64> {
        self.request(|reply| GatewayCommand::ToggleLock { reply })
            .await??
            .wait()
            .await
    }

    pub async fn get_lock_status(&self) -> Result<i64> {
        self.request(|reply| GatewayCommand::LockStatus { reply })
            .await??
            .wait()
            .await
    }

    /// Read one setting from the lock itself
    pub async fn get_lock_setting(&self, name: &str) -> Result<i64> {
        let entry =
            descriptor(name).ok_or_else(|| GatewayError::UnknownSetting(name.to_string()))?;
        let tag = entry.tag.to_string();
        self.request(|reply| GatewayCommand::LockSetting { tag, reply })
            .await??
            .wait()
            .await
    }

    /// Read every setting from the lock concurrently, in catalogue order
    pub async fn get_all_lock_settings(&self) -> Result<Vec<SettingEntry>> {
        let requests = SETTINGS_CATALOGUE.iter().map(|entry| async move {
            let value = self.get_lock_setting(entry.name).await?;
            Ok::<_, GatewayError>(SettingEntry {
                name: entry.name.to_string(),
                tag: entry.tag.to_string(),
                value,
            })
        });
        futures::future::try_join_all(requests).await
    }

    /// Push settings; see `EngineContext::send_peripheral_settings`
    pub async fn send_peripheral_settings(
        &self,
        peripheral: Option<PeripheralId>,
        name: Option<String>,
        value: Option<i64>,
    ) -> Result<usize> {
        self.request(|reply| GatewayCommand::SendPeripheralSettings {
            peripheral,
            name,
            value,
            reply,
        })
        .await?
    }

    /// Queue `<data>payload` for a peripheral
    pub async fn send_data(&self, peripheral: PeripheralId, payload: String) -> Result<()> {
        self.request(|reply| GatewayCommand::SendData {
            peripheral,
            payload,
            reply,
        })
        .await?
    }

    pub async fn reboot_lock(&self) -> Result<()> {
        self.request(|reply| GatewayCommand::Reboot {
            role: PeripheralRole::Lock,
            reply,
        })
        .await?
    }

    pub async fn reboot_rfid(&self) -> Result<()> {
        self.request(|reply| GatewayCommand::Reboot {
            role: PeripheralRole::Rfid,
            reply,
        })
        .await?
    }

    pub async fn get_peripheral_history(&self, peripheral: PeripheralId) -> Result<Vec<Message>> {
        self.request(|reply| GatewayCommand::History { peripheral, reply })
            .await?
    }

    pub async fn connection_states(&self) -> Result<Vec<(PeripheralId, ConnectionState)>> {
        self.request(|reply| GatewayCommand::ConnectionStates { reply })
            .await
    }

    /// Persisted log, most recent first
    pub fn get_peripheral_log(&self, peripheral: &PeripheralId, limit: usize) -> Result<Vec<LogEntry>> {
        self.log.entries(peripheral, limit)
    }

    /// Stored setting values (no device round-trip)
    pub fn stored_settings(&self) -> Result<Vec<SettingEntry>> {
        self.settings.get_settings_map()
    }

    pub fn add_key(&self, key: &str) -> Result<String> {
        self.keys.add_key(key)
    }

    pub fn remove_key(&self, key: &str) -> Result<bool> {
        self.keys.remove_key(key)
    }

    pub fn get_keys(&self) -> Result<Vec<String>> {
        self.keys.get_keys()
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(GatewayCommand::Shutdown)
            .await
            .map_err(|_| GatewayError::NotRunning)
    }
}

/// The reactor: owns the connection manager, the protocol engine and the
/// persistent log
pub struct Gateway {
    config: Arc<GatewayConfig>,
    connections: ConnectionManager,
    engine: ProtocolEngine,
    log: PeripheralLog,
    storage: Arc<dyn StorageBackend>,
    transport_rx: mpsc::Receiver<TransportEvent>,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    engine_tx: mpsc::UnboundedSender<EngineEvent>,
    engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
    command_rx: mpsc::Receiver<GatewayCommand>,
    initial_sync: HashMap<PeripheralId, AbortHandle>,
    /// Identity used for operations that do not come from a peripheral
    control_origin: PeripheralId,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        roster: PeripheralRoster,
        handlers: HandlerSet,
        secrets: Secrets,
        storage: Arc<dyn StorageBackend>,
        transport: Arc<dyn BleTransport>,
        transport_rx: mpsc::Receiver<TransportEvent>,
    ) -> (Self, GatewayHandle) {
        let config = Arc::new(config);
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(64);

        let settings = SettingsStore::new(storage.clone(), config.clone());
        let keys = KeyStore::new(storage.clone());
        let log = PeripheralLog::new(storage.clone());

        let connections = ConnectionManager::new(
            config.connection.clone(),
            roster.ids().cloned().collect::<Vec<_>>(),
            transport,
            link_tx,
        );
        let engine = ProtocolEngine::new(
            &config,
            roster,
            handlers,
            settings.clone(),
            keys.clone(),
            secrets,
        );

        let handle = GatewayHandle {
            command_tx,
            keys,
            settings,
            log: log.clone(),
        };

        let gateway = Self {
            config,
            connections,
            engine,
            log,
            storage,
            transport_rx,
            link_rx,
            engine_tx,
            engine_rx,
            command_rx,
            initial_sync: HashMap::new(),
            control_origin: PeripheralId::new("control"),
        };
        (gateway, handle)
    }

    /// Run until shutdown or until the platform event stream closes
    pub async fn run(mut self) {
        info!(
            "Gateway running for {} peripheral(s)",
            self.engine.roster().len()
        );
        self.connections.start();

        let mut flush = tokio::time::interval(self.config.outbox.flush_interval());
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut log_flush = tokio::time::interval(self.config.engine.log_flush_interval());
        log_flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.transport_rx.recv() => match event {
                    Some(event) => self.on_transport_event(event),
                    None => {
                        warn!("Transport event stream closed");
                        break;
                    }
                },
                Some(event) = self.link_rx.recv() => {
                    if let Some(transition) = self.connections.handle_link_event(event) {
                        self.on_transition(transition);
                    }
                }
                Some(event) = self.engine_rx.recv() => self.on_engine_event(event),
                command = self.command_rx.recv() => match command {
                    Some(GatewayCommand::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                _ = flush.tick() => self.flush_outboxes(),
                _ = log_flush.tick() => self.flush_logs(),
            }
        }

        self.shutdown();
    }

    fn shutdown(&mut self) {
        info!("Gateway shutting down");
        self.flush_logs();
        for transition in self.connections.shutdown() {
            self.on_transition(transition);
        }
        for (_, timer) in self.initial_sync.drain() {
            timer.abort();
        }
        if let Err(e) = self.storage.flush() {
            error!("Storage flush failed: {}", e);
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        trace!("Transport event: {}", event);
        match event {
            TransportEvent::Discovered(id) => {
                if let Some(transition) = self.connections.on_discovered(&id) {
                    self.on_transition(transition);
                }
            }
            TransportEvent::Disconnected(id) => {
                if let Some(transition) = self.connections.on_link_lost(&id) {
                    self.on_transition(transition);
                }
            }
            TransportEvent::Notification { id, data } => {
                if !self.connections.is_subscribed(&id) {
                    debug!("[{}] Dropping {} byte(s) received while not subscribed", id, data.len());
                    return;
                }
                self.engine.ingest(&id, &data);
                let outcome = self.engine.drain(&id, &self.connections);
                self.apply_effects(outcome.effects);
            }
        }
    }

    fn on_transition(&mut self, transition: LinkTransition) {
        match transition {
            LinkTransition::Subscribed(id) => {
                self.schedule_initial_sync(&id);
                self.flush_peripheral(&id);
            }
            LinkTransition::Disconnected(id) => {
                self.flush_logs_for(&id);
                self.cancel_initial_sync(&id);
                self.engine.on_disconnected(&id);
            }
        }
    }

    fn schedule_initial_sync(&mut self, id: &PeripheralId) {
        match self.engine.roster().role_of(id) {
            Some(PeripheralRole::Lock) | Some(PeripheralRole::Rfid) => {}
            _ => return,
        }
        let Some(generation) = self.connections.generation(id) else {
            return;
        };

        self.cancel_initial_sync(id);
        let delay = self.config.lock.initial_sync_delay();
        let tx = self.engine_tx.clone();
        let target = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(EngineEvent::InitialSyncDue {
                id: target,
                generation,
            });
        });
        debug!("[{}] Initial sync in {:?}", id, delay);
        self.initial_sync.insert(id.clone(), timer.abort_handle());
    }

    fn cancel_initial_sync(&mut self, id: &PeripheralId) {
        if let Some(timer) = self.initial_sync.remove(id) {
            timer.abort();
        }
    }

    fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::InitialSyncDue { id, generation } => {
                if self.connections.generation(&id) != Some(generation)
                    || !self.connections.is_subscribed(&id)
                {
                    debug!("[{}] Dropping stale initial sync", id);
                    return;
                }
                self.initial_sync.remove(&id);
                info!("[{}] Initial sync", id);
                let target = id.clone();
                if let Err(e) =
                    self.with_context(|ctx| ctx.send_peripheral_settings(Some(&target), None, None))
                {
                    warn!("[{}] Initial sync failed: {}", id, e);
                }
            }
            EngineEvent::WriteFinished { entry, result } => {
                let delivered = match result {
                    Ok(()) => {
                        trace!("[{}] Wrote {}", entry.peripheral, entry.wire_text);
                        true
                    }
                    Err(e) => {
                        warn!("[{}] Write of {} failed: {}", entry.peripheral, entry.wire_text, e);
                        false
                    }
                };
                let id = entry.peripheral.clone();
                self.engine.outbox_mut().finish_flush(entry, delivered);
                if delivered {
                    self.flush_peripheral(&id);
                }
            }
        }
    }

    fn with_context<T>(&mut self, op: impl FnOnce(&mut EngineContext<'_>) -> T) -> T {
        let mut effects = Vec::new();
        let origin = self.control_origin.clone();
        let result = {
            let mut ctx = self.engine.context(&origin, &self.connections, &mut effects);
            op(&mut ctx)
        };
        self.apply_effects(effects);
        result
    }

    fn apply_effects(&mut self, effects: Vec<EngineEffect>) {
        for effect in effects {
            match effect {
                EngineEffect::SettingsPushed(id) => self.cancel_initial_sync(&id),
                EngineEffect::AwaitResponse {
                    peripheral,
                    response,
                } => {
                    tokio::spawn(async move {
                        match response.wait().await {
                            Ok(status) => info!("[{}] Lock toggled, status {}", peripheral, status),
                            Err(e) => warn!("[{}] Lock toggle: {}", peripheral, e),
                        }
                    });
                }
            }
        }
    }

    fn on_command(&mut self, command: GatewayCommand) {
        match command {
            GatewayCommand::ToggleLock { reply } => {
                let result = self.with_context(|ctx| ctx.toggle_lock());
                let _ = reply.try_send(result);
            }
            GatewayCommand::LockStatus { reply } => {
                let result = self.with_context(|ctx| ctx.request_lock_status());
                let _ = reply.try_send(result);
            }
            GatewayCommand::LockSetting { tag, reply } => {
                let result = self.with_context(|ctx| ctx.request_lock_setting(&tag));
                let _ = reply.try_send(result);
            }
            GatewayCommand::SendPeripheralSettings {
                peripheral,
                name,
                value,
                reply,
            } => {
                let result = self.with_context(|ctx| {
                    ctx.send_peripheral_settings(peripheral.as_ref(), name.as_deref(), value)
                });
                let _ = reply.try_send(result);
            }
            GatewayCommand::SendData {
                peripheral,
                payload,
                reply,
            } => {
                let result = self.with_context(|ctx| ctx.send(&peripheral, "data", &payload));
                let _ = reply.try_send(result);
            }
            GatewayCommand::Reboot { role, reply } => {
                let result = self.with_context(|ctx| {
                    let target = ctx.role_id(role)?;
                    ctx.send(&target, "reboot", "")
                });
                let _ = reply.try_send(result);
            }
            GatewayCommand::History { peripheral, reply } => {
                let result = if self.engine.roster().contains(&peripheral) {
                    Ok(self.engine.buffer().history(&peripheral).to_vec())
                } else {
                    Err(GatewayError::UnknownPeripheral(peripheral.to_string()))
                };
                let _ = reply.try_send(result);
            }
            GatewayCommand::ConnectionStates { reply } => {
                let _ = reply.try_send(self.connections.states());
            }
            GatewayCommand::Shutdown => {}
        }
    }

    fn flush_outboxes(&mut self) {
        let ids: Vec<PeripheralId> = self.engine.roster().ids().cloned().collect();
        for id in ids {
            self.flush_peripheral(&id);
        }
    }

    /// Start the next write for `id` if it is subscribed and idle
    fn flush_peripheral(&mut self, id: &PeripheralId) {
        if !self.connections.is_subscribed(id) {
            return;
        }
        let Some(channel) = self.connections.write_channel(id) else {
            return;
        };
        let Some(entry) = self.engine.outbox_mut().begin_flush(id) else {
            return;
        };

        let tx = self.engine_tx.clone();
        tokio::spawn(async move {
            let result = channel.write(entry.wire_text.as_bytes()).await;
            let _ = tx.send(EngineEvent::WriteFinished { entry, result });
        });
    }

    /// Append completed, unlogged messages to the persistent log
    fn flush_logs(&mut self) {
        let ids: Vec<PeripheralId> = self.engine.roster().ids().cloned().collect();
        for id in ids {
            self.flush_logs_for(&id);
        }
    }

    fn flush_logs_for(&mut self, id: &PeripheralId) {
        let unlogged = self.engine.buffer().unlogged(id);
        if unlogged.is_empty() {
            return;
        }

        let mut logged = Vec::with_capacity(unlogged.len());
        for message in &unlogged {
            let text = message.raw_text.trim_end_matches(TERMINATOR);
            match self.log.append(id, text) {
                Ok(_) => logged.push(message.sequence_id),
                Err(e) => {
                    error!("[{}] Log flush failed: {}", id, e);
                    break;
                }
            }
        }
        self.engine.buffer_mut().mark_logged(id, &logged);
    }
}
