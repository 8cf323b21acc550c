//! Protocol engine
//!
//! Owns the stream buffers, the outbox and the correlation table. A drain
//! pass walks a peripheral's history once, parses every newly completed
//! message and hands it to the role handler for that peripheral. Business
//! operations shared by handlers and the control surface live on
//! `EngineContext`.

use crate::config::{GatewayConfig, Secrets};
use crate::peripheral::{PeripheralId, PeripheralRole, PeripheralRoster};
use crate::protocol::buffer::{ProcessState, StreamBuffer};
use crate::protocol::correlation::{PendingCommands, ResponseFuture, STATUS, TOGGLE_LOCK};
use crate::protocol::frame::Frame;
use crate::protocol::handlers::HandlerSet;
use crate::store::keys::KeyStore;
use crate::store::outbox::Outbox;
use crate::store::settings::{descriptor, SettingsStore};
use crate::transport::ConnectionManager;
use crate::GatewayError;
use thiserror::Error;
use tracing::{debug, info, warn};

/// A well-formed frame the handler could not act on
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("<{tag}> requires a value")]
    MissingValue { tag: String },
    #[error("<{tag}> has unusable value {value:?}")]
    InvalidValue { tag: String, value: String },
    #[error("peripheral {0} is not subscribed")]
    PeripheralUnavailable(String),
    #[error("no handler for {0} peripherals")]
    NoHandler(PeripheralRole),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Link state as seen by the business layer
pub trait LinkStatus {
    fn is_subscribed(&self, id: &PeripheralId) -> bool;
}

impl LinkStatus for ConnectionManager {
    fn is_subscribed(&self, id: &PeripheralId) -> bool {
        ConnectionManager::is_subscribed(self, id)
    }
}

/// Follow-up work the reactor performs after a dispatch
#[derive(Debug)]
pub enum EngineEffect {
    /// Every setting was queued for this lock; its initial sync is moot
    SettingsPushed(PeripheralId),
    /// A card-triggered toggle; the outcome is only logged
    AwaitResponse {
        peripheral: PeripheralId,
        response: ResponseFuture,
    },
}

/// Result of one drain pass
#[derive(Debug, Default)]
pub struct DrainOutcome {
    /// Frames handed to a handler
    pub dispatched: usize,
    /// Entries marked Failed
    pub failed: usize,
    pub effects: Vec<EngineEffect>,
}

/// Everything a business operation may touch
pub struct EngineContext<'a> {
    peripheral: &'a PeripheralId,
    roster: &'a PeripheralRoster,
    outbox: &'a mut Outbox,
    pending: &'a mut PendingCommands,
    settings: &'a SettingsStore,
    keys: &'a KeyStore,
    links: &'a dyn LinkStatus,
    secrets: &'a Secrets,
    effects: &'a mut Vec<EngineEffect>,
}

impl<'a> EngineContext<'a> {
    /// The peripheral whose frame is being handled
    pub fn peripheral(&self) -> &PeripheralId {
        self.peripheral
    }

    pub fn keys(&self) -> &KeyStore {
        self.keys
    }

    pub fn settings(&self) -> &SettingsStore {
        self.settings
    }

    pub fn is_subscribed(&self, id: &PeripheralId) -> bool {
        self.links.is_subscribed(id)
    }

    /// The roster id for `role`
    pub fn role_id(&self, role: PeripheralRole) -> Result<PeripheralId, GatewayError> {
        self.roster
            .id_of(role)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownPeripheral(role.to_string()))
    }

    pub fn emit(&mut self, effect: EngineEffect) {
        self.effects.push(effect);
    }

    /// Queue `<tag>payload` for `id`
    pub fn send(&mut self, id: &PeripheralId, tag: &str, payload: &str) -> Result<(), GatewayError> {
        if !self.roster.contains(id) {
            return Err(GatewayError::UnknownPeripheral(id.to_string()));
        }
        self.outbox.enqueue(id, tag, payload)
    }

    /// Deliver a device reply to whoever is waiting on it
    pub fn resolve(&mut self, id: &PeripheralId, tag: &str, value: i64) -> bool {
        self.pending.resolve(id, tag, value)
    }

    fn request(
        &mut self,
        id: &PeripheralId,
        resolve_tag: &str,
        send_tag: &str,
        payload: &str,
    ) -> Result<ResponseFuture, GatewayError> {
        let response = self.pending.register(id, resolve_tag);
        if let Err(e) = self.send(id, send_tag, payload) {
            self.pending.cancel(id, resolve_tag);
            return Err(e);
        }
        Ok(response)
    }

    /// Send the secret to the lock and `auth` to the reader. Resolves with
    /// the lock's next `status`.
    pub fn toggle_lock(&mut self) -> Result<ResponseFuture, GatewayError> {
        let lock = self.role_id(PeripheralRole::Lock)?;
        let secret = self.secrets.lock_secret.clone();
        let response = self.request(&lock, TOGGLE_LOCK, "lock", &secret)?;

        if let Some(reader) = self.roster.id_of(PeripheralRole::Rfid).cloned() {
            if let Err(e) = self.send(&reader, "auth", "") {
                warn!("[{}] Could not queue <auth>: {}", reader, e);
            }
        }
        Ok(response)
    }

    pub fn request_lock_status(&mut self) -> Result<ResponseFuture, GatewayError> {
        let lock = self.role_id(PeripheralRole::Lock)?;
        self.request(&lock, STATUS, "status", "")
    }

    /// Ask the lock for one setting; the echo `<tag>value` resolves it
    pub fn request_lock_setting(&mut self, tag: &str) -> Result<ResponseFuture, GatewayError> {
        let lock = self.role_id(PeripheralRole::Lock)?;
        self.request(&lock, tag, &format!("get_{}", tag), "")
    }

    /// Queue every stored setting for `lock`, in catalogue order
    pub fn push_settings(&mut self, lock: &PeripheralId) -> Result<usize, GatewayError> {
        let entries = self.settings.get_settings_map()?;
        for entry in &entries {
            self.send(lock, &entry.tag, &entry.value.to_string())?;
        }
        self.emit(EngineEffect::SettingsPushed(lock.clone()));
        Ok(entries.len())
    }

    /// Push settings to a peripheral. Without a target the lock is used.
    ///
    /// - reader: queues `<init>`
    /// - lock, no name: every setting
    /// - lock, name and value: stores the value, then sends it
    /// - lock, name only: sends the stored value
    pub fn send_peripheral_settings(
        &mut self,
        target: Option<&PeripheralId>,
        name: Option<&str>,
        value: Option<i64>,
    ) -> Result<usize, GatewayError> {
        let target = match target {
            Some(id) => id.clone(),
            None => self.role_id(PeripheralRole::Lock)?,
        };
        let role = self
            .roster
            .role_of(&target)
            .ok_or_else(|| GatewayError::UnknownPeripheral(target.to_string()))?;

        match role {
            PeripheralRole::Rfid => {
                self.send(&target, "init", "")?;
                Ok(1)
            }
            PeripheralRole::Lock => {
                let Some(name) = name else {
                    return self.push_settings(&target);
                };
                let entry =
                    descriptor(name).ok_or_else(|| GatewayError::UnknownSetting(name.to_string()))?;
                let value = match value {
                    Some(value) if value < 0 => {
                        return Err(GatewayError::InvalidInput(format!(
                            "{} must not be negative",
                            name
                        )))
                    }
                    Some(value) => {
                        self.settings.save_setting(name, value)?;
                        value
                    }
                    None => self.settings.get_setting_value(name)?,
                };
                self.send(&target, entry.tag, &value.to_string())?;
                Ok(1)
            }
            PeripheralRole::Test => Err(GatewayError::InvalidInput(format!(
                "{} has no settings",
                target
            ))),
        }
    }
}

pub struct ProtocolEngine {
    roster: PeripheralRoster,
    handlers: HandlerSet,
    buffer: StreamBuffer,
    outbox: Outbox,
    pending: PendingCommands,
    settings: SettingsStore,
    keys: KeyStore,
    secrets: Secrets,
}

impl ProtocolEngine {
    pub fn new(
        config: &GatewayConfig,
        roster: PeripheralRoster,
        handlers: HandlerSet,
        settings: SettingsStore,
        keys: KeyStore,
        secrets: Secrets,
    ) -> Self {
        Self {
            roster,
            handlers,
            buffer: StreamBuffer::new(config.engine.history_limit),
            outbox: Outbox::new(config.outbox.clone()),
            pending: PendingCommands::new(config.engine.response_timeout()),
            settings,
            keys,
            secrets,
        }
    }

    pub fn roster(&self) -> &PeripheralRoster {
        &self.roster
    }

    pub fn buffer(&self) -> &StreamBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut StreamBuffer {
        &mut self.buffer
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn outbox_mut(&mut self) -> &mut Outbox {
        &mut self.outbox
    }

    pub fn pending(&self) -> &PendingCommands {
        &self.pending
    }

    /// Feed a notification payload into the peripheral's buffer
    pub fn ingest(&mut self, id: &PeripheralId, chunk: &[u8]) -> usize {
        self.buffer.append(id, chunk)
    }

    /// Link to `id` dropped: forget its partial input and pending replies
    pub fn on_disconnected(&mut self, id: &PeripheralId) {
        self.buffer.clear(id);
        let cancelled = self.pending.cancel_peripheral(id);
        if cancelled > 0 {
            info!("[{}] Cancelled {} pending request(s)", id, cancelled);
        }
        let queued = self.outbox.len(id);
        if queued > 0 {
            debug!("[{}] {} command(s) stay queued until reconnect", id, queued);
        }
    }

    /// Context for a control-surface operation
    pub fn context<'a>(
        &'a mut self,
        peripheral: &'a PeripheralId,
        links: &'a dyn LinkStatus,
        effects: &'a mut Vec<EngineEffect>,
    ) -> EngineContext<'a> {
        EngineContext {
            peripheral,
            roster: &self.roster,
            outbox: &mut self.outbox,
            pending: &mut self.pending,
            settings: &self.settings,
            keys: &self.keys,
            links,
            secrets: &self.secrets,
            effects,
        }
    }

    /// Process every newly completed message for `id`, oldest first.
    ///
    /// Stops at the unterminated tail. Entries already Processed or Failed
    /// are never dispatched again.
    pub fn drain(&mut self, id: &PeripheralId, links: &dyn LinkStatus) -> DrainOutcome {
        let mut outcome = DrainOutcome::default();
        let Some(role) = self.roster.role_of(id) else {
            return outcome;
        };

        let len = self.buffer.history(id).len();
        for index in 0..len {
            let Some(message) = self.buffer.entry_mut(id, index) else {
                break;
            };
            if message.process_state != ProcessState::Unprocessed {
                continue;
            }
            message.process_state = ProcessState::Processing;
            if !message.is_complete() {
                message.process_state = ProcessState::Unprocessed;
                break;
            }
            let raw = message.raw_text.clone();
            let sequence_id = message.sequence_id;

            let state = match Frame::parse(&raw) {
                Ok(frame) => {
                    outcome.dispatched += 1;
                    match self.dispatch(id, role, &frame, links, &mut outcome.effects) {
                        Ok(()) => ProcessState::Processed,
                        Err(e) => {
                            warn!("[{}] {} not handled: {}", id, frame, e);
                            ProcessState::Failed
                        }
                    }
                }
                Err(e) => {
                    warn!("[{}] Malformed message #{} {:?}: {}", id, sequence_id, raw, e);
                    ProcessState::Failed
                }
            };
            if state == ProcessState::Failed {
                outcome.failed += 1;
            }

            if let Some(message) = self.buffer.entry_mut(id, index) {
                message.process_state = state;
            }
        }

        if outcome.dispatched > 0 {
            debug!("[{}] Drained {} message(s)", id, outcome.dispatched);
        }
        outcome
    }

    fn dispatch(
        &mut self,
        id: &PeripheralId,
        role: PeripheralRole,
        frame: &Frame,
        links: &dyn LinkStatus,
        effects: &mut Vec<EngineEffect>,
    ) -> Result<(), DispatchError> {
        let handler = self.handlers.get(role).ok_or(DispatchError::NoHandler(role))?;
        let mut ctx = EngineContext {
            peripheral: id,
            roster: &self.roster,
            outbox: &mut self.outbox,
            pending: &mut self.pending,
            settings: &self.settings,
            keys: &self.keys,
            links,
            secrets: &self.secrets,
            effects,
        };
        handler.handle(frame, &mut ctx)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::backend::{MemoryStorage, StorageBackend};
    use std::collections::HashSet;
    use std::sync::Arc;

    pub(crate) struct FakeLinks(pub HashSet<PeripheralId>);

    impl LinkStatus for FakeLinks {
        fn is_subscribed(&self, id: &PeripheralId) -> bool {
            self.0.contains(id)
        }
    }

    fn rfid() -> PeripheralId {
        PeripheralId::new("aa:00:00:00:00:01")
    }

    fn lock() -> PeripheralId {
        PeripheralId::new("aa:00:00:00:00:02")
    }

    fn all_up() -> FakeLinks {
        FakeLinks([rfid(), lock()].into_iter().collect())
    }

    fn engine_with(handlers: HandlerSet, roster: PeripheralRoster) -> ProtocolEngine {
        let config = GatewayConfig::default();
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
        ProtocolEngine::new(
            &config,
            roster,
            handlers,
            SettingsStore::new(backend.clone(), Arc::new(config.clone())),
            KeyStore::new(backend),
            Secrets {
                lock_secret: "s3cret".to_string(),
                api_token: "token".to_string(),
            },
        )
    }

    fn engine() -> ProtocolEngine {
        engine_with(
            HandlerSet::standard(),
            PeripheralRoster::new()
                .with(rfid(), PeripheralRole::Rfid)
                .with(lock(), PeripheralRole::Lock),
        )
    }

    fn states(engine: &ProtocolEngine, id: &PeripheralId) -> Vec<ProcessState> {
        engine
            .buffer()
            .history(id)
            .iter()
            .map(|message| message.process_state)
            .collect()
    }

    #[tokio::test]
    async fn test_authorized_key_toggles_lock() {
        let mut engine = engine();
        engine.keys.add_key("aabbcc").expect("add key");

        engine.ingest(&rfid(), b"<key>aabbcc\r\n");
        let outcome = engine.drain(&rfid(), &all_up());

        assert_eq!(outcome.dispatched, 1);
        assert_eq!(engine.outbox().pending(&lock()), vec!["<lock>s3cret;"]);
        assert_eq!(engine.outbox().pending(&rfid()), vec!["<auth>;"]);
        assert!(matches!(
            outcome.effects.as_slice(),
            [EngineEffect::AwaitResponse { .. }]
        ));
        assert!(engine.pending().is_pending(&lock(), TOGGLE_LOCK));
    }

    #[tokio::test]
    async fn test_unknown_key_rejected() {
        let mut engine = engine();
        engine.ingest(&rfid(), b"<key>aabbcc\r\n");
        engine.drain(&rfid(), &all_up());

        assert_eq!(engine.outbox().pending(&rfid()), vec!["<unauth>;"]);
        assert!(engine.outbox().pending(&lock()).is_empty());
    }

    #[tokio::test]
    async fn test_key_uppercase_matches() {
        let mut engine = engine();
        engine.keys.add_key("aabbcc").expect("add key");
        engine.ingest(&rfid(), b"<key>AABBCC\r\n");
        engine.drain(&rfid(), &all_up());
        assert_eq!(engine.outbox().pending(&lock()), vec!["<lock>s3cret;"]);
    }

    #[tokio::test]
    async fn test_key_while_lock_offline_fails() {
        let mut engine = engine();
        engine.keys.add_key("aabbcc").expect("add key");
        engine.ingest(&rfid(), b"<key>aabbcc\r\n");

        let links = FakeLinks([rfid()].into_iter().collect());
        let outcome = engine.drain(&rfid(), &links);

        assert_eq!(outcome.failed, 1);
        assert_eq!(states(&engine, &rfid()), vec![ProcessState::Failed]);
        assert!(engine.outbox().pending(&lock()).is_empty());
        assert!(engine.outbox().pending(&rfid()).is_empty());
    }

    #[tokio::test]
    async fn test_mfrc_failed_reboots_reader() {
        let mut engine = engine();
        engine.ingest(&rfid(), b"<mfrc_ver>146\r\n<mfrc_failed>\r\n<req_rfid_data>\r\n");
        let outcome = engine.drain(&rfid(), &all_up());

        assert_eq!(outcome.dispatched, 3);
        assert_eq!(engine.outbox().pending(&rfid()), vec!["<reboot>;"]);
    }

    #[tokio::test]
    async fn test_req_lock_data_pushes_catalogue() {
        let mut engine = engine();
        engine.ingest(&lock(), b"<req_lock_data>\r\n");
        let outcome = engine.drain(&lock(), &all_up());

        assert_eq!(
            engine.outbox().pending(&lock()),
            vec![
                "<m_xlk>1800;",
                "<m_lk>1200;",
                "<m_idl>1500;",
                "<l_en>90;",
                "<l_xen>0;",
                "<l_step>5;",
                "<l_ms>15;",
                "<a_rdct>10;",
                "<a_lk>0;",
                "<a_xlk>90;",
                "<o_dbg>0;",
            ]
        );
        assert!(matches!(
            outcome.effects.as_slice(),
            [EngineEffect::SettingsPushed(id)] if *id == lock()
        ));
    }

    #[tokio::test]
    async fn test_status_resolves_toggle_and_query() {
        let mut engine = engine();
        let links = all_up();
        let mut effects = Vec::new();
        let origin = lock();
        let (toggle, status) = {
            let mut ctx = engine.context(&origin, &links, &mut effects);
            (
                ctx.toggle_lock().expect("toggle"),
                ctx.request_lock_status().expect("status"),
            )
        };

        engine.ingest(&lock(), b"<status>1\r\n");
        engine.drain(&lock(), &links);

        assert_eq!(toggle.wait().await, Ok(1));
        assert_eq!(status.wait().await, Ok(1));
        assert_eq!(
            engine.outbox().pending(&lock()),
            vec!["<lock>s3cret;", "<status>;"]
        );
    }

    #[tokio::test]
    async fn test_setting_echo_resolves_and_saves() {
        let mut engine = engine();
        let links = all_up();
        let mut effects = Vec::new();
        let origin = lock();
        let response = engine
            .context(&origin, &links, &mut effects)
            .request_lock_setting("m_lk")
            .expect("request");
        assert_eq!(engine.outbox().pending(&lock()), vec!["<get_m_lk>;"]);

        engine.ingest(&lock(), b"<m_lk>1250\r\n");
        engine.drain(&lock(), &links);

        assert_eq!(response.wait().await, Ok(1250));
        assert_eq!(
            engine.settings.get_setting_value("mainServoLockFrequency").expect("value"),
            1250
        );
    }

    #[tokio::test]
    async fn test_unsolicited_reply_is_not_an_error() {
        let mut engine = engine();
        engine.ingest(&lock(), b"<status>0\r\n<x_unknown>3\r\n");
        let outcome = engine.drain(&lock(), &all_up());
        assert_eq!(outcome.failed, 0);
        assert_eq!(
            states(&engine, &lock()),
            vec![ProcessState::Processed, ProcessState::Processed]
        );
    }

    #[tokio::test]
    async fn test_lock_value_must_be_integer() {
        let mut engine = engine();
        engine.ingest(&lock(), b"<status>open\r\n<m_lk>\r\n");
        let outcome = engine.drain(&lock(), &all_up());
        assert_eq!(outcome.failed, 2);
    }

    #[tokio::test]
    async fn test_drain_is_idempotent() {
        let mut engine = engine();
        engine.ingest(&rfid(), b"<mfrc_failed>\r\n");
        assert_eq!(engine.drain(&rfid(), &all_up()).dispatched, 1);
        assert_eq!(engine.drain(&rfid(), &all_up()).dispatched, 0);
        assert_eq!(engine.outbox().pending(&rfid()), vec!["<reboot>;"]);
    }

    #[tokio::test]
    async fn test_malformed_entry_does_not_block_later_ones() {
        let mut engine = engine();
        engine.ingest(&rfid(), b"garbage\r\n<mfrc_failed>\r\n");
        let outcome = engine.drain(&rfid(), &all_up());

        assert_eq!(outcome.failed, 1);
        assert_eq!(
            states(&engine, &rfid()),
            vec![ProcessState::Failed, ProcessState::Processed]
        );
    }

    #[tokio::test]
    async fn test_incomplete_tail_waits() {
        let mut engine = engine();
        engine.ingest(&rfid(), b"<mfrc_fai");
        assert_eq!(engine.drain(&rfid(), &all_up()).dispatched, 0);
        assert_eq!(states(&engine, &rfid()), vec![ProcessState::Unprocessed]);

        engine.ingest(&rfid(), b"led>\r\n");
        assert_eq!(engine.drain(&rfid(), &all_up()).dispatched, 1);
        assert_eq!(states(&engine, &rfid()), vec![ProcessState::Processed]);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending() {
        let mut engine = engine();
        let links = all_up();
        let mut effects = Vec::new();
        let origin = lock();
        let status = engine
            .context(&origin, &links, &mut effects)
            .request_lock_status()
            .expect("status");

        engine.ingest(&lock(), b"<sta");
        engine.on_disconnected(&lock());

        assert!(engine.buffer().history(&lock()).is_empty());
        assert!(matches!(status.wait().await, Err(GatewayError::Cancelled { .. })));
        // Queued commands wait for the next subscription
        assert_eq!(engine.outbox().len(&lock()), 1);
        assert_eq!(engine.outbox().pending(&lock()), vec!["<status>;"]);
    }

    #[tokio::test]
    async fn test_send_peripheral_settings_variants() {
        let mut engine = engine();
        let links = all_up();
        let mut effects = Vec::new();
        let origin = lock();
        let reader = rfid();
        {
            let mut ctx = engine.context(&origin, &links, &mut effects);
            assert_eq!(ctx.send_peripheral_settings(Some(&reader), None, None), Ok(1));
            assert_eq!(
                ctx.send_peripheral_settings(None, Some("linearServoStep"), Some(8)),
                Ok(1)
            );
            assert_eq!(
                ctx.send_peripheral_settings(None, Some("linearServoMs"), None),
                Ok(1)
            );
            assert!(matches!(
                ctx.send_peripheral_settings(None, Some("linearServoMs"), Some(-1)),
                Err(GatewayError::InvalidInput(_))
            ));
            assert!(matches!(
                ctx.send_peripheral_settings(None, Some("warp"), Some(1)),
                Err(GatewayError::UnknownSetting(_))
            ));
        }

        assert_eq!(engine.outbox().pending(&rfid()), vec!["<init>;"]);
        assert_eq!(
            engine.outbox().pending(&lock()),
            vec!["<l_step>8;", "<l_ms>15;"]
        );
        assert_eq!(
            engine.settings.get_setting_value("linearServoStep").expect("value"),
            8
        );
    }

    #[tokio::test]
    async fn test_test_mode_only_logs() {
        let bench = PeripheralId::new("cc:00");
        let mut engine = engine_with(
            HandlerSet::test_mode(),
            PeripheralRoster::new().with(bench.clone(), PeripheralRole::Test),
        );
        engine.ingest(&bench, b"<key>aabbcc\r\n<req_lock_data>\r\n");
        let links = FakeLinks([bench.clone()].into_iter().collect());
        let outcome = engine.drain(&bench, &links);

        assert_eq!(outcome.dispatched, 2);
        assert_eq!(outcome.failed, 0);
        assert!(engine.outbox().pending(&bench).is_empty());
    }

    #[tokio::test]
    async fn test_role_without_handler_fails_entry() {
        let mut engine = engine_with(
            HandlerSet::test_mode(),
            PeripheralRoster::new().with(lock(), PeripheralRole::Lock),
        );
        engine.ingest(&lock(), b"<status>1\r\n");
        assert_eq!(engine.drain(&lock(), &all_up()).failed, 1);
    }
}
