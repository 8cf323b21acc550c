//! Per-role frame handlers
//!
//! The engine picks a handler by the sending peripheral's role. The standard
//! set drives the RFID reader and the lock; test mode swaps in a set that
//! only logs.

use crate::peripheral::PeripheralRole;
use crate::protocol::correlation::{STATUS, TOGGLE_LOCK};
use crate::protocol::engine::{DispatchError, EngineContext, EngineEffect};
use crate::protocol::frame::Frame;
use crate::store::keys::normalize_key;
use crate::store::settings::descriptor_for_tag;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Reacts to frames from one kind of peripheral
pub trait RoleHandler: Send + Sync {
    fn handle(&self, frame: &Frame, ctx: &mut EngineContext<'_>) -> Result<(), DispatchError>;
}

/// Handlers indexed by role
#[derive(Default)]
pub struct HandlerSet {
    handlers: HashMap<PeripheralRole, Box<dyn RoleHandler>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, role: PeripheralRole, handler: impl RoleHandler + 'static) -> Self {
        self.handlers.insert(role, Box::new(handler));
        self
    }

    /// Reader and lock
    pub fn standard() -> Self {
        Self::new()
            .with(PeripheralRole::Rfid, RfidHandler)
            .with(PeripheralRole::Lock, LockHandler)
    }

    /// Bench peripheral, logging only
    pub fn test_mode() -> Self {
        Self::new().with(PeripheralRole::Test, LoggingHandler)
    }

    pub fn get(&self, role: PeripheralRole) -> Option<&dyn RoleHandler> {
        self.handlers.get(&role).map(|handler| handler.as_ref())
    }
}

impl DispatchError {
    fn unusable_value(frame: &Frame) -> Self {
        match &frame.value {
            Some(value) => DispatchError::InvalidValue {
                tag: frame.tag.clone(),
                value: value.clone(),
            },
            None => DispatchError::MissingValue {
                tag: frame.tag.clone(),
            },
        }
    }
}

pub struct RfidHandler;

impl RfidHandler {
    fn on_key(&self, frame: &Frame, ctx: &mut EngineContext<'_>) -> Result<(), DispatchError> {
        let raw = frame.value.as_deref().ok_or_else(|| DispatchError::MissingValue {
            tag: frame.tag.clone(),
        })?;
        let key = normalize_key(raw).map_err(|_| DispatchError::InvalidValue {
            tag: frame.tag.clone(),
            value: raw.to_string(),
        })?;

        let reader = ctx.peripheral().clone();
        let lock = ctx.role_id(PeripheralRole::Lock)?;
        if !ctx.is_subscribed(&lock) {
            return Err(DispatchError::PeripheralUnavailable(lock.to_string()));
        }

        if ctx.keys().exists(&key)? {
            info!("[{}] Key {} authorized, toggling lock", reader, key);
            let response = ctx.toggle_lock()?;
            ctx.emit(EngineEffect::AwaitResponse {
                peripheral: lock,
                response,
            });
        } else {
            warn!("[{}] Key {} not authorized", reader, key);
            ctx.send(&reader, "unauth", "")?;
        }
        Ok(())
    }
}

impl RoleHandler for RfidHandler {
    fn handle(&self, frame: &Frame, ctx: &mut EngineContext<'_>) -> Result<(), DispatchError> {
        let reader = ctx.peripheral().clone();
        match frame.tag.as_str() {
            "req_rfid_data" => {
                debug!("[{}] Reader requested data", reader);
                Ok(())
            }
            "mfrc_ver" => {
                info!(
                    "[{}] MFRC522 version {}",
                    reader,
                    frame.value.as_deref().unwrap_or("unknown")
                );
                Ok(())
            }
            "mfrc_failed" => {
                warn!("[{}] MFRC522 self test failed, rebooting reader", reader);
                ctx.send(&reader, "reboot", "")?;
                Ok(())
            }
            "key" => self.on_key(frame, ctx),
            other => {
                debug!("[{}] Ignoring <{}>", reader, other);
                Ok(())
            }
        }
    }
}

pub struct LockHandler;

impl RoleHandler for LockHandler {
    fn handle(&self, frame: &Frame, ctx: &mut EngineContext<'_>) -> Result<(), DispatchError> {
        let lock = ctx.peripheral().clone();
        match frame.tag.as_str() {
            "req_lock_data" => {
                let pushed = ctx.push_settings(&lock)?;
                info!("[{}] Lock requested data, queued {} setting(s)", lock, pushed);
                Ok(())
            }
            "status" => {
                let status = frame
                    .int_value()
                    .ok_or_else(|| DispatchError::unusable_value(frame))?;
                let toggled = ctx.resolve(&lock, TOGGLE_LOCK, status);
                let queried = ctx.resolve(&lock, STATUS, status);
                if toggled || queried {
                    info!("[{}] Lock status {}", lock, status);
                } else {
                    debug!("[{}] Unsolicited lock status {}", lock, status);
                }
                Ok(())
            }
            tag => {
                let value = frame
                    .int_value()
                    .ok_or_else(|| DispatchError::unusable_value(frame))?;
                if let Some(entry) = descriptor_for_tag(tag) {
                    ctx.settings().save_setting(entry.name, value)?;
                }
                if !ctx.resolve(&lock, tag, value) {
                    debug!("[{}] No pending request for <{}> ({})", lock, tag, value);
                }
                Ok(())
            }
        }
    }
}

/// Logs every frame and does nothing else
pub struct LoggingHandler;

impl RoleHandler for LoggingHandler {
    fn handle(&self, frame: &Frame, ctx: &mut EngineContext<'_>) -> Result<(), DispatchError> {
        info!("[{}] {}", ctx.peripheral(), frame);
        Ok(())
    }
}
