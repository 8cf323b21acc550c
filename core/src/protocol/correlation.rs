//! Command/response correlation
//!
//! A request that expects exactly one device reply registers a resolver
//! under `(peripheral, tag)` before its command is queued. The matching
//! inbound frame resolves it. Every wait is bounded by a timeout.

use crate::peripheral::PeripheralId;
use crate::GatewayError;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Tag the lock's `status` reply resolves for a toggle request
pub const TOGGLE_LOCK: &str = "toggle_lock";
/// Tag for an explicit status query
pub const STATUS: &str = "status";

/// Pending device reply
#[derive(Debug)]
pub struct ResponseFuture {
    tag: String,
    rx: oneshot::Receiver<i64>,
    timeout: Duration,
}

impl ResponseFuture {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Wait for the device; fails with `TimedOut` or, if the request was
    /// superseded or its peripheral disconnected, `Cancelled`.
    pub async fn wait(self) -> Result<i64, GatewayError> {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(GatewayError::Cancelled { tag: self.tag }),
            Err(_) => Err(GatewayError::TimedOut { tag: self.tag }),
        }
    }
}

/// Outstanding resolvers keyed by `(peripheral, tag)`
#[derive(Debug)]
pub struct PendingCommands {
    pending: HashMap<(PeripheralId, String), oneshot::Sender<i64>>,
    timeout: Duration,
}

impl PendingCommands {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
        }
    }

    /// Register a resolver. A resolver already waiting on the same key is
    /// dropped and its waiter sees `Cancelled`.
    pub fn register(&mut self, id: &PeripheralId, tag: &str) -> ResponseFuture {
        self.pending.retain(|_, tx| !tx.is_closed());

        let (tx, rx) = oneshot::channel();
        if self
            .pending
            .insert((id.clone(), tag.to_string()), tx)
            .is_some()
        {
            debug!("[{}] Superseding pending <{}> request", id, tag);
        }

        ResponseFuture {
            tag: tag.to_string(),
            rx,
            timeout: self.timeout,
        }
    }

    /// Deliver a reply. Returns false when nobody was waiting.
    pub fn resolve(&mut self, id: &PeripheralId, tag: &str, value: i64) -> bool {
        match self.pending.remove(&(id.clone(), tag.to_string())) {
            Some(tx) => {
                let delivered = tx.send(value).is_ok();
                trace!("[{}] Resolved <{}> = {} (delivered: {})", id, tag, value, delivered);
                delivered
            }
            None => false,
        }
    }

    /// Drop one resolver
    pub fn cancel(&mut self, id: &PeripheralId, tag: &str) {
        self.pending.remove(&(id.clone(), tag.to_string()));
    }

    /// Drop every resolver for a peripheral. Returns how many were dropped.
    pub fn cancel_peripheral(&mut self, id: &PeripheralId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|(peripheral, _), _| peripheral != id);
        before - self.pending.len()
    }

    pub fn is_pending(&self, id: &PeripheralId, tag: &str) -> bool {
        self.pending
            .get(&(id.clone(), tag.to_string()))
            .is_some_and(|tx| !tx.is_closed())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock() -> PeripheralId {
        PeripheralId::new("aa:01")
    }

    #[tokio::test]
    async fn test_resolve_delivers_value() {
        let mut pending = PendingCommands::new(Duration::from_secs(1));
        let response = pending.register(&lock(), "m_lk");
        assert!(pending.resolve(&lock(), "m_lk", 1200));
        assert_eq!(response.wait().await, Ok(1200));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_without_waiter_is_a_miss() {
        let mut pending = PendingCommands::new(Duration::from_secs(1));
        assert!(!pending.resolve(&lock(), "m_lk", 1200));
    }

    #[tokio::test]
    async fn test_keys_are_per_peripheral() {
        let mut pending = PendingCommands::new(Duration::from_secs(1));
        let other = PeripheralId::new("bb:02");
        let response = pending.register(&lock(), STATUS);

        assert!(!pending.resolve(&other, STATUS, 1));
        assert!(pending.resolve(&lock(), STATUS, 0));
        assert_eq!(response.wait().await, Ok(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let mut pending = PendingCommands::new(Duration::from_secs(15));
        let response = pending.register(&lock(), TOGGLE_LOCK);
        assert_eq!(
            response.wait().await,
            Err(GatewayError::TimedOut {
                tag: TOGGLE_LOCK.to_string()
            })
        );
        // The timed-out resolver is no longer deliverable
        assert!(!pending.resolve(&lock(), TOGGLE_LOCK, 1));
    }

    #[tokio::test]
    async fn test_superseded_request_is_cancelled() {
        let mut pending = PendingCommands::new(Duration::from_secs(1));
        let first = pending.register(&lock(), STATUS);
        let second = pending.register(&lock(), STATUS);

        assert_eq!(
            first.wait().await,
            Err(GatewayError::Cancelled {
                tag: STATUS.to_string()
            })
        );
        assert!(pending.resolve(&lock(), STATUS, 1));
        assert_eq!(second.wait().await, Ok(1));
    }

    #[tokio::test]
    async fn test_cancel_peripheral() {
        let mut pending = PendingCommands::new(Duration::from_secs(1));
        let toggle = pending.register(&lock(), TOGGLE_LOCK);
        let _other = pending.register(&PeripheralId::new("bb:02"), STATUS);

        assert_eq!(pending.cancel_peripheral(&lock()), 1);
        assert_eq!(pending.len(), 1);
        assert!(matches!(toggle.wait().await, Err(GatewayError::Cancelled { .. })));
    }
}
