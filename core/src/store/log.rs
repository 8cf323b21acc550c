// Per-peripheral message log
//
// Append-only, timestamp-ordered. Keys are `log:<id>#<ms>-<seq>` with both
// numbers zero-padded so a prefix scan returns entries oldest first.

use crate::peripheral::PeripheralId;
use crate::store::backend::StorageBackend;
use crate::GatewayError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub peripheral: PeripheralId,
    /// Unix milliseconds
    pub timestamp_ms: u64,
    pub text: String,
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Clone)]
pub struct PeripheralLog {
    backend: Arc<dyn StorageBackend>,
    seq: Arc<AtomicU64>,
}

impl PeripheralLog {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    fn prefix(id: &PeripheralId) -> String {
        format!("log:{}#", id)
    }

    pub fn append(&self, id: &PeripheralId, text: &str) -> Result<LogEntry, GatewayError> {
        self.append_at(id, now_millis(), text)
    }

    pub fn append_at(
        &self,
        id: &PeripheralId,
        timestamp_ms: u64,
        text: &str,
    ) -> Result<LogEntry, GatewayError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let key = format!("{}{:020}-{:020}", Self::prefix(id), timestamp_ms, seq);
        let entry = LogEntry {
            peripheral: id.clone(),
            timestamp_ms,
            text: text.to_string(),
        };
        let value = serde_json::to_vec(&entry).map_err(|e| GatewayError::Storage(e.to_string()))?;
        self.backend
            .put(key.as_bytes(), &value)
            .map_err(GatewayError::Storage)?;
        Ok(entry)
    }

    /// Most recent first, at most `limit` entries
    pub fn entries(&self, id: &PeripheralId, limit: usize) -> Result<Vec<LogEntry>, GatewayError> {
        let stored = self
            .backend
            .scan_prefix(Self::prefix(id).as_bytes())
            .map_err(GatewayError::Storage)?;

        stored
            .iter()
            .rev()
            .take(limit)
            .map(|(_, value)| {
                serde_json::from_slice(value)
                    .map_err(|e| GatewayError::Storage(format!("corrupt log entry: {}", e)))
            })
            .collect()
    }

    pub fn count(&self, id: &PeripheralId) -> Result<usize, GatewayError> {
        self.backend
            .count_prefix(Self::prefix(id).as_bytes())
            .map_err(GatewayError::Storage)
    }
}
