// Outbox: per-peripheral queue of outbound commands
//
// Commands are queued regardless of link state and flushed one at a time
// while the peripheral is subscribed. A failed write puts the entry back at
// the head, so per-peripheral order is preserved across retries.

use crate::config::OutboxConfig;
use crate::peripheral::PeripheralId;
use crate::GatewayError;
use std::collections::{HashMap, VecDeque};
use tokio::time::Instant;
use tracing::{debug, warn};

/// A queued outbound command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub peripheral: PeripheralId,
    pub tag: String,
    /// `<tag>payload<delimiter>`
    pub wire_text: String,
    pub queued_at: Instant,
}

#[derive(Debug, Default)]
struct PeripheralQueue {
    entries: VecDeque<OutboxEntry>,
    /// A popped entry whose write has not completed yet
    in_flight: bool,
}

/// Outbound command queues, one per peripheral
pub struct Outbox {
    config: OutboxConfig,
    queues: HashMap<PeripheralId, PeripheralQueue>,
}

impl Outbox {
    pub fn new(config: OutboxConfig) -> Self {
        Self {
            config,
            queues: HashMap::new(),
        }
    }

    /// Render a command in wire format
    pub fn format(&self, tag: &str, payload: &str) -> String {
        format!("<{}>{}{}", tag, payload, self.config.delimiter)
    }

    /// Queue a command for delivery
    pub fn enqueue(
        &mut self,
        id: &PeripheralId,
        tag: &str,
        payload: &str,
    ) -> Result<(), GatewayError> {
        let wire_text = self.format(tag, payload);
        let max_depth = self.config.max_queue_depth;
        let queue = self.queues.entry(id.clone()).or_default();

        if queue.entries.len() >= max_depth {
            warn!("[{}] Outbox full, rejecting <{}>", id, tag);
            return Err(GatewayError::OutboxFull {
                peripheral: id.to_string(),
                depth: max_depth,
            });
        }

        debug!("[{}] Queued {}", id, wire_text);
        queue.entries.push_back(OutboxEntry {
            peripheral: id.clone(),
            tag: tag.to_string(),
            wire_text,
            queued_at: Instant::now(),
        });
        Ok(())
    }

    /// Pop the next deliverable entry and mark a write in flight.
    ///
    /// Returns `None` while a previous write is still pending. Entries older
    /// than the configured TTL are discarded on the way.
    pub fn begin_flush(&mut self, id: &PeripheralId) -> Option<OutboxEntry> {
        let ttl = self.config.entry_ttl();
        let queue = self.queues.get_mut(id)?;
        if queue.in_flight {
            return None;
        }

        while let Some(entry) = queue.entries.pop_front() {
            if entry.queued_at.elapsed() > ttl {
                warn!(
                    "[{}] Dropping {} after {:?} in outbox",
                    id,
                    entry.wire_text,
                    entry.queued_at.elapsed()
                );
                continue;
            }
            queue.in_flight = true;
            return Some(entry);
        }
        None
    }

    /// Complete the in-flight write; a failed entry returns to the head
    pub fn finish_flush(&mut self, entry: OutboxEntry, delivered: bool) {
        let queue = self.queues.entry(entry.peripheral.clone()).or_default();
        queue.in_flight = false;
        if !delivered {
            debug!("[{}] Requeueing {}", entry.peripheral, entry.wire_text);
            queue.entries.push_front(entry);
        }
    }

    pub fn len(&self, id: &PeripheralId) -> usize {
        self.queues.get(id).map_or(0, |queue| queue.entries.len())
    }

    /// Wire texts queued for `id`, head first
    pub fn pending(&self, id: &PeripheralId) -> Vec<String> {
        self.queues
            .get(id)
            .map(|queue| {
                queue
                    .entries
                    .iter()
                    .map(|entry| entry.wire_text.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}
