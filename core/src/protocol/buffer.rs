//! Stream reassembly
//!
//! Notification payloads arrive in arbitrary chunks. `StreamBuffer` turns them
//! into an ordered history of `\r\n`-terminated messages per peripheral. At
//! most one entry (the last) is ever unterminated; the next chunk extends it.

use crate::peripheral::PeripheralId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Inbound record terminator
pub const TERMINATOR: &str = "\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Unprocessed,
    Processing,
    Processed,
    Failed,
}

/// One history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sequence_id: u64,
    /// Includes the terminator once complete
    pub raw_text: String,
    pub process_state: ProcessState,
    /// Written to the persistent log
    pub logged: bool,
}

impl Message {
    fn new(sequence_id: u64, raw_text: String) -> Self {
        Self {
            sequence_id,
            raw_text,
            process_state: ProcessState::Unprocessed,
            logged: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.raw_text.ends_with(TERMINATOR)
    }

    /// Processed or Failed
    pub fn is_finished(&self) -> bool {
        matches!(
            self.process_state,
            ProcessState::Processed | ProcessState::Failed
        )
    }
}

#[derive(Debug, Default)]
struct PeripheralStream {
    history: Vec<Message>,
    /// Trailing bytes of an incomplete UTF-8 sequence
    partial: Vec<u8>,
}

impl PeripheralStream {
    fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.partial);
        bytes.extend_from_slice(chunk);

        match std::str::from_utf8(&bytes) {
            Ok(text) => text.to_string(),
            Err(e) if e.error_len().is_none() => {
                self.partial = bytes.split_off(e.valid_up_to());
                String::from_utf8_lossy(&bytes).into_owned()
            }
            Err(_) => String::from_utf8_lossy(&bytes).into_owned(),
        }
    }
}

/// Per-peripheral message history built from raw notification chunks
#[derive(Debug)]
pub struct StreamBuffer {
    streams: HashMap<PeripheralId, PeripheralStream>,
    next_sequence: u64,
    history_limit: usize,
}

impl StreamBuffer {
    pub fn new(history_limit: usize) -> Self {
        Self {
            streams: HashMap::new(),
            next_sequence: 0,
            history_limit,
        }
    }

    /// Split a chunk into history entries. Returns how many entries were
    /// created or extended.
    pub fn append(&mut self, id: &PeripheralId, chunk: &[u8]) -> usize {
        let stream = self.streams.entry(id.clone()).or_default();
        let decoded = stream.decode(chunk);

        // Reopen the unterminated tail so a terminator split across chunks
        // is seen whole.
        let reopened = match stream.history.last() {
            Some(last) if !last.is_complete() => stream.history.pop(),
            _ => None,
        };
        let (mut reuse_sequence, text) = match reopened {
            Some(tail) => (Some(tail.sequence_id), tail.raw_text + &decoded),
            None => (None, decoded),
        };

        let mut touched = 0;
        for fragment in text.split_inclusive(TERMINATOR) {
            if fragment.is_empty() || fragment == TERMINATOR {
                continue;
            }
            let sequence_id = match reuse_sequence.take() {
                Some(sequence_id) => sequence_id,
                None => {
                    let sequence_id = self.next_sequence;
                    self.next_sequence += 1;
                    sequence_id
                }
            };
            stream
                .history
                .push(Message::new(sequence_id, fragment.to_string()));
            touched += 1;
        }

        self.trim(id);
        touched
    }

    pub fn history(&self, id: &PeripheralId) -> &[Message] {
        self.streams
            .get(id)
            .map(|stream| stream.history.as_slice())
            .unwrap_or_default()
    }

    pub(crate) fn entry_mut(&mut self, id: &PeripheralId, index: usize) -> Option<&mut Message> {
        self.streams
            .get_mut(id)
            .and_then(|stream| stream.history.get_mut(index))
    }

    /// Complete entries not yet written to the persistent log
    pub fn unlogged(&self, id: &PeripheralId) -> Vec<Message> {
        self.history(id)
            .iter()
            .filter(|message| message.is_complete() && !message.logged)
            .cloned()
            .collect()
    }

    pub fn mark_logged(&mut self, id: &PeripheralId, sequence_ids: &[u64]) {
        if let Some(stream) = self.streams.get_mut(id) {
            for message in stream.history.iter_mut() {
                if sequence_ids.contains(&message.sequence_id) {
                    message.logged = true;
                }
            }
        }
        self.trim(id);
    }

    /// Drop the oldest finished and logged entries beyond the history limit
    pub fn trim(&mut self, id: &PeripheralId) {
        let limit = self.history_limit;
        let Some(stream) = self.streams.get_mut(id) else {
            return;
        };
        let mut excess = stream.history.len().saturating_sub(limit);
        if excess == 0 {
            return;
        }
        stream.history.retain(|message| {
            if excess > 0 && message.is_finished() && message.logged {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }

    /// Discard history and any partial input
    pub fn clear(&mut self, id: &PeripheralId) {
        self.streams.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(buffer: &StreamBuffer, id: &PeripheralId) -> Vec<String> {
        buffer
            .history(id)
            .iter()
            .map(|message| message.raw_text.clone())
            .collect()
    }

    #[test]
    fn test_single_chunk_multiple_frames() {
        let mut buffer = StreamBuffer::new(100);
        let id = PeripheralId::new("aa");
        assert_eq!(buffer.append(&id, b"<status>1\r\n<m_lk>1200\r\n"), 2);
        assert_eq!(texts(&buffer, &id), vec!["<status>1\r\n", "<m_lk>1200\r\n"]);
    }

    #[test]
    fn test_chunk_boundary_invariance() {
        let id = PeripheralId::new("aa");
        let mut split = StreamBuffer::new(100);
        split.append(&id, b"abc\r\nde");
        split.append(&id, b"f\r\n");

        let mut whole = StreamBuffer::new(100);
        whole.append(&id, b"abc\r\ndef\r\n");

        assert_eq!(split.history(&id), whole.history(&id));
    }

    #[test]
    fn test_terminator_split_across_chunks() {
        let mut buffer = StreamBuffer::new(100);
        let id = PeripheralId::new("aa");
        buffer.append(&id, b"<key>aabb\r");
        buffer.append(&id, b"\n<req_rfid_data>");

        assert_eq!(texts(&buffer, &id), vec!["<key>aabb\r\n", "<req_rfid_data>"]);
        let history = buffer.history(&id);
        assert!(history[0].is_complete());
        assert!(!history[1].is_complete());
    }

    #[test]
    fn test_complete_tail_left_untouched() {
        let mut buffer = StreamBuffer::new(100);
        let id = PeripheralId::new("aa");
        buffer.append(&id, b"<a>\r\n");
        let first = buffer.history(&id)[0].clone();
        buffer.append(&id, b"<b>\r\n");

        assert_eq!(buffer.history(&id)[0], first);
        assert_eq!(buffer.history(&id).len(), 2);
    }

    #[test]
    fn test_open_entry_keeps_sequence_id() {
        let mut buffer = StreamBuffer::new(100);
        let id = PeripheralId::new("aa");
        buffer.append(&id, b"<sta");
        let sequence_id = buffer.history(&id)[0].sequence_id;
        buffer.append(&id, b"tus>0\r\n");

        assert_eq!(buffer.history(&id).len(), 1);
        assert_eq!(buffer.history(&id)[0].sequence_id, sequence_id);
    }

    #[test]
    fn test_empty_fragments_discarded() {
        let mut buffer = StreamBuffer::new(100);
        let id = PeripheralId::new("aa");
        buffer.append(&id, b"\r\n\r\n<a>\r\n\r\n");
        assert_eq!(texts(&buffer, &id), vec!["<a>\r\n"]);
    }

    #[test]
    fn test_utf8_sequence_split_across_chunks() {
        let mut buffer = StreamBuffer::new(100);
        let id = PeripheralId::new("aa");
        let bytes = "<msg>é\r\n".as_bytes();
        let split = bytes.len() - 3;
        buffer.append(&id, &bytes[..split]);
        buffer.append(&id, &bytes[split..]);
        assert_eq!(texts(&buffer, &id), vec!["<msg>é\r\n"]);
    }

    #[test]
    fn test_clear_discards_history_and_partial_input() {
        let mut buffer = StreamBuffer::new(100);
        let id = PeripheralId::new("aa");
        buffer.append(&id, b"<a>\r\n<b");
        buffer.clear(&id);
        assert!(buffer.history(&id).is_empty());

        buffer.append(&id, b">\r\n");
        assert_eq!(texts(&buffer, &id), vec![">\r\n"]);
    }

    #[test]
    fn test_peripherals_isolated() {
        let mut buffer = StreamBuffer::new(100);
        let lock = PeripheralId::new("aa");
        let rfid = PeripheralId::new("bb");
        buffer.append(&lock, b"<sta");
        buffer.append(&rfid, b"<key>01\r\n");
        buffer.append(&lock, b"tus>1\r\n");

        assert_eq!(texts(&buffer, &lock), vec!["<status>1\r\n"]);
        assert_eq!(texts(&buffer, &rfid), vec!["<key>01\r\n"]);
    }

    #[test]
    fn test_trim_only_removes_finished_and_logged() {
        let mut buffer = StreamBuffer::new(2);
        let id = PeripheralId::new("aa");
        buffer.append(&id, b"<a>\r\n<b>\r\n<c>\r\n");
        // Nothing is finished yet, so nothing can go
        assert_eq!(buffer.history(&id).len(), 3);

        if let Some(first) = buffer.entry_mut(&id, 0) {
            first.process_state = ProcessState::Processed;
        }
        let first_sequence = buffer.history(&id)[0].sequence_id;
        buffer.mark_logged(&id, &[first_sequence]);

        assert_eq!(texts(&buffer, &id), vec!["<b>\r\n", "<c>\r\n"]);
    }

    #[test]
    fn test_unlogged_skips_open_tail() {
        let mut buffer = StreamBuffer::new(100);
        let id = PeripheralId::new("aa");
        buffer.append(&id, b"<a>\r\n<b");
        let unlogged = buffer.unlogged(&id);
        assert_eq!(unlogged.len(), 1);
        assert_eq!(unlogged[0].raw_text, "<a>\r\n");
    }
}
