//! Reassembly properties of the inbound stream buffer

use lockbridge_core::protocol::StreamBuffer;
use lockbridge_core::PeripheralId;
use proptest::prelude::*;

fn peripheral() -> PeripheralId {
    PeripheralId::new("aa:bb:cc:dd:ee:ff")
}

/// A stream of terminated records, optionally followed by a partial one
fn stream_text() -> impl Strategy<Value = String> {
    (
        prop::collection::vec("[a-z0-9<>_;]{1,12}", 0..12),
        prop::option::of("[a-z0-9<>_;]{1,12}"),
    )
        .prop_map(|(records, partial)| {
            let mut text: String = records.iter().map(|r| format!("{}\r\n", r)).collect();
            if let Some(partial) = partial {
                text.push_str(&partial);
            }
            text
        })
}

/// Split `text` at the given (unsorted, possibly duplicate) cut points
fn chunks(text: &str, cuts: &[usize]) -> Vec<Vec<u8>> {
    let bytes = text.as_bytes();
    let mut points: Vec<usize> = cuts
        .iter()
        .map(|cut| if bytes.is_empty() { 0 } else { cut % (bytes.len() + 1) })
        .collect();
    points.push(0);
    points.push(bytes.len());
    points.sort_unstable();
    points.dedup();
    points
        .windows(2)
        .map(|pair| bytes[pair[0]..pair[1]].to_vec())
        .collect()
}

fn raw_texts(buffer: &StreamBuffer) -> Vec<String> {
    buffer
        .history(&peripheral())
        .iter()
        .map(|message| message.raw_text.clone())
        .collect()
}

proptest! {
    #[test]
    fn history_concatenates_to_input(text in stream_text(), cuts in prop::collection::vec(any::<usize>(), 0..8)) {
        let mut buffer = StreamBuffer::new(10_000);
        for chunk in chunks(&text, &cuts) {
            buffer.append(&peripheral(), &chunk);
        }
        prop_assert_eq!(raw_texts(&buffer).concat(), text);
    }

    #[test]
    fn only_the_tail_is_incomplete(text in stream_text(), cuts in prop::collection::vec(any::<usize>(), 0..8)) {
        let mut buffer = StreamBuffer::new(10_000);
        for chunk in chunks(&text, &cuts) {
            buffer.append(&peripheral(), &chunk);
        }
        let history = buffer.history(&peripheral());
        if let Some((_, earlier)) = history.split_last() {
            prop_assert!(earlier.iter().all(|message| message.is_complete()));
        }
    }

    #[test]
    fn chunking_does_not_change_history(text in stream_text(), cuts in prop::collection::vec(any::<usize>(), 0..8)) {
        let mut whole = StreamBuffer::new(10_000);
        whole.append(&peripheral(), text.as_bytes());

        let mut split = StreamBuffer::new(10_000);
        for chunk in chunks(&text, &cuts) {
            split.append(&peripheral(), &chunk);
        }

        prop_assert_eq!(raw_texts(&split), raw_texts(&whole));
        let ids: Vec<u64> = split
            .history(&peripheral())
            .iter()
            .map(|message| message.sequence_id)
            .collect();
        prop_assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }
}

#[test]
fn test_terminator_split_between_chunks() {
    let mut buffer = StreamBuffer::new(100);
    buffer.append(&peripheral(), b"<status>1\r");
    buffer.append(&peripheral(), b"\n<key>ab");

    let history = buffer.history(&peripheral());
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].raw_text, "<status>1\r\n");
    assert!(history[0].is_complete());
    assert_eq!(history[1].raw_text, "<key>ab");
    assert!(!history[1].is_complete());
}

#[test]
fn test_blank_records_discarded() {
    let mut buffer = StreamBuffer::new(100);
    buffer.append(&peripheral(), b"\r\n\r\n<status>0\r\n\r\n");
    assert_eq!(raw_texts(&buffer), vec!["<status>0\r\n"]);
}
