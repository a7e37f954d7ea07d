//! Device console decoding.
//!
//! Console notifications arrive as raw byte chunks sized by the link MTU, so
//! a multi-byte UTF-8 character can straddle two notifications. The decoder
//! keeps the incomplete tail until the next chunk arrives.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::event::EventSink;

/// Incremental lossy UTF-8 decoder for console chunks.
#[derive(Debug, Default)]
pub struct ConsoleDecoder {
    pending: Vec<u8>,
}

impl ConsoleDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one notification and return whatever text is complete.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        drain_utf8_lossy(&mut self.pending)
    }

    /// Bytes held back waiting for the rest of a character.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Drain buffered bytes into displayable UTF-8 text without stalling on invalid bytes.
///
/// - Valid UTF-8 is emitted as-is.
/// - Invalid byte sequences emit the replacement char `�` and continue.
/// - Incomplete UTF-8 suffix is kept in `buffer` for the next read.
pub fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                break;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if let Ok(valid) = std::str::from_utf8(&buffer[..valid_up_to]) {
                    output.push_str(valid);
                }

                if let Some(invalid_len) = err.error_len() {
                    output.push('\u{FFFD}');
                    let drain_to = valid_up_to.saturating_add(invalid_len).min(buffer.len());
                    buffer.drain(..drain_to);
                } else {
                    buffer.drain(..valid_up_to);
                    break;
                }
            },
        }
    }

    output
}

/// Drop non-printable control characters from console text.
///
/// Keeps `\n`, `\t` and printable characters; a lone `\r` becomes `\n`.
pub fn clean_console_text(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n");
    let mut out = String::with_capacity(normalized.len());
    for ch in normalized.chars() {
        match ch {
            '\n' | '\t' => out.push(ch),
            '\r' => out.push('\n'),
            _ if ch.is_control() => {},
            _ => out.push(ch),
        }
    }
    out
}

/// Prefix each new console line with `prefix`.
///
/// `at_line_start` carries the line state across calls, since a line may be
/// split over several notifications.
pub fn prefix_lines(text: &str, prefix: &str, at_line_start: &mut bool) -> String {
    let mut out = String::with_capacity(text.len() + prefix.len());
    for ch in text.chars() {
        if *at_line_start && ch != '\n' {
            out.push_str(prefix);
            *at_line_start = false;
        }
        out.push(ch);
        if ch == '\n' {
            *at_line_start = true;
        }
    }
    out
}

/// Decode console chunks from `rx` and publish them as console events until
/// the channel closes or `shutdown` fires.
pub(crate) async fn forward_console(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    events: EventSink,
    shutdown: CancellationToken,
) {
    let mut decoder = ConsoleDecoder::new();
    loop {
        tokio::select! {
            chunk = rx.recv() => {
                let Some(chunk) = chunk else { break };
                let text = decoder.push(&chunk);
                if !text.is_empty() {
                    events.console(text);
                }
            }
            () = shutdown.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_utf8_lossy_replaces_invalid_bytes_and_continues() {
        let mut buf = vec![0xFF, b'A', 0xFE, b'B'];
        let out = drain_utf8_lossy(&mut buf);
        assert_eq!(out, "\u{FFFD}A\u{FFFD}B");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decoder_joins_split_character() {
        let mut decoder = ConsoleDecoder::new();
        // "é" is C3 A9, split across two notifications.
        assert_eq!(decoder.push(&[b'c', b'a', b'f', 0xC3]), "caf");
        assert_eq!(decoder.pending(), 1);
        assert_eq!(decoder.push(&[0xA9, b'\n']), "é\n");
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_clean_console_text_filters_control_chars() {
        let cleaned = clean_console_text("A\x07B\x1BC\tD\r\nE\rF");
        assert_eq!(cleaned, "ABC\tD\nE\nF");
    }

    #[test]
    fn test_prefix_lines_tracks_line_state() {
        let mut at_start = true;
        assert_eq!(prefix_lines("ab\ncd", "> ", &mut at_start), "> ab\n> cd");
        assert!(!at_start);
        assert_eq!(prefix_lines("e\n", "> ", &mut at_start), "e\n");
        assert!(at_start);
        assert_eq!(prefix_lines("\n", "> ", &mut at_start), "\n");
    }

    #[tokio::test]
    async fn test_forward_console_publishes_decoded_text() {
        let events = EventSink::new();
        let mut sub = events.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(forward_console(rx, events.clone(), shutdown.clone()));

        tx.send(b"hel".to_vec()).unwrap();
        tx.send(b"lo".to_vec()).unwrap();
        drop(tx);
        task.await.unwrap();

        let mut text = String::new();
        while let Ok(crate::event::SessionEvent::Console(chunk)) = sub.try_recv() {
            text.push_str(&chunk);
        }
        assert_eq!(text, "hello");
    }
}
