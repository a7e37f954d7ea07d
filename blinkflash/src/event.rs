//! Session events delivered to the console collaborator.
//!
//! The engine reports everything it does as plain-text status lines. The
//! wording is for humans; nothing downstream parses it.

use log::debug;
use tokio::sync::broadcast;

use crate::session::ConnectionState;

/// Capacity of the event broadcast channel. Slow subscribers lose the
/// oldest events rather than stalling the session.
pub const EVENT_CAPACITY: usize = 256;

/// Something the session wants its observers to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// A status line (transitions, chunk confirmations, error summaries).
    Status(String),
    /// Text printed by the device on its console endpoint.
    Console(String),
}

/// Sending half of the session event stream.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink {
    /// Create a sink with no subscribers yet.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Emit a status line and mirror it to the debug log.
    pub fn status(&self, line: impl Into<String>) {
        let line = line.into();
        debug!("{line}");
        self.emit(SessionEvent::Status(line));
    }

    /// Emit device console text.
    pub fn console(&self, text: impl Into<String>) {
        self.emit(SessionEvent::Console(text.into()));
    }

    /// Emit a state change.
    pub fn state(&self, state: ConnectionState) {
        self.emit(SessionEvent::StateChanged(state));
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_reach_subscribers_in_order() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe();

        sink.state(ConnectionState::Connecting);
        sink.status("Connecting to device...");
        sink.console("hello\n");

        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::StateChanged(ConnectionState::Connecting)
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::Status("Connecting to device...".into())
        );
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Console("hello\n".into()));
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let sink = EventSink::new();
        sink.status("nobody listening");
    }
}
