use std::path::Path;

use crossbeam_channel as channel;

use crate::event::{ChangeEvent, ChangeKind};

/// Outbound interface through which the server reports changes and non-fatal
/// backend errors to the embedder.
///
/// Both callbacks are invoked exclusively on the server's pump thread. They
/// must not call back into the server synchronously (the pump cannot drain
/// the command queue while it is inside the sink, so the call would dead-wait
/// until the command timeout); hopping to another thread first is fine.
///
/// The sink must outlive the server; the server holds it behind an `Arc` and
/// drops its reference when the pump exits.
pub trait EventSink: Send + Sync {
    /// A change was observed at or beneath a watch root.
    fn on_change(&self, kind: ChangeKind, path: &Path);

    /// A backend error occurred that could not be translated into a specific
    /// event. The pump keeps running unless the error was fatal to its loop.
    fn on_error(&self, message: &str);
}

/// Message type delivered by [`ChannelSink`] and [`RecordingSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkMessage {
    Change(ChangeEvent),
    Error(String),
}

/// Sink that forwards everything into a crossbeam channel.
///
/// This keeps the watcher boundary library-friendly: consumers integrate the
/// receiver into their own event loops without being forced onto a particular
/// runtime or callback discipline.
pub struct ChannelSink {
    tx: channel::Sender<SinkMessage>,
}

impl ChannelSink {
    /// Creates the sink and the receiver to drain it from.
    pub fn new() -> (Self, channel::Receiver<SinkMessage>) {
        let (tx, rx) = channel::unbounded();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn on_change(&self, kind: ChangeKind, path: &Path) {
        // A dropped receiver means the embedder stopped listening; losing the
        // message is the intended outcome.
        let _ = self.tx.send(SinkMessage::Change(ChangeEvent::new(kind, path)));
    }

    fn on_error(&self, message: &str) {
        let _ = self.tx.send(SinkMessage::Error(message.to_owned()));
    }
}

/// Deterministic sink implementation for tests.
///
/// Records every delivery and exposes a draining view, so tests can wait for
/// specific events with a timeout or assert that a quiet period stayed quiet.
pub struct RecordingSink {
    tx: channel::Sender<SinkMessage>,
    rx: channel::Receiver<SinkMessage>,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSink {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self { tx, rx }
    }

    /// Next recorded message, waiting up to `timeout`.
    pub fn next_message(&self, timeout: std::time::Duration) -> Option<SinkMessage> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Next recorded change, waiting up to `timeout`. Error messages received
    /// while waiting are skipped.
    pub fn next_change(&self, timeout: std::time::Duration) -> Option<ChangeEvent> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(std::time::Instant::now())?;
            match self.rx.recv_timeout(remaining) {
                Ok(SinkMessage::Change(event)) => return Some(event),
                Ok(SinkMessage::Error(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Everything recorded so far, without waiting.
    pub fn drain(&self) -> Vec<SinkMessage> {
        self.rx.try_iter().collect()
    }
}

impl EventSink for RecordingSink {
    fn on_change(&self, kind: ChangeKind, path: &Path) {
        let _ = self.tx.send(SinkMessage::Change(ChangeEvent::new(kind, path)));
    }

    fn on_error(&self, message: &str) {
        let _ = self.tx.send(SinkMessage::Error(message.to_owned()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn channel_sink_forwards_changes_and_errors() {
        let (sink, rx) = ChannelSink::new();

        sink.on_change(ChangeKind::Created, Path::new("/tmp/a"));
        sink.on_error("backend hiccup");

        assert_eq!(
            rx.recv().unwrap(),
            SinkMessage::Change(ChangeEvent::new(ChangeKind::Created, "/tmp/a"))
        );
        assert_eq!(
            rx.recv().unwrap(),
            SinkMessage::Error("backend hiccup".to_owned())
        );
    }

    #[test]
    fn channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.on_change(ChangeKind::Removed, Path::new("/tmp/a"));
    }

    #[test]
    fn recording_sink_skips_errors_when_waiting_for_changes() {
        let sink = RecordingSink::new();
        sink.on_error("noise");
        sink.on_change(ChangeKind::Modified, Path::new("/tmp/b"));

        let event = sink.next_change(Duration::from_millis(100)).unwrap();
        assert_eq!(event.kind, ChangeKind::Modified);
        assert!(sink.drain().is_empty());
    }
}
