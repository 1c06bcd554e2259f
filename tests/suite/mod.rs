mod lifecycle;
mod registration;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pathwatch::{ChangeEvent, RecordingSink, WatchConfig, WatchServer};

/// Generous bound for events that should arrive promptly; real CI machines
/// can stall for a surprising while.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Window used to assert that *no* event shows up.
pub const QUIET_WINDOW: Duration = Duration::from_millis(250);

pub fn open_server() -> (WatchServer, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let server = WatchServer::open(Arc::clone(&sink) as Arc<dyn pathwatch::EventSink>, WatchConfig::default())
        .expect("failed to open watch server");
    (server, sink)
}

/// Waits until a change for `path` arrives, ignoring events for other paths
/// (a parallel test runner can touch shared ancestors).
pub fn wait_for_change_at(sink: &RecordingSink, path: &Path) -> ChangeEvent {
    let deadline = std::time::Instant::now() + EVENT_TIMEOUT;
    loop {
        let remaining = deadline
            .checked_duration_since(std::time::Instant::now())
            .unwrap_or_else(|| panic!("no change event arrived for {}", path.display()));
        if let Some(event) = sink.next_change(remaining) {
            if event.path == path {
                return event;
            }
        }
    }
}
