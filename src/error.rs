use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type WatchResult<T> = Result<T, WatchError>;

/// Errors surfaced through the public server API.
///
/// Non-fatal backend errors observed while handling events are not errors in
/// this sense; they are reported through [`EventSink::on_error`]
/// (see [`crate::EventSink`]).
#[derive(Debug, Error)]
pub enum WatchError {
    /// The OS notification primitive could not be created, or the pump thread
    /// never signalled readiness.
    #[error("failed to start watch server")]
    StartupFailed(#[source] io::Error),

    /// The path is already covered by a live watch point.
    #[error("already watching {}", .0.display())]
    AlreadyWatching(PathBuf),

    /// The path did not name a directory at registration time.
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    /// Unexpected OS failure while registering or unregistering a path.
    #[error("{}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The pump did not acknowledge a command within the bounded wait.
    /// Usually means the pump thread is wedged in a backend call.
    #[error("watch server did not acknowledge command within {0:?}")]
    CommandTimedOut(Duration),

    /// The server has terminated (explicitly via `close`, or after a fatal
    /// backend fault) and accepts no further commands.
    #[error("watch server has terminated")]
    Terminated,
}

impl WatchError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        WatchError::Io {
            path: path.into(),
            source,
        }
    }
}
