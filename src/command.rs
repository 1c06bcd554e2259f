//! The control-plane mailbox between the public server API and the pump.
//!
//! Commands travel over an unbounded channel and carry a one-shot reply
//! handle. Submitters enqueue, wake the pump through the backend-specific
//! mechanism, then block on the reply with a bounded timeout. The pump drains
//! the mailbox on its own thread, so applying a command may freely mutate
//! watch-point state without locking against the event-handling path.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crossbeam_channel as channel;

use crate::error::{WatchError, WatchResult};

/// Bound on every synchronous wait against the pump: command replies and the
/// startup readiness handshake.
pub(crate) const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) enum Command {
    Register {
        paths: Vec<PathBuf>,
        reply: Reply<WatchResult<()>>,
    },
    Unregister {
        paths: Vec<PathBuf>,
        reply: Reply<bool>,
    },
    Terminate,
}

/// One-shot completion signal for a command.
pub(crate) struct Reply<T>(channel::Sender<T>);

impl<T> Reply<T> {
    /// Delivers the result. The submitter may have already given up waiting;
    /// that is not an error.
    pub(crate) fn send(self, value: T) {
        let _ = self.0.send(value);
    }
}

pub(crate) fn reply_pair<T>() -> (Reply<T>, channel::Receiver<T>) {
    let (tx, rx) = channel::bounded(1);
    (Reply(tx), rx)
}

/// Waits for a command's completion signal.
///
/// A disconnect means the pump dropped the command without answering, which
/// only happens when its loop has exited.
pub(crate) fn await_reply<T>(rx: &channel::Receiver<T>) -> WatchResult<T> {
    match rx.recv_timeout(COMMAND_TIMEOUT) {
        Ok(value) => Ok(value),
        Err(channel::RecvTimeoutError::Timeout) => {
            Err(WatchError::CommandTimedOut(COMMAND_TIMEOUT))
        }
        Err(channel::RecvTimeoutError::Disconnected) => Err(WatchError::Terminated),
    }
}

/// The mutations a backend pump exposes to the command layer.
///
/// Implementations run on the pump thread; batch semantics and path
/// validation live here so the three backends only deal with single roots.
pub(crate) trait PumpControl {
    fn register_root(&mut self, root: &Path) -> WatchResult<()>;

    /// Returns `false` when the root was not being watched.
    fn unregister_root(&mut self, root: &Path) -> bool;

    fn terminate(&mut self);
}

/// Applies one command to the pump and signals its completion.
pub(crate) fn apply<P: PumpControl>(pump: &mut P, command: Command) {
    match command {
        Command::Register { paths, reply } => reply.send(register_batch(pump, &paths)),
        Command::Unregister { paths, reply } => {
            let mut all_watched = true;
            for path in &paths {
                all_watched &= pump.unregister_root(path);
            }
            reply.send(all_watched);
        }
        Command::Terminate => pump.terminate(),
    }
}

/// Drains every queued command in FIFO order.
pub(crate) fn drain<P: PumpControl>(pump: &mut P, commands: &channel::Receiver<Command>) {
    while let Ok(command) = commands.try_recv() {
        apply(pump, command);
    }
}

/// Registers a batch of roots, stopping at the first failure. Roots added
/// earlier in the batch stay registered.
fn register_batch<P: PumpControl>(pump: &mut P, paths: &[PathBuf]) -> WatchResult<()> {
    for path in paths {
        check_directory(path)?;
        pump.register_root(path)?;
    }
    Ok(())
}

fn check_directory(path: &Path) -> WatchResult<()> {
    if !path.is_absolute() {
        return Err(WatchError::io(
            path,
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "watch roots must be absolute paths",
            ),
        ));
    }
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(WatchError::NotADirectory(path.to_path_buf())),
        Err(source) => Err(WatchError::io(path, source)),
    }
}
