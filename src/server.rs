use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel as channel;

use crate::backend;
use crate::command::{self, Command, COMMAND_TIMEOUT};
use crate::config::WatchConfig;
use crate::error::{WatchError, WatchResult};
use crate::sink::EventSink;

// ServerState word. Transitions are monotonic: Starting → Running →
// Terminating → Terminated, with Terminated also reachable directly when the
// pump dies on a fatal backend fault.
const STARTING: u8 = 0;
const RUNNING: u8 = 1;
const TERMINATING: u8 = 2;
const TERMINATED: u8 = 3;

struct ServerShared {
    state: AtomicU8,
}

impl ServerShared {
    fn advance(&self, state: u8) {
        // fetch_max keeps the progression monotonic when close() and a dying
        // pump race to publish their transition.
        self.state.fetch_max(state, Ordering::SeqCst);
    }
}

/// Flips the server to `Terminated` when the pump function returns or panics,
/// so public calls stop queueing commands nobody will answer.
struct PumpExitGuard(Arc<ServerShared>);

impl Drop for PumpExitGuard {
    fn drop(&mut self) {
        self.0.advance(TERMINATED);
    }
}

/// The public face of the watcher: owns the pump thread, the command mailbox,
/// and (transitively) every OS watch handle.
///
/// All public methods are safe to call from any thread; they only enqueue a
/// command, wake the pump, and wait for its acknowledgement. Watch-point
/// mutation and event delivery happen exclusively on the pump thread.
///
/// Dropping the server closes it.
pub struct WatchServer {
    commands: channel::Sender<Command>,
    wake: backend::WakeHandle,
    shared: Arc<ServerShared>,
    pump: Option<thread::JoinHandle<()>>,
}

impl WatchServer {
    /// Starts the pump thread and blocks until it signals readiness.
    ///
    /// Fails with [`WatchError::StartupFailed`] when the OS refuses to create
    /// the underlying notification object or the pump does not come up within
    /// the startup bound.
    pub fn open(sink: Arc<dyn EventSink>, config: WatchConfig) -> WatchResult<Self> {
        let (command_tx, command_rx) = channel::unbounded();
        let (ready_tx, ready_rx) = channel::bounded(1);
        let shared = Arc::new(ServerShared {
            state: AtomicU8::new(STARTING),
        });

        let guard = PumpExitGuard(Arc::clone(&shared));
        let pump = thread::Builder::new()
            .name("pathwatch-pump".to_owned())
            .spawn(move || {
                let _guard = guard;
                backend::run(config, command_rx, sink, ready_tx);
            })
            .map_err(WatchError::StartupFailed)?;

        match ready_rx.recv_timeout(COMMAND_TIMEOUT) {
            Ok(Ok(wake)) => {
                shared.advance(RUNNING);
                tracing::debug!(target = "pathwatch", "server running");
                Ok(Self {
                    commands: command_tx,
                    wake,
                    shared,
                    pump: Some(pump),
                })
            }
            Ok(Err(err)) => {
                // The pump reported its own failure and is already exiting.
                let _ = pump.join();
                Err(WatchError::StartupFailed(err))
            }
            Err(channel::RecvTimeoutError::Disconnected) => {
                let _ = pump.join();
                Err(WatchError::StartupFailed(io::Error::other(
                    "pump thread exited before signalling readiness",
                )))
            }
            Err(channel::RecvTimeoutError::Timeout) => {
                // The pump is wedged somewhere inside an OS call; joining it
                // could block forever, so the thread is abandoned.
                tracing::warn!(
                    target = "pathwatch",
                    "pump thread did not signal readiness in time"
                );
                Err(WatchError::StartupFailed(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "pump thread did not signal readiness in time",
                )))
            }
        }
    }

    /// Registers the given directories as watch roots.
    ///
    /// Paths must be absolute directories. The batch is applied in order and
    /// aborts on the first failing path; paths registered earlier in the same
    /// call stay registered.
    pub fn register<P: AsRef<Path>>(&self, paths: &[P]) -> WatchResult<()> {
        let paths: Vec<PathBuf> = paths.iter().map(|p| p.as_ref().to_path_buf()).collect();
        let (reply, reply_rx) = command::reply_pair();
        self.submit(Command::Register { paths, reply })?;
        command::await_reply(&reply_rx)?
    }

    /// Stops watching the given roots.
    ///
    /// Returns `true` iff every path was previously watched; unknown paths do
    /// not stop the rest of the batch from being removed. No event for a
    /// removed root is delivered after this call returns.
    pub fn unregister<P: AsRef<Path>>(&self, paths: &[P]) -> WatchResult<bool> {
        let paths: Vec<PathBuf> = paths.iter().map(|p| p.as_ref().to_path_buf()).collect();
        let (reply, reply_rx) = command::reply_pair();
        self.submit(Command::Unregister { paths, reply })?;
        command::await_reply(&reply_rx)
    }

    /// Whether the pump is up and accepting commands.
    pub fn is_running(&self) -> bool {
        self.shared.state.load(Ordering::SeqCst) == RUNNING
    }

    /// Shuts the server down: terminates the pump, joins it, and releases
    /// every backend resource. Idempotent, and succeeds even when the pump
    /// already exited on a fatal error.
    pub fn close(&mut self) {
        let Some(pump) = self.pump.take() else {
            return;
        };
        self.shared.advance(TERMINATING);
        // A dead pump has dropped its receiver; the failed send is fine
        // because joining is all that is left to do.
        let _ = self.commands.send(Command::Terminate);
        self.wake.wake();
        if pump.join().is_err() {
            tracing::error!(target = "pathwatch", "pump thread panicked");
        }
        self.shared.advance(TERMINATED);
        tracing::debug!(target = "pathwatch", "server closed");
    }

    fn submit(&self, command: Command) -> WatchResult<()> {
        if self.shared.state.load(Ordering::SeqCst) > RUNNING {
            return Err(WatchError::Terminated);
        }
        self.commands
            .send(command)
            .map_err(|_| WatchError::Terminated)?;
        self.wake.wake();
        Ok(())
    }
}

impl Drop for WatchServer {
    fn drop(&mut self) {
        self.close();
    }
}
