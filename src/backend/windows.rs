//! Windows event pump: one overlapped `ReadDirectoryChangesW` cycle per watch
//! root, completions and control commands both delivered as APCs to the pump
//! thread while it sits in an alertable `SleepEx`.
//!
//! A watch point's `OVERLAPPED.hEvent` carries a pointer back to the watch
//! point itself (the event field is unused for completion-routine I/O), so
//! the completion routine can recover its state without any global table.
//! Watch points are boxed and never move while I/O is outstanding.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::windows::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel as channel;
use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_ACCESS_DENIED, ERROR_NOT_FOUND, ERROR_OPERATION_ABORTED, ERROR_SUCCESS,
    HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, GetFileAttributesW, ReadDirectoryChangesW, FILE_ACTION_ADDED,
    FILE_ACTION_MODIFIED, FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME,
    FILE_ACTION_RENAMED_OLD_NAME, FILE_ATTRIBUTE_DIRECTORY, FILE_FLAG_BACKUP_SEMANTICS,
    FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY, FILE_NOTIFY_CHANGE_ATTRIBUTES,
    FILE_NOTIFY_CHANGE_CREATION, FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME,
    FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SIZE, FILE_NOTIFY_INFORMATION,
    FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, INVALID_FILE_ATTRIBUTES, OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::{
    GetCurrentThreadId, OpenThread, QueueUserAPC, SleepEx, INFINITE, THREAD_ALL_ACCESS,
};
use windows_sys::Win32::System::IO::{CancelIoEx, OVERLAPPED};

use crate::command::{self, Command, PumpControl};
use crate::config::WatchConfig;
use crate::error::{WatchError, WatchResult};
use crate::event::ChangeKind;
use crate::path;
use crate::sink::EventSink;

const EVENT_MASK: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
    | FILE_NOTIFY_CHANGE_DIR_NAME
    | FILE_NOTIFY_CHANGE_ATTRIBUTES
    | FILE_NOTIFY_CHANGE_SIZE
    | FILE_NOTIFY_CHANGE_LAST_WRITE
    | FILE_NOTIFY_CHANGE_CREATION;

/// How long unregistration and shutdown wait for a cancelled watch point's
/// aborted completion before declaring it leaked.
const CANCEL_DRAIN_WINDOW: Duration = Duration::from_secs(5);

struct ThreadHandle(HANDLE);

// Safety: the handle is only used with QueueUserAPC and CloseHandle, both of
// which are safe from any thread.
unsafe impl Send for ThreadHandle {}
unsafe impl Sync for ThreadHandle {}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0) };
    }
}

/// Wakes the pump by queueing a no-op APC, which pops it out of its alertable
/// sleep so it drains the command mailbox.
#[derive(Clone)]
pub(crate) struct WakeHandle {
    thread: Arc<ThreadHandle>,
}

unsafe extern "system" fn wake_apc(_data: usize) {}

impl WakeHandle {
    pub(crate) fn wake(&self) {
        let queued = unsafe { QueueUserAPC(Some(wake_apc), self.thread.0, 0) };
        if queued == 0 {
            tracing::warn!(
                target = "pathwatch.rdcw",
                error = %io::Error::last_os_error(),
                "failed to wake pump"
            );
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WatchState {
    NotListening,
    Listening,
    Cancelled,
    Finished,
}

enum ListenOutcome {
    Listening,
    /// The directory disappeared between checks; the handle is closed.
    Deleted,
    Failed(io::Error),
}

/// Owns the directory handle and the in-flight `ReadDirectoryChangesW` state
/// for one root. The registered root is kept in extended-length form; every
/// reported path has the prefix stripped again.
struct WatchPoint {
    overlapped: OVERLAPPED,
    handle: HANDLE,
    root: PathBuf,
    state: WatchState,
    buffer: Vec<u8>,
    sink: Arc<dyn EventSink>,
}

impl WatchPoint {
    fn open(root: &Path, buffer_bytes: usize, sink: Arc<dyn EventSink>) -> WatchResult<Box<Self>> {
        let wide = path::to_wide(root);
        let handle = unsafe {
            CreateFileW(
                wide.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(WatchError::io(root, io::Error::last_os_error()));
        }

        let mut watch_point = Box::new(Self {
            overlapped: unsafe { mem::zeroed() },
            handle,
            root: root.to_path_buf(),
            state: WatchState::NotListening,
            buffer: vec![0; buffer_bytes],
            sink,
        });
        // The box gives the watch point a stable address; the completion
        // routine finds it again through hEvent.
        watch_point.overlapped.hEvent = &mut *watch_point as *mut WatchPoint as HANDLE;

        match watch_point.listen() {
            ListenOutcome::Listening => Ok(watch_point),
            ListenOutcome::Deleted => Err(WatchError::NotADirectory(root.to_path_buf())),
            ListenOutcome::Failed(err) => Err(WatchError::io(root, err)),
        }
    }

    fn listen(&mut self) -> ListenOutcome {
        let ok = unsafe {
            ReadDirectoryChangesW(
                self.handle,
                self.buffer.as_mut_ptr().cast(),
                self.buffer.len() as u32,
                1,
                EVENT_MASK,
                ptr::null_mut(),
                &mut self.overlapped,
                Some(handle_completion),
            )
        };
        if ok != 0 {
            self.state = WatchState::Listening;
            return ListenOutcome::Listening;
        }
        let err = io::Error::last_os_error();
        self.close_handle();
        if err.raw_os_error() == Some(ERROR_ACCESS_DENIED as i32) && !self.is_valid_directory() {
            ListenOutcome::Deleted
        } else {
            ListenOutcome::Failed(err)
        }
    }

    /// Requests cancellation of the in-flight read. Returns `true` when an
    /// aborted completion is still on its way.
    fn cancel(&mut self) -> bool {
        if self.state != WatchState::Listening {
            return self.state == WatchState::Cancelled;
        }
        tracing::debug!(
            target = "pathwatch.rdcw",
            root = %self.root.display(),
            "cancelling watch point"
        );
        self.state = WatchState::Cancelled;
        let cancelled = unsafe { CancelIoEx(self.handle, &self.overlapped) };
        if cancelled == 0 {
            let err = io::Error::last_os_error();
            self.close_handle();
            if err.raw_os_error() != Some(ERROR_NOT_FOUND as i32) {
                tracing::warn!(
                    target = "pathwatch.rdcw",
                    root = %self.root.display(),
                    error = %err,
                    "failed to cancel watch point"
                );
            }
            // ERROR_NOT_FOUND: the read already completed; nothing pending.
            return false;
        }
        true
    }

    fn close_handle(&mut self) {
        if self.state != WatchState::Finished {
            if unsafe { CloseHandle(self.handle) } == 0 {
                tracing::error!(
                    target = "pathwatch.rdcw",
                    root = %self.root.display(),
                    error = %io::Error::last_os_error(),
                    "failed to close directory handle"
                );
            }
            self.state = WatchState::Finished;
        }
    }

    fn is_valid_directory(&self) -> bool {
        let wide = path::to_wide(&self.root);
        let attributes = unsafe { GetFileAttributesW(wide.as_ptr()) };
        attributes != INVALID_FILE_ATTRIBUTES && attributes & FILE_ATTRIBUTE_DIRECTORY != 0
    }

    fn report(&self, kind: ChangeKind, event_path: &Path) {
        self.sink
            .on_change(kind, &path::strip_long_path_prefix(event_path));
    }

    fn on_completion(&mut self, error_code: u32, bytes_transferred: u32) {
        if error_code == ERROR_OPERATION_ABORTED {
            tracing::debug!(
                target = "pathwatch.rdcw",
                root = %self.root.display(),
                "finished watching"
            );
            self.close_handle();
            return;
        }

        if self.state != WatchState::Listening {
            tracing::debug!(
                target = "pathwatch.rdcw",
                root = %self.root.display(),
                state = ?self.state,
                bytes = bytes_transferred,
                "ignoring events for watch point that is not listening"
            );
            return;
        }
        self.state = WatchState::NotListening;

        if error_code != ERROR_SUCCESS {
            if error_code == ERROR_ACCESS_DENIED && !self.is_valid_directory() {
                let root = self.root.clone();
                self.report(ChangeKind::Removed, &root);
            } else {
                self.sink.on_error(&format!(
                    "error handling events for {}: {}",
                    self.root.display(),
                    io::Error::from_raw_os_error(error_code as i32)
                ));
            }
            self.close_handle();
            return;
        }

        if bytes_transferred == 0 {
            // The OS could not fit the change set into the buffer; the caller
            // has to re-enumerate the subtree.
            tracing::info!(
                target = "pathwatch.rdcw",
                root = %self.root.display(),
                "overflow detected"
            );
            let root = self.root.clone();
            self.report(ChangeKind::Overflowed, &root);
        } else {
            self.handle_events_in_buffer(bytes_transferred as usize);
        }

        match self.listen() {
            ListenOutcome::Listening => {}
            ListenOutcome::Deleted => {
                tracing::debug!(
                    target = "pathwatch.rdcw",
                    root = %self.root.display(),
                    "watched directory removed"
                );
                let root = self.root.clone();
                self.report(ChangeKind::Removed, &root);
            }
            ListenOutcome::Failed(err) => {
                self.sink.on_error(&format!(
                    "failed to re-arm watch for {}: {err}",
                    self.root.display()
                ));
            }
        }
    }

    fn handle_events_in_buffer(&mut self, bytes_transferred: usize) {
        let mut offset = 0usize;
        loop {
            if bytes_transferred.saturating_sub(offset) < mem::size_of::<FILE_NOTIFY_INFORMATION>()
            {
                break;
            }
            let info =
                unsafe { &*(self.buffer.as_ptr().add(offset) as *const FILE_NOTIFY_INFORMATION) };
            let name_units = info.FileNameLength as usize / mem::size_of::<u16>();
            let name = unsafe {
                std::slice::from_raw_parts(info.FileName.as_ptr(), name_units)
            };
            let relative = std::ffi::OsString::from_wide(name);
            let event_path = self.root.join(relative);

            tracing::trace!(
                target = "pathwatch.rdcw",
                action = info.Action,
                path = %event_path.display(),
                "raw event"
            );
            self.report(classify(info.Action), &event_path);

            if info.NextEntryOffset == 0 {
                break;
            }
            offset += info.NextEntryOffset as usize;
        }
    }
}

impl Drop for WatchPoint {
    fn drop(&mut self) {
        // Only reached with no I/O in flight; cancelled watch points that
        // never finished are leaked instead of dropped.
        self.close_handle();
    }
}

fn classify(action: u32) -> ChangeKind {
    match action {
        FILE_ACTION_ADDED | FILE_ACTION_RENAMED_NEW_NAME => ChangeKind::Created,
        FILE_ACTION_REMOVED | FILE_ACTION_RENAMED_OLD_NAME => ChangeKind::Removed,
        FILE_ACTION_MODIFIED => ChangeKind::Modified,
        _ => ChangeKind::Unknown,
    }
}

/// Completion routine for every `ReadDirectoryChangesW` cycle. Runs as an APC
/// on the pump thread, so watch-point state needs no locking.
unsafe extern "system" fn handle_completion(
    error_code: u32,
    bytes_transferred: u32,
    overlapped: *mut OVERLAPPED,
) {
    let watch_point = &mut *((*overlapped).hEvent as *mut WatchPoint);
    watch_point.on_completion(error_code, bytes_transferred);
}

struct Pump {
    watch_points: HashMap<PathBuf, Box<WatchPoint>>,
    buffer_bytes: usize,
    sink: Arc<dyn EventSink>,
    terminated: bool,
}

impl PumpControl for Pump {
    fn register_root(&mut self, root: &Path) -> WatchResult<()> {
        let long_root = path::to_long_path(root);
        if let Some(existing) = self.watch_points.get(&long_root) {
            // A finished watch point (directory deleted and recreated, or a
            // previous failure) may be replaced; a live one may not.
            if existing.state != WatchState::Finished {
                return Err(WatchError::AlreadyWatching(root.to_path_buf()));
            }
            self.watch_points.remove(&long_root);
        }
        let watch_point =
            WatchPoint::open(&long_root, self.buffer_bytes, Arc::clone(&self.sink))?;
        tracing::debug!(
            target = "pathwatch.rdcw",
            root = %root.display(),
            "registered watch root"
        );
        self.watch_points.insert(long_root, watch_point);
        Ok(())
    }

    fn unregister_root(&mut self, root: &Path) -> bool {
        let long_root = path::to_long_path(root);
        match self.watch_points.remove(&long_root) {
            Some(watch_point) => {
                drain_cancel(watch_point);
                tracing::debug!(
                    target = "pathwatch.rdcw",
                    root = %root.display(),
                    "unregistered watch root"
                );
                true
            }
            None => {
                tracing::debug!(
                    target = "pathwatch.rdcw",
                    root = %root.display(),
                    "path is not watched"
                );
                false
            }
        }
    }

    fn terminate(&mut self) {
        self.terminated = true;
    }
}

/// Cancels a watch point and drives alertable sleeps until its aborted
/// completion lands, so the buffer can be freed safely. A watch point that
/// never finishes inside the window is leaked deliberately: the kernel may
/// still write into its buffer.
fn drain_cancel(mut watch_point: Box<WatchPoint>) {
    if watch_point.cancel() {
        let deadline = Instant::now() + CANCEL_DRAIN_WINDOW;
        while watch_point.state != WatchState::Finished && Instant::now() < deadline {
            unsafe { SleepEx(1, 1) };
        }
    }
    match watch_point.state {
        WatchState::Finished | WatchState::NotListening => drop(watch_point),
        state => {
            tracing::warn!(
                target = "pathwatch.rdcw",
                root = %watch_point.root.display(),
                state = ?state,
                "watch point did not finish in time; leaking its buffer"
            );
            mem::forget(watch_point);
        }
    }
}

impl Pump {
    /// Termination protocol: cancel everything still listening, give pending
    /// completions one alertable window to deliver their aborts, then warn
    /// about stragglers.
    fn shutdown(&mut self) {
        tracing::debug!(
            target = "pathwatch.rdcw",
            "run loop finished, cancelling remaining watch points"
        );
        let mut pending = 0usize;
        for watch_point in self.watch_points.values_mut() {
            if watch_point.cancel() {
                pending += 1;
            }
        }

        if pending > 0 {
            tracing::debug!(
                target = "pathwatch.rdcw",
                pending,
                "waiting for pending watch points to finish"
            );
            let deadline = Instant::now() + CANCEL_DRAIN_WINDOW;
            while Instant::now() < deadline
                && self
                    .watch_points
                    .values()
                    .any(|wp| wp.state == WatchState::Cancelled)
            {
                unsafe { SleepEx(1, 1) };
            }
        }

        for (_, watch_point) in self.watch_points.drain() {
            match watch_point.state {
                WatchState::NotListening | WatchState::Finished => drop(watch_point),
                state => {
                    tracing::warn!(
                        target = "pathwatch.rdcw",
                        root = %watch_point.root.display(),
                        state = ?state,
                        "watch point did not finish before termination; leaking its buffer"
                    );
                    mem::forget(watch_point);
                }
            }
        }
    }
}

/// Pump entry point, invoked on the dedicated server thread.
pub(crate) fn run(
    config: WatchConfig,
    commands: channel::Receiver<Command>,
    sink: Arc<dyn EventSink>,
    ready: channel::Sender<io::Result<WakeHandle>>,
) {
    // GetCurrentThread's pseudo-handle is useless to other threads, so the
    // control side gets a real handle instead.
    let thread = unsafe { OpenThread(THREAD_ALL_ACCESS, 0, GetCurrentThreadId()) };
    if thread.is_null() {
        let _ = ready.send(Err(io::Error::last_os_error()));
        return;
    }
    let _ = ready.send(Ok(WakeHandle {
        thread: Arc::new(ThreadHandle(thread)),
    }));

    let mut pump = Pump {
        watch_points: HashMap::new(),
        buffer_bytes: config.clamped_buffer_bytes(),
        sink,
        terminated: false,
    };

    tracing::debug!(target = "pathwatch.rdcw", "pump started");
    while !pump.terminated {
        // Both control wakes and I/O completions arrive as APCs here.
        unsafe { SleepEx(INFINITE, 1) };
        command::drain(&mut pump, &commands);
    }
    pump.shutdown();
    tracing::debug!(target = "pathwatch.rdcw", "pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_map_to_kinds() {
        assert_eq!(classify(FILE_ACTION_ADDED), ChangeKind::Created);
        assert_eq!(classify(FILE_ACTION_RENAMED_NEW_NAME), ChangeKind::Created);
        assert_eq!(classify(FILE_ACTION_REMOVED), ChangeKind::Removed);
        assert_eq!(classify(FILE_ACTION_RENAMED_OLD_NAME), ChangeKind::Removed);
        assert_eq!(classify(FILE_ACTION_MODIFIED), ChangeKind::Modified);
        assert_eq!(classify(0xdead), ChangeKind::Unknown);
    }
}
