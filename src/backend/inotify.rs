//! Linux event pump: one inotify instance for all watch roots, plus an
//! eventfd the control side bumps to wake the pump out of `poll(2)`.
//!
//! inotify delivers per-directory events only; recursion is the embedder's
//! concern. Every registered root maps to one watch descriptor, and the pump
//! keeps the reverse descriptor table to attribute raw events back to roots.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel as channel;

use crate::command::{self, Command, PumpControl};
use crate::config::WatchConfig;
use crate::error::{WatchError, WatchResult};
use crate::event::ChangeKind;
use crate::path;
use crate::sink::EventSink;

const EVENT_BUFFER_SIZE: usize = 16 * 1024;

const EVENT_MASK: u32 = libc::IN_CREATE
    | libc::IN_DELETE
    | libc::IN_DELETE_SELF
    | libc::IN_DONT_FOLLOW
    | libc::IN_EXCL_UNLINK
    | libc::IN_MODIFY
    | libc::IN_MOVE_SELF
    | libc::IN_MOVED_FROM
    | libc::IN_MOVED_TO
    | libc::IN_ONLYDIR;

/// Wakes the pump by bumping the eventfd it polls alongside inotify.
#[derive(Clone)]
pub(crate) struct WakeHandle {
    eventfd: Arc<OwnedFd>,
}

impl WakeHandle {
    pub(crate) fn wake(&self) {
        let increment: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.eventfd.as_raw_fd(),
                &increment as *const u64 as *const libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if rc == -1 {
            tracing::warn!(
                target = "pathwatch.inotify",
                error = %io::Error::last_os_error(),
                "failed to wake pump"
            );
        }
    }
}

/// Owns the inotify watch descriptor for one root.
struct WatchPoint {
    wd: i32,
    inotify: RawFd,
    /// Set when the kernel already tore the watch down (`IN_IGNORED`), in
    /// which case `inotify_rm_watch` must not be attempted again.
    defused: bool,
}

impl WatchPoint {
    fn add(inotify: RawFd, root: &Path) -> WatchResult<Self> {
        let native = path::to_native(root).map_err(|err| WatchError::io(root, err))?;
        let wd = unsafe { libc::inotify_add_watch(inotify, native.as_ptr(), EVENT_MASK) };
        if wd == -1 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOTDIR) => WatchError::NotADirectory(root.to_path_buf()),
                _ => WatchError::io(root, err),
            });
        }
        Ok(Self {
            wd,
            inotify,
            defused: false,
        })
    }

    fn defuse(&mut self) {
        self.defused = true;
    }
}

impl Drop for WatchPoint {
    fn drop(&mut self) {
        if self.defused {
            return;
        }
        if unsafe { libc::inotify_rm_watch(self.inotify, self.wd) } != 0 {
            tracing::warn!(
                target = "pathwatch.inotify",
                wd = self.wd,
                error = %io::Error::last_os_error(),
                "failed to remove watch"
            );
        }
    }
}

struct Pump {
    // Watch points must drop before the inotify fd they reference.
    watch_points: HashMap<PathBuf, WatchPoint>,
    /// Reverse table for event attribution: watch descriptor → root.
    roots: HashMap<i32, PathBuf>,
    inotify: OwnedFd,
    wake: Arc<OwnedFd>,
    sink: Arc<dyn EventSink>,
    terminated: bool,
}

impl PumpControl for Pump {
    fn register_root(&mut self, root: &Path) -> WatchResult<()> {
        if self.watch_points.contains_key(root) {
            return Err(WatchError::AlreadyWatching(root.to_path_buf()));
        }
        let watch_point = WatchPoint::add(self.inotify.as_raw_fd(), root)?;
        tracing::debug!(
            target = "pathwatch.inotify",
            root = %root.display(),
            wd = watch_point.wd,
            "registered watch root"
        );
        self.roots.insert(watch_point.wd, root.to_path_buf());
        self.watch_points.insert(root.to_path_buf(), watch_point);
        Ok(())
    }

    fn unregister_root(&mut self, root: &Path) -> bool {
        match self.watch_points.remove(root) {
            Some(watch_point) => {
                self.roots.remove(&watch_point.wd);
                tracing::debug!(
                    target = "pathwatch.inotify",
                    root = %root.display(),
                    wd = watch_point.wd,
                    "unregistered watch root"
                );
                true
            }
            None => {
                tracing::debug!(
                    target = "pathwatch.inotify",
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

#[repr(align(8))]
struct EventBuffer([u8; EVENT_BUFFER_SIZE]);

impl Pump {
    /// One trip through the wait primitive: block in `poll` until the control
    /// side wakes us or inotify has data, then service whichever fired.
    fn poll_once(&mut self, commands: &channel::Receiver<Command>) -> io::Result<()> {
        let mut fds = [
            libc::pollfd {
                fd: self.wake.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.inotify.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        if fds[0].revents & libc::POLLIN != 0 {
            self.reset_wake_counter()?;
            command::drain(self, commands);
        }

        if fds[1].revents & libc::POLLIN != 0 {
            self.read_events()?;
        }

        Ok(())
    }

    fn reset_wake_counter(&self) -> io::Result<()> {
        let mut counter: u64 = 0;
        let rc = unsafe {
            libc::read(
                self.wake.as_raw_fd(),
                &mut counter as *mut u64 as *mut libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        // The counter value does not matter, only that the fd is drained.
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn read_events(&mut self) -> io::Result<()> {
        let mut buffer = EventBuffer([0; EVENT_BUFFER_SIZE]);
        let bytes_read = loop {
            let rc = unsafe {
                libc::read(
                    self.inotify.as_raw_fd(),
                    buffer.0.as_mut_ptr() as *mut libc::c_void,
                    EVENT_BUFFER_SIZE,
                )
            };
            if rc >= 0 {
                break rc as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        let mut index = 0;
        while index + mem::size_of::<libc::inotify_event>() <= bytes_read {
            // Records are variable length: a fixed header followed by
            // `event.len` bytes of NUL-padded name.
            let event =
                unsafe { &*(buffer.0.as_ptr().add(index) as *const libc::inotify_event) };
            let name_offset = index + mem::size_of::<libc::inotify_event>();
            let name_bytes = &buffer.0[name_offset..name_offset + event.len as usize];
            let name = match name_bytes.iter().position(|&b| b == 0) {
                Some(end) => OsStr::from_bytes(&name_bytes[..end]),
                None => OsStr::from_bytes(name_bytes),
            };
            self.handle_event(event.wd, event.mask, name);
            index = name_offset + event.len as usize;
        }
        Ok(())
    }

    fn handle_event(&mut self, wd: i32, mask: u32, name: &OsStr) {
        tracing::trace!(
            target = "pathwatch.inotify",
            wd,
            mask = format_args!("{mask:#x}"),
            name = %Path::new(name).display(),
            "raw event"
        );

        if mask & libc::IN_UNMOUNT != 0 {
            return;
        }

        if mask & libc::IN_Q_OVERFLOW != 0 {
            // Overflow arrives with wd == -1; every root may have lost
            // events, so each one gets invalidated.
            for root in self.watch_points.keys() {
                self.sink.on_change(ChangeKind::Overflowed, root);
            }
            return;
        }

        let Some(root) = self.roots.get(&wd).cloned() else {
            // Stale descriptor: the root was unregistered while the kernel
            // still had events queued for it.
            return;
        };

        if mask & libc::IN_IGNORED != 0 {
            // The kernel is finished with this watch; no further rm_watch.
            tracing::debug!(
                target = "pathwatch.inotify",
                root = %root.display(),
                "watch vanished"
            );
            if let Some(mut watch_point) = self.watch_points.remove(&root) {
                watch_point.defuse();
            }
            self.roots.remove(&wd);
            return;
        }

        let kind = classify(mask);
        let event_path = if name.is_empty() {
            root
        } else {
            root.join(name)
        };
        self.sink.on_change(kind, &event_path);
    }
}

fn classify(mask: u32) -> ChangeKind {
    if mask & (libc::IN_CREATE | libc::IN_MOVED_TO) != 0 {
        ChangeKind::Created
    } else if mask & (libc::IN_DELETE | libc::IN_DELETE_SELF | libc::IN_MOVED_FROM) != 0 {
        ChangeKind::Removed
    } else if mask & libc::IN_MODIFY != 0 {
        ChangeKind::Modified
    } else {
        // IN_MOVE_SELF lands here: the root moved somewhere unknown, and no
        // better classification exists without a fresh registration.
        ChangeKind::Unknown
    }
}

fn create_inotify() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::inotify_init1(libc::IN_CLOEXEC) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn create_eventfd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Pump entry point, invoked on the dedicated server thread.
pub(crate) fn run(
    _config: WatchConfig,
    commands: channel::Receiver<Command>,
    sink: Arc<dyn EventSink>,
    ready: channel::Sender<io::Result<WakeHandle>>,
) {
    let (inotify, eventfd) = match create_inotify().and_then(|i| Ok((i, create_eventfd()?))) {
        Ok(fds) => fds,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    let wake = Arc::new(eventfd);
    let _ = ready.send(Ok(WakeHandle {
        eventfd: Arc::clone(&wake),
    }));

    let mut pump = Pump {
        watch_points: HashMap::new(),
        roots: HashMap::new(),
        inotify,
        wake,
        sink,
        terminated: false,
    };

    tracing::debug!(target = "pathwatch.inotify", "pump started");
    while !pump.terminated {
        if let Err(err) = pump.poll_once(&commands) {
            tracing::error!(
                target = "pathwatch.inotify",
                error = %err,
                "pump loop failed"
            );
            pump.sink.on_error(&format!("event loop failed: {err}"));
            break;
        }
    }
    tracing::debug!(target = "pathwatch.inotify", "pump stopped");

    // Dropping the pump removes every remaining watch, then closes the
    // inotify fd; the eventfd closes once the server drops its wake handle.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_move_in_are_created() {
        assert_eq!(classify(libc::IN_CREATE), ChangeKind::Created);
        assert_eq!(classify(libc::IN_MOVED_TO), ChangeKind::Created);
        assert_eq!(classify(libc::IN_MOVED_TO | libc::IN_ISDIR), ChangeKind::Created);
    }

    #[test]
    fn delete_variants_are_removed() {
        assert_eq!(classify(libc::IN_DELETE), ChangeKind::Removed);
        assert_eq!(classify(libc::IN_DELETE_SELF), ChangeKind::Removed);
        assert_eq!(classify(libc::IN_MOVED_FROM), ChangeKind::Removed);
    }

    #[test]
    fn modify_is_modified() {
        assert_eq!(classify(libc::IN_MODIFY), ChangeKind::Modified);
    }

    #[test]
    fn move_self_is_unknown() {
        assert_eq!(classify(libc::IN_MOVE_SELF), ChangeKind::Unknown);
        assert_eq!(classify(libc::IN_ATTRIB), ChangeKind::Unknown);
    }
}
