//! Platform event pumps.
//!
//! Each backend exposes the same two items: a `run` function that drives the
//! event loop on the pump thread, and a cloneable `WakeHandle` the control
//! side uses to pop the pump out of its OS wait primitive. Everything else
//! (watch-point resources, raw-event translation, termination) is internal
//! to the backend.

#[cfg(target_os = "linux")]
mod inotify;
#[cfg(target_os = "linux")]
pub(crate) use inotify::{run, WakeHandle};

#[cfg(target_os = "macos")]
mod fsevents;
#[cfg(target_os = "macos")]
pub(crate) use fsevents::{run, WakeHandle};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use self::windows::{run, WakeHandle};

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
compile_error!("pathwatch supports Linux (inotify), macOS (FSEvents) and Windows (ReadDirectoryChangesW)");
