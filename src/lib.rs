//! Cross-platform file-system change notification.
//!
//! `pathwatch` observes a set of registered directory roots through the
//! native notification substrate of the host OS (inotify on Linux, FSEvents
//! on macOS, `ReadDirectoryChangesW` on Windows) and delivers a stream of
//! typed [`ChangeKind`] events to an embedder-supplied [`EventSink`], hiding
//! the substantial differences between the three substrates behind one
//! contract.
//!
//! # Architecture
//!
//! Each [`WatchServer`] owns a dedicated pump thread. Public methods never
//! touch OS watch state themselves: they enqueue a command into a mailbox,
//! wake the pump through a backend-specific mechanism (an eventfd, a run-loop
//! source, a user APC), and block until the pump acknowledges. The pump is
//! the only thread that creates or destroys watch points, translates raw OS
//! events, and invokes the sink, so watch-point state needs no locking.
//!
//! # Event delivery
//!
//! - Within a single root, events arrive in the order the OS reports them.
//!   No ordering is guaranteed across distinct roots.
//! - Backends are allowed to be lossy. When the kernel drops notifications,
//!   the affected roots receive [`ChangeKind::Overflowed`] and consumers must
//!   rescan; there is no way to recover the dropped events.
//! - Paths are reported in the host's canonical form. macOS reports at
//!   directory granularity, so a change to a file may be reported as a change
//!   to its directory. Windows extended-length prefixes are stripped.
//! - No events are delivered for changes that predate registration, and none
//!   are delivered for a root after the `unregister` covering it returns.
//!
//! Recursive watching is whatever the substrate provides: FSEvents and
//! `ReadDirectoryChangesW` cover the whole subtree, inotify covers the
//! registered directory only. Embedders that need uniform recursion on Linux
//! must register subdirectories themselves.
//!
//! # Testing
//!
//! [`RecordingSink`] is a deterministic sink for tests; [`ChannelSink`]
//! adapts delivery into a `crossbeam_channel` stream for embedders that want
//! to consume events from their own loop rather than from a callback.

mod backend;
mod command;
mod config;
mod error;
mod event;
pub mod path;
mod server;
mod sink;

pub use config::WatchConfig;
pub use error::{WatchError, WatchResult};
pub use event::{ChangeEvent, ChangeKind};
pub use server::WatchServer;
pub use sink::{ChannelSink, EventSink, RecordingSink, SinkMessage};
