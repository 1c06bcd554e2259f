//! macOS event pump: one `FSEventStream` per watch root, all scheduled on a
//! `CFRunLoop` owned by the pump thread.
//!
//! The control side wakes the pump through a manually-signalled version-0
//! run-loop source; its perform callback drains the command mailbox on the
//! pump thread. The source also keeps the run loop from exiting while no
//! streams are scheduled, so no separate keep-alive timer is needed.
//!
//! FSEvents reports directory-level paths; the contract permits reporting the
//! directory itself even when the change was to a file inside it.

use std::collections::HashMap;
use std::ffi::CStr;
use std::io;
use std::os::raw::{c_char, c_void};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;

use crossbeam_channel as channel;
use fsevent_sys as fs;
use fsevent_sys::core_foundation as cf;

use crate::command::{self, Command, PumpControl};
use crate::config::WatchConfig;
use crate::error::{WatchError, WatchResult};
use crate::event::ChangeKind;
use crate::sink::EventSink;

// Run-loop source plumbing not covered by fsevent-sys.
pub(crate) type CFRunLoopSourceRef = cf::CFRef;

#[repr(C)]
struct CFRunLoopSourceContext {
    version: cf::CFIndex,
    info: *mut c_void,
    retain: Option<extern "C" fn(*const c_void) -> *const c_void>,
    release: Option<extern "C" fn(*const c_void)>,
    copy_description: Option<extern "C" fn(*const c_void) -> cf::CFRef>,
    equal: Option<extern "C" fn(*const c_void, *const c_void) -> cf::Boolean>,
    hash: Option<extern "C" fn(*const c_void) -> usize>,
    schedule: Option<extern "C" fn(*mut c_void, cf::CFRunLoopRef, cf::CFStringRef)>,
    cancel: Option<extern "C" fn(*mut c_void, cf::CFRunLoopRef, cf::CFStringRef)>,
    perform: Option<extern "C" fn(*mut c_void)>,
}

extern "C" {
    fn CFRetain(cf: cf::CFRef) -> cf::CFRef;
    fn CFRunLoopSourceCreate(
        allocator: cf::CFRef,
        order: cf::CFIndex,
        context: *mut CFRunLoopSourceContext,
    ) -> CFRunLoopSourceRef;
    fn CFRunLoopAddSource(
        run_loop: cf::CFRunLoopRef,
        source: CFRunLoopSourceRef,
        mode: cf::CFStringRef,
    );
    fn CFRunLoopSourceInvalidate(source: CFRunLoopSourceRef);
    fn CFRunLoopSourceSignal(source: CFRunLoopSourceRef);
    fn CFRunLoopWakeUp(run_loop: cf::CFRunLoopRef);
}

/// Wakes the pump by signalling its command source and kicking the run loop.
///
/// Both refs are retained, so signalling after the pump thread exited (and
/// invalidated the source) degrades to a no-op instead of a dangling call.
pub(crate) struct WakeHandle {
    run_loop: cf::CFRunLoopRef,
    source: CFRunLoopSourceRef,
}

// Safety: CFRunLoop and CFRunLoopSource are thread-safe CoreFoundation
// objects, and the handle owns a retain count on both.
unsafe impl Send for WakeHandle {}
unsafe impl Sync for WakeHandle {}

impl WakeHandle {
    pub(crate) fn wake(&self) {
        unsafe {
            CFRunLoopSourceSignal(self.source);
            CFRunLoopWakeUp(self.run_loop);
        }
    }
}

impl Clone for WakeHandle {
    fn clone(&self) -> Self {
        unsafe {
            CFRetain(self.run_loop);
            CFRetain(self.source);
        }
        Self {
            run_loop: self.run_loop,
            source: self.source,
        }
    }
}

impl Drop for WakeHandle {
    fn drop(&mut self) {
        unsafe {
            cf::CFRelease(self.source);
            cf::CFRelease(self.run_loop);
        }
    }
}

/// Per-stream context handed to the FSEvents callback. Owned by the stream
/// itself: `release_context` runs when the stream is deallocated.
struct StreamContext {
    root: PathBuf,
    sink: Arc<dyn EventSink>,
}

extern "C" fn release_context(info: *const c_void) {
    unsafe {
        drop(Box::from_raw(info as *mut StreamContext));
    }
}

/// Owns the FSEventStream for one root.
struct WatchPoint {
    stream: fs::FSEventStreamRef,
}

impl WatchPoint {
    fn open(
        run_loop: cf::CFRunLoopRef,
        root: &Path,
        latency: cf::CFTimeInterval,
        sink: Arc<dyn EventSink>,
    ) -> WatchResult<Self> {
        let root_str = root.to_str().ok_or_else(|| {
            WatchError::io(
                root,
                io::Error::new(io::ErrorKind::InvalidInput, "path is not valid UTF-8"),
            )
        })?;

        let context = Box::into_raw(Box::new(StreamContext {
            root: root.to_path_buf(),
            sink,
        }));
        let stream_context = fs::FSEventStreamContext {
            version: 0,
            info: context as *mut c_void,
            retain: None,
            release: Some(release_context),
            copy_description: None,
        };

        let stream = unsafe {
            let paths =
                cf::CFArrayCreateMutable(cf::kCFAllocatorDefault, 0, &cf::kCFTypeArrayCallBacks);
            let mut err: cf::CFErrorRef = ptr::null_mut();
            let cf_path = cf::str_path_to_cfstring_ref(root_str, &mut err);
            if cf_path.is_null() {
                if !err.is_null() {
                    cf::CFRelease(err as cf::CFRef);
                }
                cf::CFRelease(paths);
                // The context box is not owned by any stream yet.
                drop(Box::from_raw(context));
                return Err(WatchError::io(
                    root,
                    io::Error::new(io::ErrorKind::InvalidInput, "path rejected by CoreFoundation"),
                ));
            }
            cf::CFArrayAppendValue(paths, cf_path);
            cf::CFRelease(cf_path);

            let stream = fs::FSEventStreamCreate(
                cf::kCFAllocatorDefault,
                handle_stream_events,
                &stream_context,
                paths,
                fs::kFSEventStreamEventIdSinceNow,
                latency,
                fs::kFSEventStreamCreateFlagNoDefer
                    | fs::kFSEventStreamCreateFlagWatchRoot
                    | fs::kFSEventStreamCreateFlagFileEvents,
            );
            cf::CFRelease(paths);
            stream
        };

        unsafe {
            fs::FSEventStreamScheduleWithRunLoop(stream, run_loop, cf::kCFRunLoopDefaultMode);
            if fs::FSEventStreamStart(stream) == 0 {
                fs::FSEventStreamInvalidate(stream);
                fs::FSEventStreamRelease(stream);
                return Err(WatchError::io(
                    root,
                    io::Error::other("FSEventStreamStart failed"),
                ));
            }
        }

        Ok(Self { stream })
    }
}

impl Drop for WatchPoint {
    fn drop(&mut self) {
        unsafe {
            fs::FSEventStreamStop(self.stream);
            fs::FSEventStreamInvalidate(self.stream);
            fs::FSEventStreamRelease(self.stream);
        }
    }
}

struct Pump {
    run_loop: cf::CFRunLoopRef,
    commands: channel::Receiver<Command>,
    watch_points: HashMap<PathBuf, WatchPoint>,
    sink: Arc<dyn EventSink>,
    latency: cf::CFTimeInterval,
    terminated: bool,
}

impl PumpControl for Pump {
    fn register_root(&mut self, root: &Path) -> WatchResult<()> {
        if self.watch_points.contains_key(root) {
            return Err(WatchError::AlreadyWatching(root.to_path_buf()));
        }
        let watch_point =
            WatchPoint::open(self.run_loop, root, self.latency, Arc::clone(&self.sink))?;
        tracing::debug!(
            target = "pathwatch.fsevents",
            root = %root.display(),
            "registered watch root"
        );
        self.watch_points.insert(root.to_path_buf(), watch_point);
        Ok(())
    }

    fn unregister_root(&mut self, root: &Path) -> bool {
        let removed = self.watch_points.remove(root).is_some();
        if removed {
            tracing::debug!(
                target = "pathwatch.fsevents",
                root = %root.display(),
                "unregistered watch root"
            );
        } else {
            tracing::debug!(
                target = "pathwatch.fsevents",
                root = %root.display(),
                "path is not watched"
            );
        }
        removed
    }

    fn terminate(&mut self) {
        self.terminated = true;
    }
}

/// Perform callback of the command source: runs on the pump thread whenever
/// the control side signals it.
extern "C" fn drain_commands(info: *mut c_void) {
    let pump = unsafe { &mut *(info as *mut Pump) };
    let commands = pump.commands.clone();
    command::drain(pump, &commands);
    if pump.terminated {
        unsafe { cf::CFRunLoopStop(pump.run_loop) };
    }
}

extern "C" fn handle_stream_events(
    _stream: fs::FSEventStreamRef,
    info: *mut c_void,
    num_events: usize,
    event_paths: *mut c_void,
    event_flags: *const fs::FSEventStreamEventFlags,
    _event_ids: *const fs::FSEventStreamEventId,
) {
    let context = unsafe { &*(info as *const StreamContext) };
    let paths = event_paths as *const *const c_char;

    for index in 0..num_events {
        let (raw_path, flags) = unsafe {
            (
                *paths.add(index),
                *event_flags.add(index),
            )
        };
        if raw_path.is_null() {
            continue;
        }
        let bytes = unsafe { CStr::from_ptr(raw_path) }.to_bytes();
        let event_path = Path::new(std::ffi::OsStr::from_bytes(bytes));

        tracing::trace!(
            target = "pathwatch.fsevents",
            root = %context.root.display(),
            path = %event_path.display(),
            flags = format_args!("{flags:#x}"),
            "raw event"
        );
        context.sink.on_change(classify(flags), event_path);
    }
}

fn classify(flags: fs::FSEventStreamEventFlags) -> ChangeKind {
    const DROPPED: fs::FSEventStreamEventFlags = fs::kFSEventStreamEventFlagMustScanSubDirs
        | fs::kFSEventStreamEventFlagUserDropped
        | fs::kFSEventStreamEventFlagKernelDropped;
    const MODIFIED: fs::FSEventStreamEventFlags = fs::kFSEventStreamEventFlagItemModified
        | fs::kFSEventStreamEventFlagItemInodeMetaMod
        | fs::kFSEventStreamEventFlagItemFinderInfoMod
        | fs::kFSEventStreamEventFlagItemChangeOwner
        | fs::kFSEventStreamEventFlagItemXattrMod;

    if flags & DROPPED != 0 {
        ChangeKind::Overflowed
    } else if flags
        & (fs::kFSEventStreamEventFlagItemRemoved | fs::kFSEventStreamEventFlagRootChanged)
        != 0
    {
        ChangeKind::Removed
    } else if flags & fs::kFSEventStreamEventFlagItemCreated != 0 {
        ChangeKind::Created
    } else if flags & MODIFIED != 0 {
        ChangeKind::Modified
    } else {
        ChangeKind::Unknown
    }
}

/// Pump entry point, invoked on the dedicated server thread.
pub(crate) fn run(
    config: WatchConfig,
    commands: channel::Receiver<Command>,
    sink: Arc<dyn EventSink>,
    ready: channel::Sender<io::Result<WakeHandle>>,
) {
    let run_loop = unsafe { cf::CFRunLoopGetCurrent() };

    // The pump is boxed so the raw pointer inside the source context stays
    // valid for the lifetime of the loop.
    let mut pump = Box::new(Pump {
        run_loop,
        commands,
        watch_points: HashMap::new(),
        sink,
        latency: config.clamped_latency().as_secs_f64(),
        terminated: false,
    });

    let mut source_context = CFRunLoopSourceContext {
        version: 0,
        info: &mut *pump as *mut Pump as *mut c_void,
        retain: None,
        release: None,
        copy_description: None,
        equal: None,
        hash: None,
        schedule: None,
        cancel: None,
        perform: Some(drain_commands),
    };

    let source =
        unsafe { CFRunLoopSourceCreate(cf::kCFAllocatorDefault, 0, &mut source_context) };
    if source.is_null() {
        let _ = ready.send(Err(io::Error::other("CFRunLoopSourceCreate failed")));
        return;
    }

    unsafe {
        CFRunLoopAddSource(run_loop, source, cf::kCFRunLoopDefaultMode);
        CFRetain(run_loop);
        CFRetain(source);
    }
    let _ = ready.send(Ok(WakeHandle { run_loop, source }));

    tracing::debug!(target = "pathwatch.fsevents", "pump started");
    // Commands signalled before the loop first runs are sticky: the source
    // stays signalled and performs on entry.
    while !pump.terminated {
        unsafe { cf::CFRunLoopRun() };
    }
    tracing::debug!(target = "pathwatch.fsevents", "pump stopped");

    // Streams must be torn down before the run loop they are scheduled on
    // goes away with this thread.
    pump.watch_points.clear();
    unsafe {
        CFRunLoopSourceInvalidate(source);
        cf::CFRelease(source);
    }
}
