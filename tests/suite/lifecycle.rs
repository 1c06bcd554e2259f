use std::fs::{self, File};
use std::io::Write;

use pathwatch::ChangeKind;

use super::{open_server, wait_for_change_at, QUIET_WINDOW};

#[test]
fn empty_lifetime_delivers_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, sink) = open_server();
    server.register(&[dir.path()]).unwrap();

    std::thread::sleep(QUIET_WINDOW);
    server.close();

    assert!(sink.drain().is_empty());
}

#[cfg(any(target_os = "linux", windows))]
#[test]
fn single_create_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, sink) = open_server();
    server.register(&[dir.path()]).unwrap();

    let file = dir.path().join("a.txt");
    File::create(&file).unwrap();

    let event = wait_for_change_at(&sink, &file);
    assert_eq!(event.kind, ChangeKind::Created);
    server.close();
}

#[cfg(target_os = "macos")]
#[test]
fn create_is_reported_at_directory_granularity() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, sink) = open_server();
    server.register(&[dir.path()]).unwrap();

    File::create(dir.path().join("a.txt")).unwrap();

    // FSEvents may attribute the change to the file or to its directory,
    // possibly coalesced; either way something beneath the root must arrive.
    let event = sink.next_change(super::EVENT_TIMEOUT).expect("no event");
    assert!(event.path.starts_with(dir.path()) || dir.path().starts_with(&event.path));
    server.close();
}

#[cfg(any(target_os = "linux", windows))]
#[test]
fn modify_and_remove_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("data.bin");
    File::create(&file).unwrap();

    let (mut server, sink) = open_server();
    server.register(&[dir.path()]).unwrap();

    let mut handle = fs::OpenOptions::new().write(true).open(&file).unwrap();
    handle.write_all(b"payload").unwrap();
    handle.sync_all().unwrap();
    drop(handle);

    let event = wait_for_change_at(&sink, &file);
    assert_eq!(event.kind, ChangeKind::Modified);

    fs::remove_file(&file).unwrap();
    // Writes may have produced more than one modification record; the
    // removal must still come through after them.
    loop {
        let event = wait_for_change_at(&sink, &file);
        if event.kind == ChangeKind::Removed {
            break;
        }
        assert_eq!(event.kind, ChangeKind::Modified);
    }

    server.close();
}

#[cfg(any(target_os = "linux", windows))]
#[test]
fn multi_root_events_are_attributed() {
    let dir_one = tempfile::tempdir().unwrap();
    let dir_two = tempfile::tempdir().unwrap();
    let (mut server, sink) = open_server();
    server.register(&[dir_one.path(), dir_two.path()]).unwrap();

    let file_one = dir_one.path().join("one.txt");
    File::create(&file_one).unwrap();
    let event = wait_for_change_at(&sink, &file_one);
    assert_eq!(event.kind, ChangeKind::Created);

    let file_two = dir_two.path().join("two.txt");
    File::create(&file_two).unwrap();
    let event = wait_for_change_at(&sink, &file_two);
    assert_eq!(event.kind, ChangeKind::Created);

    server.close();
}

#[test]
fn no_events_after_unregister_returns() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, sink) = open_server();
    server.register(&[dir.path()]).unwrap();

    assert!(server.unregister(&[dir.path()]).unwrap());
    // Drop whatever was delivered before the unregister completed.
    sink.drain();

    File::create(dir.path().join("late.txt")).unwrap();
    std::thread::sleep(QUIET_WINDOW);
    assert!(sink.drain().is_empty());

    server.close();
}

#[test]
fn close_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, _sink) = open_server();
    server.register(&[dir.path()]).unwrap();

    server.close();
    server.close();
}

#[test]
fn drop_without_close_shuts_down() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _sink) = open_server();
    server.register(&[dir.path()]).unwrap();
    drop(server);
}

#[cfg(any(target_os = "linux", windows))]
#[test]
fn restart_delivers_in_both_cycles() {
    let dir = tempfile::tempdir().unwrap();

    for name in ["first.txt", "second.txt"] {
        let (mut server, sink) = open_server();
        server.register(&[dir.path()]).unwrap();

        let file = dir.path().join(name);
        File::create(&file).unwrap();
        let event = wait_for_change_at(&sink, &file);
        assert_eq!(event.kind, ChangeKind::Created);

        server.close();
        // Nothing else was delivered for this cycle's create.
        assert!(sink.drain().is_empty());
    }
}

/// Open descriptors of this process; parallel tests make the absolute number
/// noisy, so leak checks compare against a slack bound rather than equality.
#[cfg(target_os = "linux")]
fn open_fd_count() -> usize {
    fs::read_dir("/proc/self/fd").unwrap().count()
}

#[cfg(target_os = "linux")]
#[test]
fn repeated_cycles_do_not_leak_descriptors() {
    let dir = tempfile::tempdir().unwrap();
    let baseline = open_fd_count();

    for _ in 0..16 {
        let (mut server, _sink) = open_server();
        server.register(&[dir.path()]).unwrap();
        server.close();
        drop(server);
    }

    let final_count = open_fd_count();
    assert!(
        final_count <= baseline + 8,
        "descriptor count grew from {baseline} to {final_count} over 16 cycles"
    );
}

#[test]
fn no_events_for_changes_before_registration() {
    let dir = tempfile::tempdir().unwrap();
    File::create(dir.path().join("preexisting.txt")).unwrap();

    let (mut server, sink) = open_server();
    server.register(&[dir.path()]).unwrap();

    std::thread::sleep(QUIET_WINDOW);
    assert!(sink.drain().is_empty());
    server.close();
}
