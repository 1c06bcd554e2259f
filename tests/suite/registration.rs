use std::path::PathBuf;

use pathwatch::WatchError;

use super::open_server;

#[test]
fn duplicate_registration_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, _sink) = open_server();

    server.register(&[dir.path()]).unwrap();
    let err = server.register(&[dir.path()]).unwrap_err();
    assert!(matches!(err, WatchError::AlreadyWatching(p) if p == dir.path()));

    server.close();
}

#[test]
fn registering_a_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("plain.txt");
    std::fs::File::create(&file).unwrap();

    let (mut server, _sink) = open_server();
    let err = server.register(&[file.as_path()]).unwrap_err();
    assert!(matches!(err, WatchError::NotADirectory(p) if p == file));

    server.close();
}

#[test]
fn registering_a_missing_path_fails() {
    let (mut server, _sink) = open_server();
    let missing = if cfg!(windows) {
        PathBuf::from(r"C:\pathwatch\does\not\exist")
    } else {
        PathBuf::from("/pathwatch/does/not/exist")
    };

    let err = server.register(&[missing.as_path()]).unwrap_err();
    assert!(matches!(err, WatchError::Io { path, .. } if path == missing));

    server.close();
}

#[test]
fn failing_batch_keeps_earlier_roots() {
    let good = tempfile::tempdir().unwrap();
    let bad = good.path().join("missing");
    let never_reached = tempfile::tempdir().unwrap();

    let (mut server, _sink) = open_server();
    let err = server
        .register(&[good.path(), bad.as_path(), never_reached.path()])
        .unwrap_err();
    assert!(matches!(err, WatchError::Io { .. }));

    // The first root survived the aborted batch, the one after the failure
    // was never registered.
    assert!(server.unregister(&[good.path()]).unwrap());
    assert!(!server.unregister(&[never_reached.path()]).unwrap());

    server.close();
}

#[test]
fn unregister_reports_unknown_paths() {
    let watched = tempfile::tempdir().unwrap();
    let unknown = tempfile::tempdir().unwrap();

    let (mut server, _sink) = open_server();
    server.register(&[watched.path()]).unwrap();

    // The unknown path flips the aggregate to false, the known one is still
    // removed.
    assert!(!server
        .unregister(&[unknown.path(), watched.path()])
        .unwrap());
    assert!(!server.unregister(&[watched.path()]).unwrap());

    server.close();
}

#[test]
fn watch_set_tracks_registers_and_unregisters() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let (mut server, _sink) = open_server();
    server.register(&[dir_a.path(), dir_b.path()]).unwrap();
    assert!(server.unregister(&[dir_a.path()]).unwrap());

    // dir_a can come back, dir_b is still held.
    server.register(&[dir_a.path()]).unwrap();
    let err = server.register(&[dir_b.path()]).unwrap_err();
    assert!(matches!(err, WatchError::AlreadyWatching(_)));

    assert!(server.unregister(&[dir_a.path(), dir_b.path()]).unwrap());
    server.close();
}

#[test]
fn commands_after_close_fail_with_terminated() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, _sink) = open_server();
    server.register(&[dir.path()]).unwrap();
    server.close();

    assert!(!server.is_running());
    assert!(matches!(
        server.register(&[dir.path()]),
        Err(WatchError::Terminated)
    ));
    assert!(matches!(
        server.unregister(&[dir.path()]),
        Err(WatchError::Terminated)
    ));
}
