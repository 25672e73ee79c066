//! Integration tests for inotify watches fanned out to connections
//!
//! Tests return early when inotify cannot be initialised on the host.

use procwarden::config::types::SupervisorConfig;
use procwarden::events::{AsyncEventType, FileEvent, FileEventType, FileMonitorManager};
use procwarden::Supervisor;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn supervisor_with_files() -> Option<(Supervisor, Arc<FileMonitorManager>)> {
    let sup = Supervisor::init(SupervisorConfig::default()).unwrap();
    match sup.files() {
        Some(files) => {
            let files = Arc::clone(files);
            Some((sup, files))
        }
        None => {
            println!("inotify unavailable, skipping");
            None
        }
    }
}

fn scratch_dir() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("procwarden-watch")
        .tempdir_in("/tmp")
        .unwrap()
}

fn collect_events(files: &FileMonitorManager, conn: i32, wanted: usize) -> Vec<FileEvent> {
    let mut events = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while events.len() < wanted && Instant::now() < deadline {
        files.process_file_events();
        events.extend(files.get_events(conn));
        std::thread::sleep(Duration::from_millis(10));
    }
    events
}

#[test]
fn test_created_file_reaches_both_owners() {
    let Some((sup, files)) = supervisor_with_files() else {
        return;
    };
    let dir = scratch_dir();
    let dir_path = dir.path().to_str().unwrap().to_string();
    sup.register_connection(1);
    sup.register_connection(2);

    assert!(files.monitor().add_watch(1, &dir_path, 0));
    assert!(files.monitor().add_watch(2, &format!("{}/", dir_path), 0));
    assert_eq!(files.monitor().watch_count(), 1);

    std::fs::write(dir.path().join("new.txt"), b"x").unwrap();

    let first = collect_events(&files, 1, 1);
    assert!(first
        .iter()
        .any(|e| e.event_type == FileEventType::Created && e.path == format!("{}/new.txt", dir_path)));
    assert!(files.has_events(2));
    let second = files.get_events(2);
    assert!(second.iter().any(|e| e.name == "new.txt"));

    let bus_events = sup.events().drain_pending();
    assert!(bus_events.iter().any(|e| e.connection_id == 1
        && e.event_type == AsyncEventType::FileChanged
        && e.value == u64::from(FileEventType::Created.bits())));
    sup.shutdown();
}

#[test]
fn test_unsafe_targets_rejected() {
    let Some((sup, files)) = supervisor_with_files() else {
        return;
    };
    let monitor = files.monitor();
    for path in ["/etc", "/proc/self", "relative/dir", "/tmp/../etc", "/tmp//x", "/dev"] {
        assert!(!monitor.add_watch(1, path, 0), "{} accepted", path);
    }
    assert!(!monitor.is_safe_path("/etc/shadow"));
    assert!(monitor.is_safe_path("/tmp/anything"));
    assert_eq!(monitor.watch_count(), 0);
    sup.shutdown();
}

#[test]
fn test_remove_watch_keeps_other_owner() {
    let Some((sup, files)) = supervisor_with_files() else {
        return;
    };
    let dir = scratch_dir();
    let dir_path = dir.path().to_str().unwrap();
    let monitor = files.monitor();
    assert!(monitor.add_watch(1, dir_path, 0));
    assert!(monitor.add_watch(2, dir_path, 0));

    assert!(monitor.remove_watch(1, dir_path));
    assert!(!monitor.remove_watch(1, dir_path));
    assert!(monitor.is_watching(2, dir_path));
    assert_eq!(monitor.watched_paths(2), vec![dir_path.to_string()]);

    sup.cleanup_connection(2);
    assert_eq!(monitor.watch_count(), 0);
    sup.shutdown();
}

#[test]
fn test_modify_event_after_write() {
    let Some((sup, files)) = supervisor_with_files() else {
        return;
    };
    let dir = scratch_dir();
    let file = dir.path().join("data.log");
    std::fs::write(&file, b"start").unwrap();
    sup.register_connection(5);
    assert!(files
        .monitor()
        .add_watch(5, dir.path().to_str().unwrap(), FileEventType::Modified.bits()));

    std::fs::write(&file, b"changed").unwrap();
    let events = collect_events(&files, 5, 1);
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.event_type == FileEventType::Modified));
    sup.shutdown();
}
