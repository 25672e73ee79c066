//! Integration tests for the process table: spawn, I/O, timeouts and cleanup
//!
//! Every test uses an open security context so it runs without root.

use nix::sys::signal::Signal;
use procwarden::config::types::{
    SecurityContext, StreamType, SupervisorConfig, EXIT_NOT_FOUND, EXIT_PENDING, EXIT_TIMEOUT,
};
use procwarden::core::ExternalProcessInfo;
use procwarden::events::AsyncEventType;
use procwarden::io::IoRedirectMode;
use procwarden::Supervisor;
use std::time::{Duration, Instant};

fn open_context() -> SecurityContext {
    SecurityContext {
        sandbox_enabled: false,
        drop_privileges: false,
        // RLIMIT_NPROC counts every thread of the test user
        max_processes: 0,
        ..SecurityContext::default()
    }
}

fn supervisor() -> Supervisor {
    Supervisor::init(SupervisorConfig::default()).unwrap()
}

fn read_all_stdout(sup: &Supervisor, conn: i32) -> String {
    let pm = sup.processes();
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let r = pm.read_stdout(conn, &mut buf);
        if r.success {
            out.extend_from_slice(&buf[..r.bytes_processed]);
        } else if r.is_error() {
            break;
        } else {
            std::thread::sleep(Duration::from_millis(5));
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[test]
fn test_spawn_echo_and_collect_exit() {
    let sup = supervisor();
    sup.register_connection(10);
    let mut info = ExternalProcessInfo::new("/bin/echo", vec!["lifecycle".to_string()]);
    assert!(sup.processes().spawn(10, &mut info, &open_context()), "{}", info.error_message);
    assert!(info.pid > 0);
    assert!(info.running);

    assert_eq!(read_all_stdout(&sup, 10), "lifecycle\n");
    assert_eq!(sup.processes().wait_for_exit(10, Duration::from_secs(5)), 0);
    assert_eq!(sup.processes().exit_code(10), 0);
    assert!(!sup.processes().is_running(10));

    let events = sup.events().drain_pending();
    assert!(events
        .iter()
        .any(|e| e.event_type == AsyncEventType::ProcessReady && e.value == info.pid as u64));
    assert!(events.iter().any(|e| e.event_type == AsyncEventType::ProcessExited
        && e.value == info.pid as u64
        && e.data.as_deref() == Some("0")));
    sup.shutdown();
}

#[test]
fn test_second_spawn_on_busy_connection_fails() {
    let sup = supervisor();
    let mut first = ExternalProcessInfo::new("/bin/sleep", vec!["5".to_string()]);
    assert!(sup.processes().spawn(11, &mut first, &open_context()));

    let mut second = ExternalProcessInfo::new("/bin/true", vec![]);
    assert!(!sup.processes().spawn(11, &mut second, &open_context()));
    assert!(second.error_message.contains("already has a running process"));

    sup.processes().cleanup(11);
    assert_eq!(sup.processes().exit_code(11), EXIT_NOT_FOUND);
    sup.processes().cleanup(11);
    sup.shutdown();
}

#[test]
fn test_exec_failure_is_synchronous() {
    let sup = supervisor();
    let mut info = ExternalProcessInfo::new("/nonexistent/binary", vec![]);
    assert!(!sup.processes().spawn(12, &mut info, &open_context()));
    assert!(info.error_message.starts_with("exec failed"), "{}", info.error_message);
    assert_eq!(sup.processes().process_count(), 0);
    assert_eq!(sup.metrics().snapshot().spawn_failures, 1);
    sup.shutdown();
}

#[test]
fn test_timeout_escalates_and_reports() {
    let sup = supervisor();
    let mut info = ExternalProcessInfo::new("/bin/sleep", vec!["30".to_string()]).with_timeout(1);
    assert!(sup.processes().spawn(13, &mut info, &open_context()));
    assert_eq!(sup.processes().exit_code(13), EXIT_PENDING);

    let code = sup.processes().wait_for_exit(13, Duration::from_secs(10));
    assert_eq!(code, EXIT_TIMEOUT);
    let record = sup.processes().process_info(13).unwrap();
    assert!(record.timed_out);
    assert_eq!(record.error_message, "Process timed out");
    assert_eq!(sup.metrics().snapshot().processes_timed_out, 1);
    sup.shutdown();
}

#[test]
fn test_terminate_reports_signal() {
    let sup = supervisor();
    let mut info = ExternalProcessInfo::new("/bin/sleep", vec!["30".to_string()]);
    assert!(sup.processes().spawn(14, &mut info, &open_context()));
    assert!(sup.processes().terminate(14, Signal::SIGTERM));
    assert_eq!(sup.processes().wait_for_exit(14, Duration::from_secs(5)), -15);
    assert!(!sup.processes().terminate(99, Signal::SIGTERM));
    sup.shutdown();
}

#[test]
fn test_stdin_round_trip_through_cat() {
    let sup = supervisor();
    let mut info = ExternalProcessInfo::new("/bin/cat", vec![]);
    assert!(sup.processes().spawn(15, &mut info, &open_context()));
    let written = sup.processes().write_stdin(15, b"piped input");
    assert!(written.success);
    assert_eq!(written.bytes_processed, 11);
    assert!(sup.processes().close_stdin(15));

    assert_eq!(read_all_stdout(&sup, 15), "piped input");
    assert_eq!(sup.processes().wait_for_exit(15, Duration::from_secs(5)), 0);
    sup.shutdown();
}

#[test]
fn test_stdout_to_file_and_merged_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let out_path = dir.path().join("out.txt");
    let out = out_path.to_str().unwrap();

    let sup = supervisor();
    sup.redirector()
        .configure(16, StreamType::Stdout, IoRedirectMode::File, Some(out))
        .unwrap();
    sup.redirector()
        .configure(16, StreamType::Stderr, IoRedirectMode::Merge, None)
        .unwrap();
    let mut info = ExternalProcessInfo::new(
        "/bin/sh",
        vec!["-c".to_string(), "echo to-out; echo to-err >&2".to_string()],
    );
    assert!(sup.processes().spawn(16, &mut info, &open_context()));
    assert_eq!(sup.processes().wait_for_exit(16, Duration::from_secs(5)), 0);

    let content = std::fs::read_to_string(&out_path).unwrap();
    assert!(content.contains("to-out"));
    assert!(content.contains("to-err"));
    let mut buf = [0u8; 16];
    assert!(sup.processes().read_stdout(16, &mut buf).is_error());
    sup.shutdown();
}

#[test]
fn test_cleanup_kills_running_process() {
    let sup = supervisor();
    let mut info = ExternalProcessInfo::new("/bin/sleep", vec!["30".to_string()]);
    assert!(sup.processes().spawn(17, &mut info, &open_context()));
    assert_eq!(sup.processes().active_connections(), vec![17]);

    sup.cleanup_connection(17);
    assert_eq!(sup.processes().process_count(), 0);
    assert!(!procwarden::kernel::signal::is_alive(info.pid));
    sup.shutdown();
}

#[test]
fn test_concurrent_spawns_on_one_connection_track_a_single_child() {
    let sup = supervisor();
    let barrier = std::sync::Barrier::new(2);
    for conn in 40..50 {
        let outcomes: Vec<(bool, i32)> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    s.spawn(|| {
                        let mut info = ExternalProcessInfo::new("/bin/sleep", vec!["3".to_string()]);
                        barrier.wait();
                        let ok = sup.processes().spawn(conn, &mut info, &open_context());
                        (ok, info.pid)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners: Vec<i32> = outcomes.iter().filter(|(ok, _)| *ok).map(|(_, pid)| *pid).collect();
        assert_eq!(winners.len(), 1, "connection {}: {:?}", conn, outcomes);
        assert!(outcomes.iter().filter(|(ok, _)| !*ok).all(|(_, pid)| *pid == -1));
        let tracked = sup.processes().process_info(conn).map(|i| i.pid);
        assert_eq!(tracked, Some(winners[0]));

        sup.cleanup_connection(conn);
        assert!(!procwarden::kernel::signal::is_alive(winners[0]));
    }
    assert_eq!(sup.processes().process_count(), 0);
    sup.shutdown();
}

#[test]
fn test_concurrent_spawns_respect_process_ceiling() {
    let mut config = SupervisorConfig::default();
    config.process.max_processes = 2;
    let sup = Supervisor::init(config).unwrap();
    let barrier = std::sync::Barrier::new(6);
    let spawned = std::thread::scope(|s| {
        let handles: Vec<_> = (60..66)
            .map(|conn| {
                let sup = &sup;
                let barrier = &barrier;
                s.spawn(move || {
                    let mut info = ExternalProcessInfo::new("/bin/sleep", vec!["3".to_string()]);
                    barrier.wait();
                    sup.processes().spawn(conn, &mut info, &open_context())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count()
    });
    assert_eq!(spawned, 2, "{} processes admitted against a ceiling of 2", spawned);
    assert!(sup.processes().running_count() <= 2);
    for conn in 60..66 {
        sup.cleanup_connection(conn);
    }
    sup.shutdown();
}
