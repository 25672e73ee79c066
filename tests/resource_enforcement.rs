//! Integration tests for per-connection resource policy on live processes

use procwarden::config::types::{SecurityContext, SupervisorConfig};
use procwarden::core::ExternalProcessInfo;
use procwarden::events::AsyncEventType;
use procwarden::observability::audit::SecurityEventType;
use procwarden::resource::{EnforcementAction, ResourceLimitType, SandboxMode};
use procwarden::Supervisor;
use std::time::{Duration, Instant};

fn open_context() -> SecurityContext {
    SecurityContext {
        sandbox_enabled: false,
        drop_privileges: false,
        max_processes: 0,
        ..SecurityContext::default()
    }
}

fn supervisor() -> Supervisor {
    Supervisor::init(SupervisorConfig::default()).unwrap()
}

fn process_state(pid: i32) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let after_comm = stat.rsplit_once(')')?.1;
    after_comm.trim_start().chars().next()
}

fn wait_for_state(pid: i32, wanted: char) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if process_state(pid) == Some(wanted) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn test_wall_time_limit_terminates() {
    let sup = supervisor();
    sup.register_connection(20);
    let resources = sup.resources();
    resources
        .configure_limit(20, ResourceLimitType::WallTime, 0.0, 1.0, EnforcementAction::Terminate)
        .unwrap();
    resources.set_monitoring(20, true, Some(100));

    let mut info = ExternalProcessInfo::new("/bin/sleep", vec!["30".to_string()]);
    assert!(sup.processes().spawn(20, &mut info, &open_context()));
    assert!(resources.is_monitoring(20));

    let code = sup.processes().wait_for_exit(20, Duration::from_secs(15));
    assert_eq!(code, -15);
    assert!(sup.metrics().snapshot().limit_violations >= 1);
    assert!(sup.audit().count_of(SecurityEventType::HardLimitEnforced) >= 1);
    assert!(sup.events().drain_pending().iter().any(|e| {
        e.event_type == AsyncEventType::ProcessError
            && e.value == u64::from(ResourceLimitType::WallTime.code())
    }));
    assert!(resources.resource_statistics(20)["violations"] >= 1.0);
    sup.shutdown();
}

#[test]
fn test_descriptor_limit_reaches_child() {
    let sup = supervisor();
    sup.resources()
        .configure_limit_from_spec(21, ResourceLimitType::FileDescriptors, "16:32:warn")
        .unwrap();
    let mut info = ExternalProcessInfo::new(
        "/bin/sh",
        vec!["-c".to_string(), "ulimit -n".to_string()],
    );
    assert!(sup.processes().spawn(21, &mut info, &open_context()));
    assert_eq!(sup.processes().wait_for_exit(21, Duration::from_secs(5)), 0);

    let mut buf = [0u8; 64];
    let r = sup.processes().read_stdout(21, &mut buf);
    assert!(r.success);
    assert_eq!(String::from_utf8_lossy(&buf[..r.bytes_processed]).trim(), "32");
    sup.shutdown();
}

#[test]
fn test_suspend_and_resume() {
    let sup = supervisor();
    let resources = sup.resources();
    resources.set_monitoring(22, false, None);
    let mut info = ExternalProcessInfo::new("/bin/sleep", vec!["30".to_string()]);
    assert!(sup.processes().spawn(22, &mut info, &open_context()));

    assert!(resources.suspend(22).unwrap());
    assert!(wait_for_state(info.pid, 'T'));
    assert!(resources.config_snapshot(22).unwrap().suspended);

    assert!(resources.resume(22).unwrap());
    assert!(wait_for_state(info.pid, 'S'));
    assert!(!resources.config_snapshot(22).unwrap().suspended);

    assert!(resources.update_usage(22));
    let usage = resources.current_usage(22).unwrap();
    assert_eq!(usage.pid, info.pid);
    assert!(usage.memory_rss_bytes > 0);
    assert_eq!(resources.usage_history(22, 10).len(), 1);

    sup.cleanup_connection(22);
    assert!(!resources.has_config(22));
    assert!(resources.suspend(22).is_err());
    sup.shutdown();
}

#[test]
fn test_sandbox_path_policy() {
    let sup = supervisor();
    let resources = sup.resources();
    assert!(resources
        .configure_sandbox(23, SandboxMode::Strict, vec![], vec![], None)
        .is_err());
    assert!(resources
        .configure_sandbox(23, SandboxMode::Isolated, vec![], vec![], Some("relative".into()))
        .is_err());

    resources
        .configure_sandbox(
            23,
            SandboxMode::Basic,
            vec!["/tmp".into()],
            vec!["/tmp/secret".into()],
            None,
        )
        .unwrap();
    assert!(resources.check_sandbox_path(23, "/tmp/work/file"));
    assert!(!resources.check_sandbox_path(23, "/tmp/secret/key"));
    assert!(!resources.check_sandbox_path(23, "/var/log/syslog"));
    assert!(!resources.check_sandbox_path(23, "/tmp/../etc/passwd"));
    // Unconfigured connections are unrestricted
    assert!(resources.check_sandbox_path(24, "/var/log/syslog"));

    assert!(!resources.child_plan(23).no_new_privs);
    resources
        .configure_sandbox(23, SandboxMode::Restricted, vec![], vec![], None)
        .unwrap();
    let plan = resources.child_plan(23);
    assert!(plan.no_new_privs);
    assert!(plan.chroot.is_none());
    sup.shutdown();
}

#[test]
fn test_invalid_specs_rejected() {
    let sup = supervisor();
    let resources = sup.resources();
    for spec in ["", "0", "10:5:warn", "5:10:explode", "abc"] {
        assert!(
            resources
                .configure_limit_from_spec(25, ResourceLimitType::CpuTime, spec)
                .is_err(),
            "{} accepted",
            spec
        );
    }
    assert!(resources.get_limits(25).is_empty());
    resources
        .configure_limit_from_spec(25, ResourceLimitType::CpuTime, "10")
        .unwrap();
    let limits = resources.get_limits(25);
    assert_eq!(limits.len(), 1);
    assert_eq!(limits[0].action, EnforcementAction::Warn);
    assert!(resources.remove_limit(25, ResourceLimitType::CpuTime));
    sup.shutdown();
}

#[test]
fn test_rss_limit_throttles_child_within_one_interval() {
    let sup = supervisor();
    let resources = sup.resources();
    resources
        .configure_limit(26, ResourceLimitType::MemoryRss, 0.0, 4096.0, EnforcementAction::Throttle)
        .unwrap();
    resources.set_monitoring(26, true, Some(100));

    let started = Instant::now();
    let mut info = ExternalProcessInfo::new("/bin/sleep", vec!["30".to_string()]);
    assert!(sup.processes().spawn(26, &mut info, &open_context()));
    assert!(wait_for_state(info.pid, 'T'));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(sup.processes().is_running(26));
    assert!(sup.audit().count_of(SecurityEventType::HardLimitEnforced) >= 1);

    sup.cleanup_connection(26);
    assert!(!procwarden::kernel::signal::is_alive(info.pid));
    sup.shutdown();
}

#[test]
fn test_cpu_limit_terminates_busy_child() {
    let sup = supervisor();
    sup.register_connection(27);
    let resources = sup.resources();
    resources
        .configure_limit(27, ResourceLimitType::CpuPercent, 0.0, 50.0, EnforcementAction::Terminate)
        .unwrap();
    resources.set_monitoring(27, true, Some(100));

    let started = Instant::now();
    let mut info = ExternalProcessInfo::new(
        "/bin/sh",
        vec!["-c".to_string(), "while :; do :; done".to_string()],
    );
    assert!(sup.processes().spawn(27, &mut info, &open_context()));

    let code = sup.processes().wait_for_exit(27, Duration::from_secs(10));
    assert_eq!(code, -15);
    // Two samples to measure a rate, then SIGTERM
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(sup.events().drain_pending().iter().any(|e| {
        e.event_type == AsyncEventType::ProcessError
            && e.value == u64::from(ResourceLimitType::CpuPercent.code())
    }));
    assert!(resources.config_snapshot(27).unwrap().terminating);
    sup.shutdown();
}
