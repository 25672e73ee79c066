//! Integration tests for the command executor through the supervisor

use procwarden::config::presets::restricted_security_context;
use procwarden::config::types::{
    ExitClass, SecurityContext, StringMap, SupervisorConfig, EXIT_TIMEOUT,
};
use procwarden::events::AsyncEventType;
use procwarden::exec::{CommandBuilder, CommandRequest, CommandTemplate};
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
    let mut config = SupervisorConfig::default();
    config.executor.default_security = open_context();
    Supervisor::init(config).unwrap()
}

fn wait_for_result(sup: &Supervisor, id: &str) -> procwarden::exec::CommandResult {
    let deadline = Instant::now() + Duration::from_secs(15);
    while Instant::now() < deadline {
        if let Some(result) = sup.executor().get_result(id) {
            return result;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("command {} never finished", id);
}

#[test]
fn test_sync_execution_captures_output() {
    let sup = supervisor();
    let id = sup.executor().execute_sync(
        CommandBuilder::new("sh")
            .connection(1)
            .args(["-c", "echo out; echo err >&2; exit 0"])
            .timeout(5)
            .build(),
    );
    assert!(procwarden::exec::is_request_id(&id));
    let result = sup.executor().get_result(&id).unwrap();
    assert!(result.success);
    assert_eq!(result.stdout, "out\n");
    assert_eq!(result.stderr, "err\n");
    assert!(result.pid > 0);
    assert!(result.end_time >= result.start_time);
    sup.shutdown();
}

#[test]
fn test_async_requests_run_concurrently() {
    let sup = supervisor();
    let started = Instant::now();
    let ids: Vec<String> = (0..4)
        .map(|_| {
            sup.executor()
                .execute_async(CommandBuilder::new("/bin/sleep").connection(2).arg("1").build())
        })
        .collect();
    assert!(ids.iter().all(|id| !id.is_empty()));
    for id in &ids {
        assert!(wait_for_result(&sup, id).success);
    }
    // Four workers by default, so well under 4 sequential seconds
    assert!(started.elapsed() < Duration::from_millis(3500));
    assert_eq!(sup.executor().results_for_connection(2).len(), 4);
    sup.shutdown();
}

#[test]
fn test_completion_event_carries_request_id() {
    let sup = supervisor();
    sup.register_connection(3);
    let id = sup
        .executor()
        .execute_sync(CommandBuilder::new("/bin/sh").connection(3).args(["-c", "exit 7"]).build());
    let result = sup.executor().get_result(&id).unwrap();
    assert_eq!(result.exit_class(), ExitClass::Exited(7));

    sup.async_events().process_async_events();
    let events = sup.async_events().get_connection_events(3);
    let exited = events
        .iter()
        .find(|e| e.event_type == AsyncEventType::ProcessExited)
        .expect("exit event");
    assert_eq!(exited.value, 7);
    assert_eq!(exited.data.as_deref(), Some(id.as_str()));
    sup.shutdown();
}

#[test]
fn test_timeout_marks_result() {
    let sup = supervisor();
    let id = sup
        .executor()
        .execute_sync(CommandBuilder::new("/bin/sleep").arg("30").timeout(1).build());
    let result = sup.executor().get_result(&id).unwrap();
    assert!(result.timed_out);
    assert!(!result.success);
    assert_eq!(result.exit_code, EXIT_TIMEOUT);
    assert_eq!(result.error_message, "Process timed out");
    // Killed only after running for the full timeout
    assert!(result.execution_time_ms >= 1000, "{}ms", result.execution_time_ms);
    assert!(result.execution_time_ms < 10_000);
    let ran = result.end_time.duration_since(result.start_time).unwrap();
    assert!(ran >= Duration::from_secs(1), "{:?}", ran);
    sup.shutdown();
}

#[test]
fn test_cancel_running_command() {
    let sup = supervisor();
    let id = sup
        .executor()
        .execute_async(CommandBuilder::new("/bin/sleep").arg("30").build());
    let deadline = Instant::now() + Duration::from_secs(5);
    while !sup.executor().is_active(&id) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    std::thread::sleep(Duration::from_millis(100));
    assert!(sup.executor().cancel(&id));
    let result = wait_for_result(&sup, &id);
    assert!(result.cancelled);
    assert_eq!(result.error_message, "Command cancelled");
    assert_eq!(sup.metrics().snapshot().commands_cancelled, 1);
    sup.shutdown();
}

#[test]
fn test_restricted_preset_blocks_unlisted_command() {
    let sup = supervisor();
    let id = sup.executor().execute_sync(
        CommandBuilder::new("/bin/sh")
            .args(["-c", "true"])
            .security(restricted_security_context())
            .build(),
    );
    assert_eq!(id, "");
    assert_eq!(sup.metrics().snapshot().commands_rejected, 1);
    assert!(sup.executor().validate_request(&CommandRequest::new(1, "", vec![])).is_err());
    sup.shutdown();
}

#[test]
fn test_template_execution_and_history() {
    let sup = supervisor();
    let mut template = CommandTemplate::new("word-count", "/usr/bin/wc");
    template.default_args = vec!["-c".into()];
    sup.executor().register_template(template).unwrap();

    let id = sup.executor().execute_template("word-count", 4, &StringMap::new());
    assert!(!id.is_empty());
    let result = sup.executor().get_result(&id).unwrap();
    assert_eq!(result.stdout.trim(), "0");

    sup.executor()
        .execute_sync(CommandBuilder::new("/bin/false").connection(4).build());
    let history = sup.executor().history();
    assert_eq!(history.total, 2);
    assert_eq!(history.succeeded, 1);
    assert_eq!(history.failed, 1);
    assert_eq!(history.by_command.get("/usr/bin/wc"), Some(&1));

    let status = sup.executor().status();
    assert_eq!(status.stored_results, 2);
    assert_eq!(status.templates, vec!["word-count".to_string()]);
    sup.shutdown();
}

#[test]
fn test_shutdown_drops_queue() {
    let mut config = SupervisorConfig::default();
    config.executor.default_security = open_context();
    config.executor.worker_threads = 1;
    config.executor.max_concurrent = 1;
    let sup = Supervisor::init(config).unwrap();

    let running = sup
        .executor()
        .execute_async(CommandBuilder::new("/bin/sleep").arg("30").build());
    let queued = sup
        .executor()
        .execute_async(CommandBuilder::new("/bin/echo").arg("late").build());
    let deadline = Instant::now() + Duration::from_secs(5);
    while !sup.executor().is_active(&running) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }

    sup.shutdown();
    assert!(sup.executor().get_result(&queued).is_none());
    assert!(sup.executor().get_result(&running).map_or(false, |r| r.cancelled));
    assert_eq!(sup.executor().active_count(), 0);
}
