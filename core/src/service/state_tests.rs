//! Tests for the per-service state machine
//!
//! Time is driven with a `ManualClock`, so the debounce and "just started"
//! windows are exercised without sleeping.

use super::state::{ERROR_DEBOUNCE_MS, JUST_STARTED_MS};
use super::{Service, ServiceEnv};
use crate::clock::{Clock, ManualClock};
use crate::runner::MockProcessAdapter;
use parking_lot::Mutex;
use schema::{LineType, ServiceEvent, ServiceSpec, ServiceState};
use std::sync::Arc;
use tokio::sync::broadcast;

const T0: u64 = 1_700_000_000_000;

struct Fixture {
    clock: Arc<ManualClock>,
    events: broadcast::Receiver<ServiceEvent>,
    svc: Service,
}

fn fixture(spec: ServiceSpec) -> Fixture {
    let clock = Arc::new(ManualClock::new(T0));
    let (tx, events) = broadcast::channel(1024);
    let env = ServiceEnv {
        clock: clock.clone(),
        events: tx,
        adapter: Arc::new(MockProcessAdapter::new()),
    };
    let svc = Service::new(spec, std::env::temp_dir(), env);
    Fixture { clock, events, svc }
}

fn exe_fixture() -> Fixture {
    fixture(ServiceSpec::new("web", Some("./run-web.sh")))
}

/// Bring a service to RUNNING and move past the "just started" window
fn running(f: &Fixture) {
    f.svc.state_machine().about_to_start(&f.svc);
    f.svc
        .logger()
        .handle_out_line(&f.svc, "Started WebApplication in 1.5 seconds", false);
    assert_eq!(f.svc.current_state(), ServiceState::Running);
    f.clock.advance(JUST_STARTED_MS + 1_000);
}

#[test]
fn test_fresh_service_starts_without_errors() {
    let f = exe_fixture();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    f.svc.add_listener(move |s| sink.lock().push(*s));

    assert_eq!(f.svc.current_state(), ServiceState::Off);
    f.svc.state_machine().about_to_start(&f.svc);
    assert_eq!(f.svc.current_state(), ServiceState::Starting);

    f.svc.logger().handle_out_line(&f.svc, "first line", false);
    assert_eq!(f.svc.current_state(), ServiceState::Starting);

    f.svc.logger().handle_out_line(
        &f.svc,
        "[main] Application - Started Application in 12.34 seconds",
        false,
    );
    assert_eq!(f.svc.current_state(), ServiceState::Running);

    f.svc.tick();
    let seen = seen.lock().clone();
    assert_eq!(seen, vec![ServiceState::Starting, ServiceState::Running]);
    let snapshot = f.svc.state_machine().snapshot();
    assert_eq!(snapshot.time_last_error, 0);
    assert_eq!(snapshot.last_error, None);
    assert_eq!(snapshot.time_started, T0);
}

#[test]
fn test_running_error_is_debounced() {
    let f = exe_fixture();
    running(&f);

    f.svc
        .logger()
        .handle_error_line(&f.svc, "something went wrong", false);
    assert_eq!(f.svc.current_state(), ServiceState::RunningError);
    let error_time = f.clock.now_ms();

    f.clock.advance(1_000);
    f.svc.logger().handle_out_line(&f.svc, "all good again", false);
    assert_eq!(f.svc.current_state(), ServiceState::RunningError);
    assert!(f.svc.state_machine().has_pending_timer());

    // the timer counts from the ok line, not from the error
    f.clock.set(error_time + 1_000 + ERROR_DEBOUNCE_MS - 1);
    f.svc.tick();
    assert_eq!(f.svc.current_state(), ServiceState::RunningError);

    f.clock.advance(1);
    f.svc.tick();
    assert_eq!(f.svc.current_state(), ServiceState::Running);
    assert!(!f.svc.state_machine().has_pending_timer());
}

#[test]
fn test_new_error_cancels_pending_running() {
    let f = exe_fixture();
    running(&f);

    f.svc.logger().handle_error_line(&f.svc, "first failure", false);
    f.clock.advance(500);
    f.svc.logger().handle_out_line(&f.svc, "recovering", false);
    assert!(f.svc.state_machine().has_pending_timer());

    f.clock.advance(500);
    f.svc.logger().handle_error_line(&f.svc, "second failure", false);
    assert!(!f.svc.state_machine().has_pending_timer());

    f.clock.advance(ERROR_DEBOUNCE_MS * 2);
    f.svc.tick();
    assert_eq!(f.svc.current_state(), ServiceState::RunningError);
    // only the first error of an incident is kept
    assert_eq!(
        f.svc.state_machine().snapshot().last_error.as_deref(),
        Some("first failure")
    );
}

#[test]
fn test_error_right_after_start_is_not_debounced() {
    let f = exe_fixture();
    f.svc.state_machine().about_to_start(&f.svc);
    f.svc
        .logger()
        .handle_out_line(&f.svc, "Started Application in 2 seconds", false);
    f.svc.logger().handle_error_line(&f.svc, "early warning", false);
    assert_eq!(f.svc.current_state(), ServiceState::RunningError);

    f.clock.advance(100);
    f.svc.logger().handle_out_line(&f.svc, "fine", false);
    assert_eq!(f.svc.current_state(), ServiceState::Running);
}

#[test]
fn test_stack_trace_on_stdout_is_an_error() {
    let f = exe_fixture();
    running(&f);
    f.svc.logger().handle_out_line(
        &f.svc,
        "java.lang.IllegalStateException: broken",
        false,
    );
    assert_eq!(f.svc.current_state(), ServiceState::RunningError);
    let lines = f.svc.logger().lines();
    assert_eq!(lines.last().map(|l| l.line_type), Some(LineType::Error));
}

// Not running: a jar launched by devdash failed to initialize, anything else
// is an external service reporting errors while it runs.
#[test]
fn test_error_state_depends_on_location_type_when_not_running() {
    let exe = exe_fixture();
    exe.svc.state_machine().set_error(&exe.svc);
    assert_eq!(exe.svc.current_state(), ServiceState::RunningError);

    let url = fixture(ServiceSpec::new("api", Some("http://localhost:1/health")));
    url.svc.state_machine().set_error(&url.svc);
    assert_eq!(url.svc.current_state(), ServiceState::RunningError);

    let jar = fixture(ServiceSpec::new("app", Some("app-*.jar")));
    jar.svc.state_machine().set_error(&jar.svc);
    assert_eq!(jar.svc.current_state(), ServiceState::InitError);

    // once running, every type goes to RUNNING_ERROR
    jar.svc.state_machine().about_to_start(&jar.svc);
    jar.svc.state_machine().set_error(&jar.svc);
    assert_eq!(jar.svc.current_state(), ServiceState::RunningError);
}

#[test]
fn test_jar_output_while_off_restarts_tracking() {
    let f = fixture(ServiceSpec::new("app", Some("app.jar")));
    f.clock.advance(10_000);
    f.svc.logger().handle_out_line(&f.svc, "booting", false);
    assert_eq!(f.svc.current_state(), ServiceState::Starting);
    assert_eq!(f.svc.state_machine().snapshot().time_started, T0 + 10_000);
}

#[test]
fn test_reset_state_only_clears_waiting() {
    let f = exe_fixture();
    f.svc.state_machine().set_waiting(&f.svc);
    f.svc.state_machine().reset_state(&f.svc);
    assert_eq!(f.svc.current_state(), ServiceState::Off);

    running(&f);
    f.svc.state_machine().reset_state(&f.svc);
    assert_eq!(f.svc.current_state(), ServiceState::Running);
}

#[test]
fn test_exit_error_is_forced_and_process_finished_turns_off() {
    let f = exe_fixture();
    running(&f);
    f.svc.logger().handle_error_line(&f.svc, "fatal", false);
    f.svc.state_machine().set_exit_error(&f.svc);
    assert_eq!(f.svc.current_state(), ServiceState::ExitError);

    let g = exe_fixture();
    running(&g);
    g.svc.logger().handle_out_line(&g.svc, "PROCESS FINISHED", false);
    assert_eq!(g.svc.current_state(), ServiceState::Off);
}

#[test]
fn test_launch_failure_is_init_error() {
    let f = exe_fixture();
    f.svc.state_machine().about_to_start(&f.svc);
    f.svc.logger().error(&f.svc, "Unable to start ./run-web.sh");
    assert_eq!(f.svc.current_state(), ServiceState::InitError);
    let last = f.svc.logger().lines().pop().unwrap();
    assert_eq!(last.line_type, LineType::InitError);
    assert!(f.svc.state_machine().snapshot().time_last_error > 0);
}

#[test]
fn test_custom_started_pattern() {
    let mut spec = ServiceSpec::new("web", Some("./run.sh"));
    spec.started_pattern = Some("Listening on \\d+".to_string());
    let f = fixture(spec);
    f.svc.state_machine().about_to_start(&f.svc);

    f.svc
        .logger()
        .handle_out_line(&f.svc, "Started Application in 1 seconds", false);
    assert_eq!(f.svc.current_state(), ServiceState::Starting);
    // the pattern must match the whole line
    f.svc
        .logger()
        .handle_out_line(&f.svc, "Listening on 8080 now", false);
    assert_eq!(f.svc.current_state(), ServiceState::Starting);
    f.svc.logger().handle_out_line(&f.svc, "Listening on 8080", false);
    assert_eq!(f.svc.current_state(), ServiceState::Running);
}

#[test]
fn test_invalid_started_pattern_falls_back_and_reports_once() {
    let mut spec = ServiceSpec::new("web", Some("./run.sh"));
    spec.started_pattern = Some("(unclosed".to_string());
    let f = fixture(spec);
    f.svc.state_machine().about_to_start(&f.svc);

    f.svc.logger().handle_out_line(&f.svc, "loading", false);
    f.svc.logger().handle_out_line(&f.svc, "still loading", false);
    assert_eq!(f.svc.current_state(), ServiceState::Starting);
    f.svc
        .logger()
        .handle_out_line(&f.svc, "Started Application in 3 seconds", false);
    assert_eq!(f.svc.current_state(), ServiceState::Running);

    let notices: Vec<_> = f
        .svc
        .logger()
        .lines()
        .into_iter()
        .filter(|l| l.text.starts_with("[ERROR] startedPattern has error"))
        .collect();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].line_type, LineType::Other);
}

#[test]
fn test_port_announcement_updates_port() {
    let f = exe_fixture();
    assert_eq!(f.svc.port(), None);
    f.svc.state_machine().about_to_start(&f.svc);
    f.svc
        .logger()
        .handle_out_line(&f.svc, "Tomcat started on port(s): 1234 (http)", false);
    assert_eq!(f.svc.port(), Some(1234));
    assert_eq!(f.svc.info().port, Some(1234));
}

#[test]
fn test_overwrite_lines_are_not_buffered() {
    let f = exe_fixture();
    f.svc.state_machine().about_to_start(&f.svc);
    f.svc.logger().handle_out_line(&f.svc, "progress 10%", false);
    f.svc.logger().handle_out_line(&f.svc, "progress 50%", true);
    f.svc.logger().handle_out_line(&f.svc, "progress 90%", true);

    let texts: Vec<_> = f.svc.logger().lines().into_iter().map(|l| l.text).collect();
    assert_eq!(texts, vec!["progress 10%"]);
}

#[test]
fn test_velocity_counts_handled_lines_per_minute() {
    let f = exe_fixture();
    f.svc.state_machine().about_to_start(&f.svc);
    for i in 0..30 {
        f.svc.logger().handle_out_line(&f.svc, &format!("line {i}"), false);
    }
    // notices do not count
    f.svc.logger().log_other(&f.svc, "a notice");
    assert_eq!(f.svc.log_velocity(), 30);

    f.clock.advance(2 * 60 * 1_000);
    assert_eq!(f.svc.log_velocity(), 0);
}

#[test]
fn test_output_log_prefixes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logs").join("web.out");
    let mut spec = ServiceSpec::new("web", Some("./run.sh"));
    spec.output_log_file = Some(path.to_string_lossy().into_owned());
    spec.err_to_out = false;
    let f = fixture(spec);

    f.svc.state_machine().about_to_start(&f.svc);
    assert!(f.svc.state_machine().has_output_log());
    f.svc.logger().handle_out_line(&f.svc, "hello", false);
    f.svc.logger().handle_out_line(&f.svc, "overwritten", true);
    f.svc.logger().handle_error_line(&f.svc, "boom", false);
    f.svc.logger().log_other(&f.svc, "not copied");
    f.svc.state_machine().stopped(&f.svc);
    assert!(!f.svc.state_machine().has_output_log());

    assert_eq!(std::fs::read_to_string(&path).unwrap(), " hello\n!boom\n");
}

#[test]
fn test_log_events_are_broadcast() {
    let mut f = exe_fixture();
    f.svc.logger().log_other(&f.svc, "hello");
    f.svc.logger().clear(&f.svc);

    match f.events.try_recv().unwrap() {
        ServiceEvent::LogLine { service, line } => {
            assert_eq!(service, "web");
            assert_eq!(line.text, "hello");
            assert_eq!(line.line_type, LineType::Other);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(matches!(
        f.events.try_recv().unwrap(),
        ServiceEvent::LogCleared { .. }
    ));
    assert!(f.svc.logger().is_empty());
}
