//! Scheduler tests with scripted processes
//!
//! Processes come from `MockProcessAdapter`, so starting, exiting and output
//! are deterministic. Coalesced notifications are delivered by calling
//! `Services::tick`, the way the daemon does.

use crate::clock::system_clock;
use crate::config::LoadedConfig;
use crate::runner::{MockInstruction, MockProcessAdapter};
use crate::scheduler::{Services, StartFlags, StartOptions};
use crate::service::ServiceEnv;
use crate::CoreError;
use schema::{LineType, ServiceEvent, ServiceSpec, ServiceState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const STARTED: &str = "Started Application in 1.2 seconds\n";

fn exe(name: &str) -> ServiceSpec {
    ServiceSpec::new(name, Some(&format!("./{name}.sh")))
}

fn depending(name: &str, deps: &[&str]) -> ServiceSpec {
    let mut spec = exe(name);
    spec.depends_on = deps.iter().map(|d| d.to_string()).collect();
    spec
}

fn config(services: Vec<ServiceSpec>) -> LoadedConfig {
    LoadedConfig {
        port: 8099,
        root: PathBuf::from("/srv/devdash"),
        variables: Default::default(),
        services,
    }
}

fn scheduler(adapter: &MockProcessAdapter, flags: StartFlags) -> Services {
    let (events, _) = broadcast::channel(4096);
    let env = ServiceEnv {
        clock: system_clock(),
        events,
        adapter: Arc::new(adapter.clone()),
    };
    Services::new(env, StartOptions::default(), flags)
}

fn state(services: &Services, name: &str) -> ServiceState {
    services.get(name).unwrap().current_state()
}

/// Tick until `cond` holds, failing after a few seconds
async fn wait_until(services: &Services, what: &str, cond: impl Fn(&Services) -> bool) {
    for _ in 0..500 {
        services.tick();
        if cond(services) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Tick for a while to give the scheduler a chance to do something wrong
async fn settle(services: &Services) {
    for _ in 0..20 {
        services.tick();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_serial_start_one_at_a_time() {
    let adapter = MockProcessAdapter::new();
    // no started line: every process stays STARTING
    adapter.set_fallback(MockInstruction::runs_forever());
    let services = scheduler(&adapter, StartFlags::default());
    services.apply_configuration(config(vec![exe("a"), exe("b"), exe("c")]));

    services.start_all();
    settle(&services).await;

    let starting = services
        .list()
        .iter()
        .filter(|s| s.state == ServiceState::Starting)
        .count();
    assert_eq!(starting, 1);
    assert_eq!(adapter.spawned().len(), 1);
    assert_eq!(state(&services, "b"), ServiceState::Waiting);
    assert_eq!(state(&services, "c"), ServiceState::Waiting);

    let notes: Vec<_> = services
        .log_lines("b")
        .unwrap()
        .into_iter()
        .filter(|l| l.line_type == LineType::Waiting)
        .map(|l| l.text)
        .collect();
    assert!(notes.iter().any(|t| t.contains("no other service is starting")), "{notes:?}");
}

#[tokio::test]
async fn test_serial_start_continues_when_started() {
    let adapter = MockProcessAdapter::new();
    adapter.set_fallback(MockInstruction::runs_forever().with_stdout(STARTED));
    let services = scheduler(&adapter, StartFlags::default());
    services.apply_configuration(config(vec![exe("a"), exe("b"), exe("c")]));

    services.start_all();
    wait_until(&services, "all running", |s| {
        s.list().iter().all(|i| i.state == ServiceState::Running)
    })
    .await;
    assert_eq!(adapter.spawned().len(), 3);
    assert!(services.queued().is_empty());
}

#[tokio::test]
async fn test_parallel_start() {
    let adapter = MockProcessAdapter::new();
    adapter.set_fallback(MockInstruction::runs_forever());
    let services = scheduler(
        &adapter,
        StartFlags {
            parallel: true,
            ignore_deps: false,
        },
    );
    services.apply_configuration(config(vec![exe("a"), exe("b"), exe("c")]));

    services.start_all();
    wait_until(&services, "all starting", |s| {
        s.list().iter().all(|i| i.state == ServiceState::Starting)
    })
    .await;
    assert_eq!(adapter.spawned().len(), 3);
}

#[tokio::test]
async fn test_unmet_dependency_keeps_waiting() {
    let adapter = MockProcessAdapter::new();
    adapter.set_fallback(MockInstruction::runs_forever().with_stdout(STARTED));
    let services = scheduler(&adapter, StartFlags::default());
    services.apply_configuration(config(vec![exe("db"), depending("api", &["db"])]));

    services.start("api", None).unwrap();
    settle(&services).await;
    assert_eq!(state(&services, "api"), ServiceState::Waiting);
    assert!(adapter.spawned().is_empty());
    let texts: Vec<_> = services
        .log_lines("api")
        .unwrap()
        .into_iter()
        .map(|l| l.text)
        .collect();
    assert!(texts.contains(&"Waiting for dependencies:".to_string()));
    assert!(texts.contains(&" - db".to_string()));

    services.start("db", None).unwrap();
    wait_until(&services, "api running", |s| {
        state(s, "api") == ServiceState::Running
    })
    .await;
    assert_eq!(adapter.spawned().len(), 2);
    assert_eq!(adapter.spawned()[0].args.last().unwrap(), "./db.sh");
}

#[tokio::test]
async fn test_ignore_deps_starts_right_away() {
    let adapter = MockProcessAdapter::new();
    adapter.set_fallback(MockInstruction::runs_forever().with_stdout(STARTED));
    let services = scheduler(&adapter, StartFlags::default());
    services.apply_configuration(config(vec![exe("db"), depending("api", &["db"])]));
    services.set_flags(None, Some(true));
    assert!(services.flags().ignore_deps);

    services.start("api", None).unwrap();
    wait_until(&services, "api running", |s| {
        state(s, "api") == ServiceState::Running
    })
    .await;
    assert_eq!(state(&services, "db"), ServiceState::Off);
}

#[tokio::test]
async fn test_unknown_dependency_fails_open() {
    let adapter = MockProcessAdapter::new();
    adapter.set_fallback(MockInstruction::runs_forever().with_stdout(STARTED));
    let services = scheduler(&adapter, StartFlags::default());
    services.apply_configuration(config(vec![depending("api", &["ghost"])]));

    services.start("api", None).unwrap();
    wait_until(&services, "api running", |s| {
        state(s, "api") == ServiceState::Running
    })
    .await;
    // starting clears the log, which drops the notice
    assert_eq!(adapter.spawned().len(), 1);
}

#[tokio::test]
async fn test_unknown_dependency_is_reported_while_waiting() {
    let adapter = MockProcessAdapter::new();
    adapter.set_fallback(MockInstruction::runs_forever());
    let services = scheduler(&adapter, StartFlags::default());
    services.apply_configuration(config(vec![exe("blocker"), depending("api", &["ghost"])]));

    // blocker stays STARTING, so api is queued but cannot start in serial mode
    services.start("blocker", None).unwrap();
    services.start("api", None).unwrap();
    settle(&services).await;
    assert_eq!(state(&services, "api"), ServiceState::Waiting);

    let notices: Vec<_> = services
        .log_lines("api")
        .unwrap()
        .into_iter()
        .filter(|l| l.text == "[ERROR] Unknown dependency: ghost")
        .collect();
    assert_eq!(notices.len(), 1, "reported once, not on every check");
    assert_eq!(notices[0].line_type, LineType::Other);
}

#[tokio::test]
async fn test_exit_codes() {
    let adapter = MockProcessAdapter::new();
    adapter.push(MockInstruction::exits(3).with_stdout(STARTED));
    adapter.push(MockInstruction::exits(0).with_stdout(STARTED));
    let services = scheduler(
        &adapter,
        StartFlags {
            parallel: true,
            ignore_deps: false,
        },
    );
    services.apply_configuration(config(vec![exe("failing"), exe("clean")]));

    services.start("failing", None).unwrap();
    wait_until(&services, "exit error", |s| {
        state(s, "failing") == ServiceState::ExitError
    })
    .await;
    let texts: Vec<_> = services
        .log_lines("failing")
        .unwrap()
        .into_iter()
        .map(|l| l.text)
        .collect();
    assert!(texts.contains(&"PROCESS FINISHED".to_string()));
    assert!(texts.contains(&"Exit code: 3".to_string()));

    services.start("clean", None).unwrap();
    wait_until(&services, "clean exit", |s| {
        state(s, "clean") == ServiceState::Off && !s.get("clean").unwrap().runner().is_process_running()
    })
    .await;
    settle(&services).await;
    assert_eq!(adapter.spawned().len(), 2, "finished services are not restarted");
    assert!(services.queued().is_empty());
}

#[tokio::test]
async fn test_spawn_failure_is_init_error() {
    let adapter = MockProcessAdapter::new();
    adapter.push(MockInstruction::spawn_failure("No such file or directory"));
    let services = scheduler(&adapter, StartFlags::default());
    services.apply_configuration(config(vec![exe("broken")]));

    services.start("broken", None).unwrap();
    wait_until(&services, "init error", |s| {
        state(s, "broken") == ServiceState::InitError
    })
    .await;
    let lines = services.log_lines("broken").unwrap();
    assert!(lines.iter().any(|l| l.text == "FAILED TO START"));
    assert!(lines
        .iter()
        .any(|l| l.line_type == LineType::InitError && l.text.contains("No such file")));
}

#[tokio::test]
async fn test_stop_wins_over_exit() {
    let adapter = MockProcessAdapter::new();
    adapter.set_fallback(MockInstruction::runs_forever().with_stdout(STARTED));
    let services = scheduler(&adapter, StartFlags::default());
    services.apply_configuration(config(vec![exe("web")]));

    services.start("web", None).unwrap();
    wait_until(&services, "running", |s| state(s, "web") == ServiceState::Running).await;

    services.stop("web").unwrap();
    wait_until(&services, "stopped", |s| {
        s.log_lines("web")
            .unwrap()
            .iter()
            .any(|l| l.text == "PROCESS FINISHED")
    })
    .await;
    // killed by a signal, but stopped on request
    assert_eq!(state(&services, "web"), ServiceState::Off);
    assert!(services
        .log_lines("web")
        .unwrap()
        .iter()
        .any(|l| l.text == "Stopping web"));
}

#[tokio::test]
async fn test_stop_then_start_restarts() {
    let adapter = MockProcessAdapter::new();
    adapter.set_fallback(MockInstruction::runs_forever().with_stdout(STARTED));
    let services = scheduler(&adapter, StartFlags::default());
    services.apply_configuration(config(vec![exe("a")]));

    services.start("a", None).unwrap();
    wait_until(&services, "running", |s| state(s, "a") == ServiceState::Running).await;

    services.stop("a").unwrap();
    assert_eq!(state(&services, "a"), ServiceState::Off, "off as soon as stop returns");
    services.start("a", None).unwrap();
    wait_until(&services, "restarted", |s| state(s, "a") == ServiceState::Running).await;
    assert_eq!(adapter.spawned().len(), 2);

    // the stopped run ends meanwhile and must leave the new one alone
    wait_until(&services, "old run finished", |s| {
        s.log_lines("a")
            .unwrap()
            .iter()
            .any(|l| l.text == "PROCESS FINISHED")
    })
    .await;
    settle(&services).await;
    assert_eq!(state(&services, "a"), ServiceState::Running);
    assert!(services.get("a").unwrap().runner().is_process_running());
}

#[tokio::test]
async fn test_exit_code_while_stopping_is_off() {
    let adapter = MockProcessAdapter::new();
    adapter.push(
        MockInstruction::runs_forever()
            .with_stdout(STARTED)
            .exits_when_killed(143),
    );
    let services = scheduler(&adapter, StartFlags::default());
    services.apply_configuration(config(vec![exe("web")]));

    services.start("web", None).unwrap();
    wait_until(&services, "running", |s| state(s, "web") == ServiceState::Running).await;

    services.stop("web").unwrap();
    let svc = services.get("web").unwrap();
    assert!(!svc.runner().is_process_running());
    wait_until(&services, "supervisor done", |_| !svc.runner().has_live_process()).await;

    assert_eq!(state(&services, "web"), ServiceState::Off);
    let lines = services.log_lines("web").unwrap();
    assert!(lines.iter().any(|l| l.text == "PROCESS FINISHED"));
    assert!(!lines.iter().any(|l| l.text.starts_with("Exit code")));
}

#[tokio::test]
async fn test_stop_all_clears_queue() {
    let adapter = MockProcessAdapter::new();
    adapter.set_fallback(MockInstruction::runs_forever());
    let services = scheduler(&adapter, StartFlags::default());
    services.apply_configuration(config(vec![exe("a"), exe("b")]));

    services.start_all();
    settle(&services).await;
    assert_eq!(services.queued(), vec!["b".to_string()]);

    services.stop_all();
    wait_until(&services, "all off", |s| {
        s.list().iter().all(|i| i.state == ServiceState::Off)
    })
    .await;
    assert!(services.queued().is_empty());
}

#[tokio::test]
async fn test_jobs() {
    let adapter = MockProcessAdapter::new();
    adapter.set_fallback(MockInstruction::exits(0).with_stdout("migrated\n"));
    let services = scheduler(&adapter, StartFlags::default());
    let mut spec = depending("api", &["db"]);
    spec.jobs.insert("migrate".to_string(), "./migrate.sh --all".to_string());
    services.apply_configuration(config(vec![exe("db"), spec]));

    // jobs skip the queue and the dependencies
    services.start("api", Some("migrate")).unwrap();
    wait_until(&services, "job finished", |s| {
        !s.get("api").unwrap().runner().is_process_running()
    })
    .await;
    let spawned = adapter.spawned();
    assert_eq!(spawned.len(), 1);
    assert_eq!(spawned[0].args.last().unwrap(), "./migrate.sh --all");
    assert!(services
        .log_lines("api")
        .unwrap()
        .iter()
        .any(|l| l.text == "migrated"));

    let err = services.start("api", Some("deploy")).unwrap_err();
    assert!(matches!(err, CoreError::UnknownJob { .. }));
    let err = services.start("nope", None).unwrap_err();
    assert_eq!(err.code(), "CORE007");
}

#[tokio::test]
async fn test_reload_keeps_running_services() {
    let adapter = MockProcessAdapter::new();
    adapter.set_fallback(MockInstruction::runs_forever().with_stdout(STARTED));
    let services = scheduler(&adapter, StartFlags::default());
    let mut events = services.subscribe();
    services.apply_configuration(config(vec![exe("keep"), exe("drop")]));

    services.start("keep", None).unwrap();
    wait_until(&services, "keep running", |s| {
        state(s, "keep") == ServiceState::Running
    })
    .await;
    services.start("drop", None).unwrap();
    wait_until(&services, "drop running", |s| {
        state(s, "drop") == ServiceState::Running
    })
    .await;
    let keep = services.get("keep").unwrap();

    let mut changed = exe("keep");
    changed.label = Some("Keeper".to_string());
    let summary = services.apply_configuration(config(vec![changed, exe("new")]));
    assert_eq!(summary.kept, vec!["keep".to_string()]);
    assert_eq!(summary.added, vec!["new".to_string()]);
    assert_eq!(summary.removed, vec!["drop".to_string()]);
    assert_eq!(summary.port_changed, None);

    assert!(services.get("keep").unwrap().same_as(&keep));
    assert_eq!(keep.spec().display_name(), "Keeper");
    assert!(keep.runner().is_process_running());
    assert_eq!(state(&services, "keep"), ServiceState::Running);
    assert!(services.get("drop").is_none());
    assert_eq!(state(&services, "new"), ServiceState::Off);
    assert_eq!(adapter.spawned().len(), 2, "nothing restarted");

    let mut reloaded = false;
    while let Ok(event) = events.try_recv() {
        if let ServiceEvent::ServicesReloaded { services, .. } = event {
            reloaded = services == vec!["keep".to_string(), "new".to_string()];
        }
    }
    assert!(reloaded);
}

#[tokio::test]
async fn test_reload_matches_jars_by_location_and_reports_port_change() {
    let adapter = MockProcessAdapter::new();
    let services = scheduler(&adapter, StartFlags::default());
    services.apply_configuration(config(vec![ServiceSpec::new("old-name", Some("app-*.jar"))]));
    let original = services.get("old-name").unwrap();

    let mut next = config(vec![ServiceSpec::new("new-name", Some("app-*.jar"))]);
    next.port = 9000;
    let summary = services.apply_configuration(next);
    assert_eq!(summary.kept, vec!["new-name".to_string()]);
    assert_eq!(summary.port_changed, Some((8099, 9000)));
    assert!(services.get("new-name").unwrap().same_as(&original));
    assert_eq!(services.port(), 9000);
}

#[tokio::test]
async fn test_group_leader_is_first_name() {
    let adapter = MockProcessAdapter::new();
    let services = scheduler(&adapter, StartFlags::default());
    let mut specs = Vec::new();
    for name in ["zeta", "alpha", "mid"] {
        let mut spec = ServiceSpec::new(name, Some("./x.sh"));
        spec.group = Some("backend".to_string());
        specs.push(spec);
    }
    let mut solo = ServiceSpec::new("solo", Some("./solo.sh"));
    solo.restart_cmd = Some("./restart.sh".to_string());
    specs.push(solo);
    specs.push(ServiceSpec::new("plain", Some("./plain.sh")));
    services.apply_configuration(config(specs));

    let leads: Vec<_> = services
        .all()
        .iter()
        .filter(|s| s.is_group_lead())
        .map(|s| s.name())
        .collect();
    assert_eq!(leads, vec!["alpha".to_string(), "solo".to_string()]);
}

#[tokio::test]
async fn test_config_error_persists_until_good_load() {
    let adapter = MockProcessAdapter::new();
    let services = scheduler(&adapter, StartFlags::default());
    services.apply_configuration(config(vec![exe("a")]));

    services.set_config_error("services[0].name: cannot be empty");
    assert_eq!(
        services.config_error().as_deref(),
        Some("services[0].name: cannot be empty")
    );
    assert_eq!(services.names(), vec!["a".to_string()], "last good list kept");

    services.apply_configuration(config(vec![exe("a")]));
    assert_eq!(services.config_error(), None);
}

#[tokio::test]
async fn test_history_and_velocities() {
    let adapter = MockProcessAdapter::new();
    adapter.set_fallback(MockInstruction::runs_forever().with_stdout(&format!("one\ntwo\n{STARTED}")));
    let services = scheduler(&adapter, StartFlags::default());
    services.apply_configuration(config(vec![exe("a"), exe("b")]));

    services.start("a", None).unwrap();
    wait_until(&services, "running", |s| state(s, "a") == ServiceState::Running).await;

    let history = services.history_snapshot();
    assert_eq!(history.len(), 1);
    // notifications are coalesced, so intermediate states may be skipped
    let row = history.values().next().unwrap();
    let (first, second) = row.split_once(',').unwrap();
    assert!(first.starts_with('O') && first.ends_with('R'), "{row}");
    assert_eq!(second, "O");

    assert_eq!(services.log_velocities()["a"], 3);
    assert_eq!(services.log_velocities()["b"], 0);
}

#[tokio::test]
async fn test_set_flags_and_clear_log() {
    let adapter = MockProcessAdapter::new();
    adapter.set_fallback(MockInstruction::runs_forever().with_stdout(STARTED));
    let services = scheduler(&adapter, StartFlags::default());
    let mut events = services.subscribe();
    services.apply_configuration(config(vec![exe("a")]));

    services.set_flags(Some(true), None);
    assert_eq!(
        services.flags(),
        StartFlags {
            parallel: true,
            ignore_deps: false
        }
    );
    services.set_flags(None, Some(true));
    assert!(services.flags().parallel && services.flags().ignore_deps);

    services.start("a", None).unwrap();
    wait_until(&services, "running", |s| state(s, "a") == ServiceState::Running).await;
    assert!(!services.log_lines("a").unwrap().is_empty());

    services.clear_log("a").unwrap();
    assert!(services.log_lines("a").unwrap().is_empty());
    assert!(matches!(
        services.clear_log("ghost"),
        Err(CoreError::UnknownService(_))
    ));

    let mut cleared = false;
    while let Ok(event) = events.try_recv() {
        if let ServiceEvent::LogCleared { service } = event {
            assert_eq!(service, "a");
            cleared = true;
        }
    }
    assert!(cleared);
}
