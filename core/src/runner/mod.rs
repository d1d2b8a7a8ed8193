//! Runners: how a service is brought up and observed
//!
//! Which runner is used follows from the location type of the service:
//!
//! - EXE and JAR services are launched as a child process and followed until
//!   they exit.
//! - URL and PORT services run elsewhere and are probed periodically.
//! - LOG services, and any service with a `logFile`, are followed by tailing
//!   the file.
//!
//! At most one process and one poller of each kind run per service.

pub mod adapters;
mod external;
mod logfile;
mod process;

pub use adapters::{
    system_adapter, ManagedProcess, MockInstruction, MockProcessAdapter, OutputStream,
    ProcessAdapter,
};
pub use logfile::{LogTail, TailEvent, MAX_BLOCK};

use crate::process::CommandSpec;
use crate::service::Service;
use crate::utilities::split_command_line;
use crate::{CoreError, Result};
use parking_lot::Mutex;
use process::ProcessControl;
use schema::LocationType;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Control shared between the runner and a polling task
#[derive(Debug)]
pub(crate) struct PollerControl {
    running: AtomicBool,
    reconfigure: AtomicBool,
    wake: Notify,
}

impl PollerControl {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(true),
            reconfigure: AtomicBool::new(false),
            wake: Notify::new(),
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Consume a pending reconfigure request
    pub(crate) fn take_reconfigure(&self) -> bool {
        self.reconfigure.swap(false, Ordering::SeqCst)
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    fn request_reconfigure(&self) {
        self.reconfigure.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Sleep for `duration` unless woken by a stop or reconfigure
    pub(crate) async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.wake.notified() => {}
        }
    }
}

#[derive(Debug)]
struct ProcessSlot {
    generation: u64,
    control: Arc<ProcessControl>,
}

#[derive(Debug, Default)]
struct Slots {
    process: Option<ProcessSlot>,
    external: Option<Arc<PollerControl>>,
    log: Option<Arc<PollerControl>>,
}

/// Starts, stops and tracks the runners of one service
#[derive(Debug, Default)]
pub struct ServiceRunner {
    slots: Mutex<Slots>,
    next_generation: AtomicU64,
    /// Supervising tasks that have not finished, including stopped ones
    live: AtomicUsize,
}

impl ServiceRunner {
    /// Whether `start` would launch anything
    pub fn can_be_started(&self, svc: &Service) -> bool {
        let slots = self.slots.lock();
        match svc.location_type() {
            LocationType::None => false,
            LocationType::Exe | LocationType::Jar => slots.process.is_none(),
            LocationType::Log => slots.log.is_none(),
            LocationType::Url | LocationType::Port => slots.external.is_none(),
        }
    }

    /// Whether a child process is running
    pub fn is_process_running(&self) -> bool {
        self.slots.lock().process.is_some()
    }

    /// Whether a supervising task is still around, e.g. killing a process
    /// that was stopped
    pub fn has_live_process(&self) -> bool {
        self.live.load(Ordering::SeqCst) > 0
    }

    /// Whether a URL/PORT poller is active
    pub fn is_polling(&self) -> bool {
        let slots = self.slots.lock();
        slots.external.is_some() || slots.log.is_some()
    }

    /// Start the runners for the service's location type.
    ///
    /// Runners that are already active are left alone.
    pub fn start(&self, svc: &Service) {
        match svc.location_type() {
            LocationType::None => {
                debug!(service = %svc.name(), "Nothing to start");
            }
            LocationType::Exe => {
                if let Some(command) = self.exe_command(svc) {
                    self.run_process(svc, command);
                }
            }
            LocationType::Jar => {
                if let Some(command) = self.jar_command(svc) {
                    self.run_process(svc, command);
                }
            }
            LocationType::Log => self.start_log(svc),
            LocationType::Url | LocationType::Port => {
                if svc.spec().log_file.is_some() {
                    self.start_log(svc);
                }
                self.start_external(svc);
            }
        }
    }

    /// Run a named job of the service as its process
    pub fn start_job(&self, svc: &Service, job: &str) -> Result<()> {
        let spec = svc.spec();
        let Some(cmd) = spec.jobs.get(job) else {
            return Err(CoreError::UnknownJob {
                service: spec.name.clone(),
                job: job.to_string(),
            });
        };
        if self.is_process_running() {
            return Err(CoreError::ServiceError(format!(
                "Service {} is already running a process",
                spec.name
            )));
        }
        let logger = svc.logger();
        logger.clear(svc);
        logger.log_other(svc, format!("Starting job {job}:"));
        logger.log_other(svc, cmd.clone());
        info!(service = %spec.name, "Starting job {}", job);
        self.run_process(svc, CommandSpec::shell(cmd).in_dir(Some(svc.run_dir())));
        Ok(())
    }

    fn exe_command(&self, svc: &Service) -> Option<CommandSpec> {
        if self.is_process_running() {
            return None;
        }
        let spec = svc.spec();
        let logger = svc.logger();
        logger.clear(svc);
        let Some(cmd) = spec.command_text().map(str::to_string) else {
            logger.error(svc, "No command configured for this service");
            return None;
        };
        logger.log_other(svc, "Starting command:");
        logger.log_other(svc, cmd.clone());
        Some(CommandSpec::shell(&cmd).in_dir(Some(svc.run_dir())))
    }

    fn jar_command(&self, svc: &Service) -> Option<CommandSpec> {
        if self.is_process_running() {
            return None;
        }
        let Some(jar) = svc.file_location().or_else(|| svc.refresh_file_location()) else {
            // refresh_file_location reported the missing jar already
            if svc.current_state() != schema::ServiceState::InitError {
                svc.logger().error(svc, "No jar file found to start");
            }
            return None;
        };
        let spec = svc.spec();
        let dir = svc.run_dir();
        let logger = svc.logger();
        logger.clear(svc);
        logger.log_other(svc, format!("Starting jar in dir {}", dir.display()));

        let mut args = Vec::new();
        if let Some(vm) = spec.vmparams.as_deref() {
            args.extend(split_command_line(vm));
        }
        args.push("-jar".to_string());
        args.push(relative_to(&jar, &dir));
        if let Some(params) = spec.params.as_deref() {
            args.extend(split_command_line(params));
        }
        let java = spec.java.clone().unwrap_or_else(|| "java".to_string());
        let command = CommandSpec::new(java, args).in_dir(Some(dir));
        logger.log_other(svc, command.to_string());
        Some(command)
    }

    fn run_process(&self, svc: &Service, command: CommandSpec) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let control = Arc::new(ProcessControl::default());
        {
            let mut slots = self.slots.lock();
            if slots.process.is_some() {
                return;
            }
            slots.process = Some(ProcessSlot {
                generation,
                control: control.clone(),
            });
            self.live.fetch_add(1, Ordering::SeqCst);
        }
        info!(service = %svc.name(), "Starting {}", command);
        process::launch(svc, command, generation, control);
    }

    fn start_external(&self, svc: &Service) {
        let control = {
            let mut slots = self.slots.lock();
            if slots.external.is_some() {
                return;
            }
            let control = PollerControl::new();
            slots.external = Some(control.clone());
            control
        };
        external::launch(svc, control);
    }

    fn start_log(&self, svc: &Service) {
        let Some(path) = svc.log_file_path() else {
            return;
        };
        let control = {
            let mut slots = self.slots.lock();
            if slots.log.is_some() {
                return;
            }
            let control = PollerControl::new();
            slots.log = Some(control.clone());
            control
        };
        logfile::launch(svc, path, control);
    }

    /// Stop every runner of the service
    pub fn stop(&self, svc: &Service) {
        let (process, external, log) = {
            let mut slots = self.slots.lock();
            (
                slots.process.take(),
                slots.external.take(),
                slots.log.take(),
            )
        };
        let pollers_stopped = external.is_some() || log.is_some();
        for poller in external.iter().chain(log.iter()) {
            poller.stop();
        }
        // the supervising task no longer owns the run, so OFF is final
        if let Some(slot) = &process {
            slot.control.stop();
        }
        if process.is_some() || pollers_stopped {
            svc.state_machine().stopped(svc);
        }
    }

    /// Let pollers pick up a changed definition on their next round
    pub fn reconfigure(&self) {
        let slots = self.slots.lock();
        for poller in slots.external.iter().chain(slots.log.iter()) {
            poller.request_reconfigure();
        }
    }

    /// Called by the supervising task when its process is gone.
    ///
    /// `report` runs only when the run still owns the process slot, under the
    /// slot lock, so a stop or a newer run can not be overwritten by it.
    /// Returns whether it ran.
    pub(crate) fn finish_process(&self, generation: u64, report: impl FnOnce()) -> bool {
        let owned = {
            let mut slots = self.slots.lock();
            let owned = slots
                .process
                .as_ref()
                .is_some_and(|slot| slot.generation == generation);
            if owned {
                report();
                slots.process = None;
            }
            owned
        };
        self.live.fetch_sub(1, Ordering::SeqCst);
        owned
    }
}

/// `path` relative to `dir` when it is inside it, as given otherwise
fn relative_to(path: &Path, dir: &Path) -> String {
    path.strip_prefix(dir)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_to() {
        assert_eq!(
            relative_to(Path::new("/srv/app/app-1.jar"), Path::new("/srv/app")),
            "app-1.jar"
        );
        assert_eq!(
            relative_to(Path::new("/other/app.jar"), Path::new("/srv/app")),
            "/other/app.jar"
        );
    }

    #[tokio::test]
    async fn test_poller_pause_wakes_on_stop() {
        let control = PollerControl::new();
        assert!(control.is_running());
        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.pause(Duration::from_secs(60)).await })
        };
        tokio::task::yield_now().await;
        control.stop();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("pause should end")
            .unwrap();
        assert!(!control.is_running());
    }

    #[tokio::test]
    async fn test_watchdog_restarts_once_per_incident() {
        let adapter = MockProcessAdapter::new();
        adapter.set_fallback(MockInstruction::exits(0).with_stdout("restarting backend\n"));
        let (events, _) = tokio::sync::broadcast::channel(64);
        let env = crate::service::ServiceEnv {
            clock: crate::clock::system_clock(),
            events,
            adapter: Arc::new(adapter.clone()),
        };
        let mut spec = schema::ServiceSpec::new("api", Some("http://127.0.0.1:1/health"));
        spec.restart_cmd = Some("./restart.sh".to_string());
        let svc = Service::new(spec, "/srv/devdash", env);
        svc.set_group_lead(true);
        svc.state_machine().set_waiting(&svc);

        let mut restarting = false;
        external::handle_down_state(&svc, false, &mut restarting);
        assert_eq!(svc.current_state(), schema::ServiceState::Running);

        external::handle_down_state(&svc, true, &mut restarting);
        external::handle_down_state(&svc, true, &mut restarting);
        assert!(restarting);
        assert!(svc.current_state().is_error());
        for _ in 0..100 {
            if !adapter.spawned().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let spawned = adapter.spawned();
        assert_eq!(spawned.len(), 1, "one restart per incident");
        assert!(spawned[0].to_string().contains("./restart.sh"));

        external::handle_down_state(&svc, false, &mut restarting);
        assert!(!restarting);
        assert_eq!(svc.current_state(), schema::ServiceState::Running);
        let texts: Vec<String> = svc.logger().lines().into_iter().map(|l| l.text).collect();
        assert!(texts.iter().any(|t| t == "Service is down."));
        assert!(texts.iter().any(|t| t == "Stopped waiting for restart."));
    }

    #[test]
    fn test_reconfigure_flag_is_consumed() {
        let control = PollerControl::new();
        control.request_reconfigure();
        assert!(control.take_reconfigure());
        assert!(!control.take_reconfigure());
    }
}
