//! Per-service state machine driven by classified output lines
//!
//! The state is inferred from what a service writes: a "started" line moves
//! a starting service to running, error lines move it to an error state and
//! ordinary output after an error moves it back to running once the error
//! has been quiet for [`ERROR_DEBOUNCE_MS`]. Runners report launch, exit and
//! up/down probes through the same type.
//!
//! Locking: the state data and the output log each have their own mutex.
//! Neither is held while calling into the logger or the notifier.

use super::Service;
use crate::historic_count::HistoricCount;
use crate::output_log::{BoundedFile, DEFAULT_OUTPUT_LOG_MAX_BYTES};
use crate::utilities::parse_size;
use crate::Result;
use parking_lot::Mutex;
use regex::Regex;
use schema::{LocationType, ServiceState};
use std::sync::LazyLock;
use tracing::{info, warn};

/// Minimum quiet time after an error before RUNNING_ERROR may become RUNNING
pub const ERROR_DEBOUNCE_MS: u64 = 4_000;

/// A service counts as just started for this long after `reset`
pub const JUST_STARTED_MS: u64 = 2_000;

/// Window of the log velocity counter
pub const VELOCITY_WINDOW_MS: u64 = 10 * 60 * 1_000;

/// Bucket width of the log velocity counter
pub const VELOCITY_RESOLUTION_MS: u64 = 5_000;

const VELOCITY_PER_MS: u64 = 60 * 1_000;

/// Matches lines that report a started service when no pattern is configured
pub const DEFAULT_STARTED_PATTERN: &str = r"(?i)^.*(Started .*? in \d|Hello from).*$";

static DEFAULT_STARTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(DEFAULT_STARTED_PATTERN).expect("default started pattern"));

static PORT_ANNOUNCEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:started on|initialized with|updating) port[s():]*(?: to)? (\d+)")
        .expect("port pattern")
});

/// Port number announced in a log line, e.g. "Tomcat started on port(s): 8080"
pub fn port_from_line(line: &str) -> Option<u16> {
    PORT_ANNOUNCEMENT
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Point-in-time copy of the state data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub state: ServiceState,
    pub time_last_state_change: u64,
    pub time_started: u64,
    pub time_last_error: u64,
    pub time_since_running_ok: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct StartedPattern {
    text: Option<String>,
    regex: Option<Regex>,
    compile_error: Option<String>,
    error_logged: bool,
}

/// Compile a configured started pattern; it has to match the whole line
pub(crate) fn compile_started_pattern(text: &str) -> Result<Regex> {
    Ok(Regex::new(&format!("^(?:{text})$"))?)
}

#[derive(Debug)]
struct StateData {
    state: ServiceState,
    time_last_state_change: u64,
    time_started: u64,
    time_last_error: u64,
    time_since_running_ok: u64,
    last_error: Option<String>,
    pattern: StartedPattern,
    velocity: HistoricCount,
    pending_running_at: Option<u64>,
}

/// State machine of a single service
#[derive(Debug)]
pub struct StateMachine {
    data: Mutex<StateData>,
    output_log: Mutex<Option<BoundedFile>>,
}

impl StateMachine {
    pub(crate) fn new(now_ms: u64) -> Self {
        Self {
            data: Mutex::new(StateData {
                state: ServiceState::Off,
                time_last_state_change: now_ms,
                time_started: 0,
                time_last_error: 0,
                time_since_running_ok: 0,
                last_error: None,
                pattern: StartedPattern::default(),
                velocity: HistoricCount::new(VELOCITY_WINDOW_MS, VELOCITY_RESOLUTION_MS, now_ms),
                pending_running_at: None,
            }),
            output_log: Mutex::new(None),
        }
    }

    /// Current state
    pub fn get(&self) -> ServiceState {
        self.data.lock().state
    }

    /// Copy of the state data
    pub fn snapshot(&self) -> StateSnapshot {
        let d = self.data.lock();
        StateSnapshot {
            state: d.state,
            time_last_state_change: d.time_last_state_change,
            time_started: d.time_started,
            time_last_error: d.time_last_error,
            time_since_running_ok: d.time_since_running_ok,
            last_error: d.last_error.clone(),
        }
    }

    /// Lines per minute over the last minute
    pub fn log_velocity(&self, now_ms: u64) -> u64 {
        self.data
            .lock()
            .velocity
            .get_within(VELOCITY_PER_MS, now_ms)
    }

    /// Whether a deferred transition to RUNNING is pending
    pub fn has_pending_timer(&self) -> bool {
        self.data.lock().pending_running_at.is_some()
    }

    fn set_state(&self, svc: &Service, new_state: ServiceState, force: bool) -> bool {
        let now = svc.now();
        let old_state = {
            let mut d = self.data.lock();
            let just_started =
                d.time_started == 0 || now.saturating_sub(d.time_started) < JUST_STARTED_MS;

            if new_state == ServiceState::RunningError {
                d.pending_running_at = None;
            }
            // error output is often interleaved with regular output, so leaving
            // RUNNING_ERROR waits for a quiet period
            if new_state == ServiceState::Running
                && d.state == ServiceState::RunningError
                && !force
                && !just_started
                && now.saturating_sub(d.time_last_error) < ERROR_DEBOUNCE_MS
            {
                d.pending_running_at = Some(now + ERROR_DEBOUNCE_MS);
                return false;
            }
            if d.state == new_state {
                return false;
            }

            let old_state = d.state;
            d.pending_running_at = None;
            d.state = new_state;
            d.time_last_state_change = now;
            match new_state {
                ServiceState::Running => d.time_since_running_ok = now,
                ServiceState::RunningError | ServiceState::InitError => d.time_last_error = now,
                ServiceState::Starting => d.pattern.error_logged = false,
                _ => {}
            }
            old_state
        };

        info!(service = %svc.name(), "{} -> {}", old_state, new_state);
        svc.notify_changed(new_state);
        true
    }

    /// Fire the deferred RUNNING transition when it is due
    pub fn handle_timers(&self, svc: &Service) {
        let now = svc.now();
        let due = {
            let mut d = self.data.lock();
            match d.pending_running_at {
                Some(at) if now >= at => {
                    d.pending_running_at = None;
                    true
                }
                _ => false,
            }
        };
        if due {
            self.set_state(svc, ServiceState::Running, true);
        }
    }

    /// Restart the start time and the velocity counter
    pub fn reset(&self, svc: &Service) {
        let now = svc.now();
        {
            let mut d = self.data.lock();
            d.time_started = now;
            d.velocity.reset(now);
        }
        self.close_output_log();
    }

    /// Called right before a process is launched
    pub fn about_to_start(&self, svc: &Service) {
        self.reset(svc);
        self.open_output_log(svc);
        self.set_state(svc, ServiceState::Starting, false);
    }

    /// Set OFF, e.g. before a service is queued for start
    pub fn set_off(&self, svc: &Service) {
        self.set_state(svc, ServiceState::Off, false);
    }

    /// Set WAITING
    pub fn set_waiting(&self, svc: &Service) {
        self.set_state(svc, ServiceState::Waiting, false);
    }

    /// Set RUNNING, subject to the error debounce
    pub fn set_running(&self, svc: &Service) {
        self.set_state(svc, ServiceState::Running, false);
    }

    /// Set RUNNING without debounce, used when an up-probe succeeds
    pub fn set_running_immediately(&self, svc: &Service) {
        self.set_state(svc, ServiceState::Running, true);
    }

    /// Enter an error state.
    ///
    /// A running service goes to RUNNING_ERROR. A service that is not running
    /// goes to INIT_ERROR when devdash launches it as a jar and to
    /// RUNNING_ERROR for every other location type, because those report
    /// errors of a service that runs outside of devdash.
    pub fn set_error(&self, svc: &Service) {
        let running = self.get().is_running();
        let target = if running || svc.location_type() != LocationType::Jar {
            ServiceState::RunningError
        } else {
            ServiceState::InitError
        };
        self.set_state(svc, target, false);
    }

    /// A running process failed: INIT_ERROR while starting, RUNNING_ERROR after
    pub fn set_failed(&self, svc: &Service) {
        let state = self.get();
        let target = if state != ServiceState::Starting && state.is_running() {
            ServiceState::RunningError
        } else {
            ServiceState::InitError
        };
        self.set_state(svc, target, false);
        self.close_output_log();
    }

    /// The service could not be launched
    pub fn set_init_failed(&self, svc: &Service) {
        self.set_state(svc, ServiceState::InitError, false);
        self.close_output_log();
    }

    /// The process exited with a nonzero exit code
    pub fn set_exit_error(&self, svc: &Service) {
        self.set_state(svc, ServiceState::ExitError, true);
        self.close_output_log();
    }

    /// The process ended normally or was stopped
    pub fn stopped(&self, svc: &Service) {
        self.set_state(svc, ServiceState::Off, true);
        self.close_output_log();
    }

    /// WAITING becomes OFF; every other state is kept
    pub fn reset_state(&self, svc: &Service) {
        if self.get() == ServiceState::Waiting {
            self.set_state(svc, ServiceState::Off, false);
        }
    }

    /// Record an observed port; notifies listeners when it changed
    fn update_port(&self, svc: &Service, port: u16) {
        if svc.set_port(Some(port)) {
            svc.notify_changed(self.get());
        }
    }

    /// Count a line towards the velocity and copy it to the output log
    pub(crate) fn record_line(&self, svc: &Service, is_error: bool, line: &str, replaces: bool) {
        self.data.lock().velocity.add(1, svc.now());
        if !replaces {
            self.write_output(if is_error { "!" } else { " " }, line);
        }
    }

    /// Feed a classified output line
    pub fn handle_line(&self, svc: &Service, is_error: bool, line: &str, replaces: bool) {
        self.record_line(svc, is_error, line, replaces);

        let state = self.get();
        if !state.is_running()
            && state != ServiceState::Waiting
            && svc.location_type() == LocationType::Jar
        {
            // output of a jar that is not known to run means it was (re)started
            self.about_to_start(svc);
        }

        let state = self.get();
        if is_error {
            {
                let mut d = self.data.lock();
                if d.state != ServiceState::RunningError {
                    d.last_error = Some(line.to_string());
                }
            }
            self.set_error(svc);
        } else if state == ServiceState::Waiting {
            // waiting for dependencies or a probe; output does not count
        } else if state == ServiceState::Starting {
            if let Some(port) = port_from_line(line) {
                self.update_port(svc, port);
            }
            if self.matches_started(svc, line) {
                self.set_state(svc, ServiceState::Running, false);
            }
        } else if line.starts_with("PROCESS FINISHED") {
            self.set_state(svc, ServiceState::Off, false);
        } else if line.starts_with("\tat ") {
            self.set_error(svc);
        } else {
            self.set_state(svc, ServiceState::Running, false);
        }
    }

    fn matches_started(&self, svc: &Service, line: &str) -> bool {
        let configured = svc.spec().started_pattern.clone();
        let (matched, report) = {
            let mut d = self.data.lock();
            let pattern = &mut d.pattern;
            if pattern.text != configured {
                pattern.text = configured;
                pattern.compile_error = None;
                pattern.regex = match pattern.text.as_deref() {
                    Some(text) => match compile_started_pattern(text) {
                        Ok(regex) => Some(regex),
                        Err(e) => {
                            pattern.compile_error = Some(e.to_string());
                            None
                        }
                    },
                    None => None,
                };
            }
            let report = match (&pattern.compile_error, pattern.error_logged) {
                (Some(e), false) => {
                    pattern.error_logged = true;
                    Some(e.clone())
                }
                _ => None,
            };
            let matched = match &pattern.regex {
                Some(regex) => regex.is_match(line),
                None => DEFAULT_STARTED.is_match(line),
            };
            (matched, report)
        };
        if let Some(error) = report {
            warn!(service = %svc.name(), "Invalid started pattern: {}", error);
            svc.logger().log_other(
                svc,
                format!("[ERROR] startedPattern has error, using default: {error}"),
            );
        }
        matched
    }

    fn open_output_log(&self, svc: &Service) {
        let Some(path) = svc.output_log_path() else {
            return;
        };
        let max_bytes = svc
            .spec()
            .output_log_size
            .as_deref()
            .and_then(parse_size)
            .unwrap_or(DEFAULT_OUTPUT_LOG_MAX_BYTES);
        match BoundedFile::create(&path, max_bytes) {
            Ok(file) => {
                *self.output_log.lock() = Some(file);
                svc.logger()
                    .log_other(svc, format!("Output log file: {}", path.display()));
            }
            Err(e) => {
                warn!(service = %svc.name(), "Unable to open output log: {}", e);
                svc.logger()
                    .log_other(svc, format!("[ERROR] Unable to open output log: {e}"));
            }
        }
    }

    fn write_output(&self, prefix: &str, line: &str) {
        let mut guard = self.output_log.lock();
        if let Some(file) = guard.as_mut() {
            if let Err(e) = file.write(&format!("{prefix}{line}\n")) {
                warn!("Output log {} disabled: {}", file.path().display(), e);
                *guard = None;
            }
        }
    }

    fn close_output_log(&self) {
        self.output_log.lock().take();
    }

    /// Whether an output log file is currently open
    pub fn has_output_log(&self) -> bool {
        self.output_log.lock().is_some()
    }
}
