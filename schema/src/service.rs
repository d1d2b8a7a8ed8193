//! Service definition and state types for the devdash orchestration engine
//!
//! A service is anything devdash can observe: a process it spawns (an
//! executable command or a jar), a remote endpoint (URL or TCP port) or an
//! external log file. The [`LocationType`] derived from the service's location
//! string decides which of those applies.
//!
//! ## Service Lifecycle
//!
//! - `Off`: nothing running, nothing pending
//! - `Waiting`: queued for start, blocked on dependencies or external up-probe
//! - `Starting`: process launched, "started" line not yet seen
//! - `Running`: up and healthy
//! - `RunningError`: up, but error output was seen recently
//! - `InitError`: failed before it ever came up
//! - `ExitError`: process exited with a nonzero exit code

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Static definition of a service as read from the services file
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Unique name, the identity of the service across reloads
    pub name: String,

    /// Human-readable label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// URL, `[host:]port`, jar path (may contain `*`), log file or command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Command to run; falls back to `location` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Java executable used for jar services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub java: Option<String>,

    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    /// Log file to tail for URL/port services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,

    /// Start automatically when the daemon loads the services file
    #[serde(default)]
    pub start: bool,

    /// Regex that marks the service as started, overriding the default one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_pattern: Option<String>,

    /// Port the service is known to listen on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Program parameters for jar services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<String>,

    /// JVM parameters for jar services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vmparams: Option<String>,

    /// Names of services that must be running before this one starts
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Peer group sharing a restart command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Command run by the watchdog when an external service goes down
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_cmd: Option<String>,

    /// Working directory for `restart_cmd`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_dir: Option<String>,

    /// Poll interval expression, e.g. `"5s"` or `"1m30s"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,

    /// File receiving a copy of all output lines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_log_file: Option<String>,

    /// Maximum size of `output_log_file`, e.g. `"5M"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_log_size: Option<String>,

    /// Treat stderr output as regular output
    #[serde(default)]
    pub err_to_out: bool,

    /// Skip this service in start-all
    #[serde(default)]
    pub exclude_from_start_all: bool,

    /// Regexes whose matches are removed from every output line
    #[serde(default)]
    pub log_deletes: Vec<String>,

    /// Named one-shot commands
    #[serde(default)]
    pub jobs: BTreeMap<String, String>,
}

impl ServiceSpec {
    /// Create a spec with only a name and location
    pub fn new(name: impl Into<String>, location: Option<&str>) -> Self {
        Self {
            name: name.into(),
            location: location.map(str::to_string),
            ..Default::default()
        }
    }

    /// The location, falling back to the command
    pub fn location_text(&self) -> Option<&str> {
        self.location.as_deref().or(self.command.as_deref())
    }

    /// The command, falling back to the location
    pub fn command_text(&self) -> Option<&str> {
        self.command.as_deref().or(self.location.as_deref())
    }

    /// Classify the location of this service
    pub fn location_type(&self) -> LocationType {
        LocationType::classify(self.location_text())
    }

    /// Label if configured, name otherwise
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}

/// Kind of location a service points at
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocationType {
    /// No location configured; the service is never started
    None,
    /// `http://` or `https://` endpoint polled with GET
    Url,
    /// `[host:]port` polled with a TCP connect
    Port,
    /// Jar file started with `java -jar`
    Jar,
    /// Log file that is tailed
    Log,
    /// Anything else: a shell command
    Exe,
}

impl LocationType {
    /// Classify a location string
    pub fn classify(location: Option<&str>) -> Self {
        let Some(location) = location else {
            return LocationType::None;
        };
        if location.starts_with("http://") || location.starts_with("https://") {
            LocationType::Url
        } else if is_port_location(location) {
            LocationType::Port
        } else if location.ends_with(".jar") {
            LocationType::Jar
        } else if location.ends_with(".log")
            || location.ends_with(".txt")
            || location.ends_with(".text")
        {
            LocationType::Log
        } else {
            LocationType::Exe
        }
    }

    /// Whether devdash owns the process of this location type
    pub fn is_process(&self) -> bool {
        matches!(self, LocationType::Exe | LocationType::Jar)
    }

    /// Whether the service is observed from outside (probe or log tail)
    pub fn is_external(&self) -> bool {
        matches!(self, LocationType::Url | LocationType::Port)
    }
}

fn is_port_location(location: &str) -> bool {
    let port = match location.split_once(':') {
        Some((host, port)) if !host.contains(':') && !port.contains(':') => port,
        Some(_) => return false,
        None => location,
    };
    !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit())
}

/// Current state of a service
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    /// Not running
    #[default]
    Off,
    /// Queued, waiting for dependencies or an up-probe
    Waiting,
    /// Launched, not yet reported started
    Starting,
    /// Up and healthy
    Running,
    /// Failed before coming up
    InitError,
    /// Exited with a nonzero exit code
    ExitError,
    /// Up, with recent error output
    RunningError,
}

impl ServiceState {
    /// Starting, running or running with errors
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ServiceState::Starting | ServiceState::Running | ServiceState::RunningError
        )
    }

    /// Init error or running error
    pub fn is_error(&self) -> bool {
        matches!(self, ServiceState::InitError | ServiceState::RunningError)
    }

    /// Running and not in an error state
    pub fn is_running_ok(&self) -> bool {
        self.is_running() && !self.is_error()
    }

    pub fn is_off(&self) -> bool {
        *self == ServiceState::Off
    }

    pub fn is_waiting(&self) -> bool {
        *self == ServiceState::Waiting
    }

    pub fn is_starting(&self) -> bool {
        *self == ServiceState::Starting
    }

    pub fn is_init_error(&self) -> bool {
        *self == ServiceState::InitError
    }

    pub fn is_exit_error(&self) -> bool {
        *self == ServiceState::ExitError
    }

    /// Single-letter code used in the state history timeline
    pub fn letter(&self) -> char {
        match self {
            ServiceState::Off => 'O',
            ServiceState::Waiting => 'W',
            ServiceState::Starting => 'S',
            ServiceState::Running => 'R',
            ServiceState::InitError => 'I',
            ServiceState::ExitError => 'X',
            ServiceState::RunningError => 'E',
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceState::Off => "OFF",
            ServiceState::Waiting => "WAITING",
            ServiceState::Starting => "STARTING",
            ServiceState::Running => "RUNNING",
            ServiceState::InitError => "INIT_ERROR",
            ServiceState::ExitError => "EXIT_ERROR",
            ServiceState::RunningError => "RUNNING_ERROR",
        };
        f.write_str(s)
    }
}

/// Exit information of a finished process
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceExit {
    /// Process id
    pub pid: u32,
    /// Exit code, if the process exited normally
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Signal that terminated the process (Unix only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    /// Exit timestamp in RFC3339 format
    pub timestamp: String,
}

impl ServiceExit {
    /// Whether the process exited with code 0
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Live view of a service, as exposed to collaborators
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    /// Service name
    pub name: String,
    /// Label or name
    pub label: String,
    /// Configured location
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Derived location type
    pub location_type: LocationType,
    /// Current state
    pub state: ServiceState,
    /// Observed port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Group name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Dependencies
    pub depends_on: Vec<String>,
    /// Last error line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Epoch millis of the last state change
    pub time_last_state_change: u64,
    /// Epoch millis of the last (re)start
    pub time_started: u64,
    /// Epoch millis of the last error
    pub time_last_error: u64,
    /// Epoch millis since the service has been running without error
    pub time_since_running_ok: u64,
    /// Lines per minute over the last minute
    pub log_velocity: u64,
    /// Whether the runner could start the service right now
    pub can_be_started: bool,
    /// Names of configured jobs
    pub jobs: Vec<String>,
}
