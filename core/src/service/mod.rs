//! A supervised service: definition plus live state, logger and runner
//!
//! [`Service`] is a cheap, cloneable handle. Its identity is the handle
//! itself: on a configuration reload a matched service is rebound to the new
//! definition in place, so a running process, its state and its log buffer
//! carry over without copying.

pub mod logger;
pub mod state;

#[cfg(test)]
mod state_tests;

pub use logger::ServiceLogger;
pub use state::{StateMachine, StateSnapshot};

use crate::clock::SharedClock;
use crate::config::resolve_jar_location;
use crate::notifier::{ListenerId, Listeners};
use crate::runner::{ProcessAdapter, ServiceRunner};
use parking_lot::{Mutex, RwLock};
use schema::{LocationType, ServiceEvent, ServiceInfo, ServiceSpec, ServiceState};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::debug;

/// Collaborators shared by all services
#[derive(Clone)]
pub struct ServiceEnv {
    /// Time source
    pub clock: SharedClock,
    /// Event sink; sending never blocks and failures are ignored
    pub events: broadcast::Sender<ServiceEvent>,
    /// Spawns service processes
    pub adapter: Arc<dyn ProcessAdapter>,
}

impl std::fmt::Debug for ServiceEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceEnv")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct Binding {
    spec: Arc<ServiceSpec>,
    root: PathBuf,
    location_type: LocationType,
}

struct ServiceInner {
    binding: RwLock<Binding>,
    file_location: Mutex<Option<PathBuf>>,
    jar_missing_reported: AtomicBool,
    port: Mutex<Option<u16>>,
    group_lead: AtomicBool,
    state: StateMachine,
    logger: ServiceLogger,
    runner: ServiceRunner,
    listeners: Listeners<ServiceState>,
    env: ServiceEnv,
}

/// Handle to a supervised service
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

/// Non-owning service handle
#[derive(Clone)]
pub struct WeakService(Weak<ServiceInner>);

impl WeakService {
    /// The service, unless it was dropped
    pub fn upgrade(&self) -> Option<Service> {
        self.0.upgrade().map(|inner| Service { inner })
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name())
            .field("state", &self.current_state())
            .finish()
    }
}

impl Service {
    /// Create a service; relative paths in `spec` are resolved against `root`
    pub fn new(spec: ServiceSpec, root: impl Into<PathBuf>, env: ServiceEnv) -> Self {
        let now = env.clock.now_ms();
        let location_type = spec.location_type();
        let port = spec.port;
        let service = Self {
            inner: Arc::new(ServiceInner {
                binding: RwLock::new(Binding {
                    spec: Arc::new(spec),
                    root: root.into(),
                    location_type,
                }),
                file_location: Mutex::new(None),
                jar_missing_reported: AtomicBool::new(false),
                port: Mutex::new(port),
                group_lead: AtomicBool::new(false),
                state: StateMachine::new(now),
                logger: ServiceLogger::default(),
                runner: ServiceRunner::default(),
                listeners: Listeners::coalescing(),
                env,
            }),
        };
        *service.inner.file_location.lock() = service.find_jar();
        service
    }

    /// Rebind to a new definition, keeping state, logger and runner
    pub fn rebind(&self, spec: ServiceSpec, root: impl Into<PathBuf>) {
        let location_type = spec.location_type();
        {
            let mut binding = self.inner.binding.write();
            if spec.port.is_some() {
                *self.inner.port.lock() = spec.port;
            }
            binding.spec = Arc::new(spec);
            binding.root = root.into();
            binding.location_type = location_type;
        }
        debug!(service = %self.name(), "Rebound to new definition");
    }

    /// Non-owning handle, for callbacks stored inside the service itself
    pub fn downgrade(&self) -> WeakService {
        WeakService(Arc::downgrade(&self.inner))
    }

    /// Whether both handles refer to the same service
    pub fn same_as(&self, other: &Service) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Service name
    pub fn name(&self) -> String {
        self.inner.binding.read().spec.name.clone()
    }

    /// Current definition
    pub fn spec(&self) -> Arc<ServiceSpec> {
        self.inner.binding.read().spec.clone()
    }

    /// Base directory for relative paths
    pub fn root(&self) -> PathBuf {
        self.inner.binding.read().root.clone()
    }

    /// Location type of the current definition
    pub fn location_type(&self) -> LocationType {
        self.inner.binding.read().location_type
    }

    /// Current state
    pub fn current_state(&self) -> ServiceState {
        self.inner.state.get()
    }

    /// State machine
    pub fn state_machine(&self) -> &StateMachine {
        &self.inner.state
    }

    /// Line buffer and classifier
    pub fn logger(&self) -> &ServiceLogger {
        &self.inner.logger
    }

    /// Runner dispatcher
    pub fn runner(&self) -> &ServiceRunner {
        &self.inner.runner
    }

    /// Shared collaborators
    pub fn env(&self) -> &ServiceEnv {
        &self.inner.env
    }

    /// Current time from the service clock
    pub fn now(&self) -> u64 {
        self.inner.env.clock.now_ms()
    }

    /// Observed or configured port
    pub fn port(&self) -> Option<u16> {
        *self.inner.port.lock()
    }

    /// Set the port; returns whether it changed
    pub(crate) fn set_port(&self, port: Option<u16>) -> bool {
        let mut current = self.inner.port.lock();
        let changed = *current != port;
        *current = port;
        changed
    }

    /// Whether this service may run its group's restart command
    pub fn is_group_lead(&self) -> bool {
        self.inner.group_lead.load(Ordering::Relaxed)
    }

    pub(crate) fn set_group_lead(&self, lead: bool) {
        self.inner.group_lead.store(lead, Ordering::Relaxed);
    }

    /// Register a coalesced state-change listener
    pub fn add_listener(&self, f: impl Fn(&ServiceState) + Send + Sync + 'static) -> ListenerId {
        self.inner.listeners.add(f)
    }

    /// Remove a state-change listener
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    pub(crate) fn notify_changed(&self, state: ServiceState) {
        self.inner.listeners.call(state);
    }

    /// Deliver coalesced notifications and due timers
    pub fn tick(&self) {
        self.inner.state.handle_timers(self);
        self.inner.listeners.flush();
    }

    pub(crate) fn emit(&self, event: ServiceEvent) {
        // no subscribers is fine
        let _ = self.inner.env.events.send(event);
    }

    /// `path` made absolute against the root directory
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root().join(path)
        }
    }

    /// Resolved jar file of a JAR service
    pub fn file_location(&self) -> Option<PathBuf> {
        self.inner.file_location.lock().clone()
    }

    fn find_jar(&self) -> Option<PathBuf> {
        if self.location_type() != LocationType::Jar {
            return None;
        }
        let location = self.spec().location_text()?.to_string();
        resolve_jar_location(&self.resolve_path(&location))
    }

    /// Resolve the jar location again.
    ///
    /// A missing jar is reported once as an init error; the report is
    /// repeated only after the jar was found in between.
    pub fn refresh_file_location(&self) -> Option<PathBuf> {
        let found = self.find_jar();
        *self.inner.file_location.lock() = found.clone();
        if self.location_type() != LocationType::Jar {
            return None;
        }
        match &found {
            Some(_) => self.inner.jar_missing_reported.store(false, Ordering::Relaxed),
            None => {
                if !self.inner.jar_missing_reported.swap(true, Ordering::Relaxed) {
                    let location = self.spec().location_text().unwrap_or_default().to_string();
                    self.logger().error(
                        self,
                        format!("No jar found for {}", self.resolve_path(&location).display()),
                    );
                }
            }
        }
        found
    }

    /// File tailed by the log runner: the location of a LOG service, the
    /// configured `logFile` otherwise
    pub fn log_file_path(&self) -> Option<PathBuf> {
        let spec = self.spec();
        if self.location_type() == LocationType::Log {
            spec.location_text().map(|l| self.resolve_path(l))
        } else {
            spec.log_file.as_deref().map(|l| self.resolve_path(l))
        }
    }

    /// File receiving a copy of all handled lines
    pub fn output_log_path(&self) -> Option<PathBuf> {
        self.spec()
            .output_log_file
            .as_deref()
            .map(|l| self.resolve_path(l))
    }

    /// Working directory for processes: `dir`, else `restartDir`, else the
    /// jar's directory, else the root
    pub fn run_dir(&self) -> PathBuf {
        let spec = self.spec();
        if let Some(dir) = spec.dir.as_deref().or(spec.restart_dir.as_deref()) {
            return self.resolve_path(dir);
        }
        self.file_location()
            .and_then(|jar| jar.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| self.root())
    }

    /// Lines per minute over the last minute
    pub fn log_velocity(&self) -> u64 {
        self.inner.state.log_velocity(self.now())
    }

    /// Live view for collaborators
    pub fn info(&self) -> ServiceInfo {
        let spec = self.spec();
        let snapshot = self.inner.state.snapshot();
        ServiceInfo {
            name: spec.name.clone(),
            label: spec.display_name().to_string(),
            location: spec.location_text().map(str::to_string),
            location_type: self.location_type(),
            state: snapshot.state,
            port: self.port(),
            group: spec.group.clone(),
            depends_on: spec.depends_on.clone(),
            last_error: snapshot.last_error,
            time_last_state_change: snapshot.time_last_state_change,
            time_started: snapshot.time_started,
            time_last_error: snapshot.time_last_error,
            time_since_running_ok: snapshot.time_since_running_ok,
            log_velocity: self.log_velocity(),
            can_be_started: self.inner.runner.can_be_started(self),
            jobs: spec.jobs.keys().cloned().collect(),
        }
    }

    /// Drop all listeners, used when the service is removed
    pub(crate) fn clear_listeners(&self) {
        self.inner.listeners.clear();
    }
}
