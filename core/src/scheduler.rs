//! Dependency-aware start scheduling for all services
//!
//! [`Services`] owns the service list and the start queue. Requests to start
//! a service only put it in the queue; [`Services::check_runs`] decides what
//! can actually be started right now:
//!
//! - queued services that are running, or failed to start, leave the queue
//! - the remaining ones are put in WAITING, with a note on what they wait for
//! - in serial mode nothing starts while any service is STARTING
//! - a WAITING service starts once all its dependencies run without errors
//!
//! `check_runs` is idempotent and runs on every state change, on every
//! control request and on every tick.
//!
//! Locking: the queue lock is taken first and held for the whole of
//! `check_runs`, then the service list, then per-service locks.

use crate::config::LoadedConfig;
use crate::history::ServicesStateHistory;
use crate::service::{Service, ServiceEnv};
use crate::{CoreError, Result};
use parking_lot::{Mutex, RwLock};
use schema::{LineInfo, LocationType, ServiceEvent, ServiceInfo, ServiceSpec, ServiceState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const NO_PARALLEL_NOTE: &str = " - no other service is starting (no parallel)";

/// Global start policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartFlags {
    /// Start all startable services at once instead of one by one
    pub parallel: bool,
    /// Start services without waiting for their dependencies
    pub ignore_deps: bool,
}

/// What happens to services when the first configuration is loaded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Ignore the `start` flag of services
    pub no_auto_start: bool,
    /// Queue every service not excluded from start-all
    pub start_all: bool,
}

/// Result of applying a configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    /// Services kept, possibly with a changed definition
    pub kept: Vec<String>,
    /// Services that were not in the previous configuration
    pub added: Vec<String>,
    /// Services that were stopped and dropped
    pub removed: Vec<String>,
    /// `(old, new)` dashboard port when it changed
    pub port_changed: Option<(u16, u16)>,
}

struct ServicesInner {
    env: ServiceEnv,
    options: StartOptions,
    queue: Mutex<Vec<Service>>,
    services: RwLock<Vec<Service>>,
    root: RwLock<PathBuf>,
    port: Mutex<u16>,
    flags: Mutex<StartFlags>,
    history: Mutex<ServicesStateHistory>,
    config_error: Mutex<Option<String>>,
    loaded: AtomicBool,
}

/// The set of supervised services and their scheduler
#[derive(Clone)]
pub struct Services {
    inner: Arc<ServicesInner>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("services", &self.names())
            .field("flags", &self.flags())
            .finish()
    }
}

impl Services {
    /// Create an empty scheduler; services arrive with [`Services::apply_configuration`]
    pub fn new(env: ServiceEnv, options: StartOptions, flags: StartFlags) -> Self {
        let history = ServicesStateHistory::new(env.clock.clone());
        Self {
            inner: Arc::new(ServicesInner {
                env,
                options,
                queue: Mutex::new(Vec::new()),
                services: RwLock::new(Vec::new()),
                root: RwLock::new(PathBuf::from(".")),
                port: Mutex::new(schema::default_port()),
                flags: Mutex::new(flags),
                history: Mutex::new(history),
                config_error: Mutex::new(None),
                loaded: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.env.events.subscribe()
    }

    fn emit(&self, event: ServiceEvent) {
        let _ = self.inner.env.events.send(event);
    }

    /// Snapshot of the service handles, in configuration order
    pub fn all(&self) -> Vec<Service> {
        self.inner.services.read().clone()
    }

    /// Service names, in configuration order
    pub fn names(&self) -> Vec<String> {
        self.all().iter().map(Service::name).collect()
    }

    /// Look up a service by name
    pub fn get(&self, name: &str) -> Option<Service> {
        self.inner
            .services
            .read()
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }

    fn get_or_err(&self, name: &str) -> Result<Service> {
        self.get(name)
            .ok_or_else(|| CoreError::UnknownService(name.to_string()))
    }

    /// Live view of all services
    pub fn list(&self) -> Vec<ServiceInfo> {
        self.all().iter().map(Service::info).collect()
    }

    /// Buffered log lines of a service
    pub fn log_lines(&self, name: &str) -> Result<Vec<LineInfo>> {
        Ok(self.get_or_err(name)?.logger().lines())
    }

    /// Empty the log buffer of a service
    pub fn clear_log(&self, name: &str) -> Result<()> {
        let svc = self.get_or_err(name)?;
        svc.logger().clear(&svc);
        Ok(())
    }

    /// Names of the services waiting in the start queue
    pub fn queued(&self) -> Vec<String> {
        self.inner.queue.lock().iter().map(Service::name).collect()
    }

    /// Current start policy
    pub fn flags(&self) -> StartFlags {
        *self.inner.flags.lock()
    }

    /// Change the start policy; `None` keeps a flag as it is
    pub fn set_flags(&self, parallel: Option<bool>, ignore_deps: Option<bool>) {
        {
            let mut flags = self.inner.flags.lock();
            if let Some(parallel) = parallel {
                flags.parallel = parallel;
            }
            if let Some(ignore_deps) = ignore_deps {
                flags.ignore_deps = ignore_deps;
            }
            info!(parallel = flags.parallel, ignore_deps = flags.ignore_deps, "Start flags changed");
        }
        self.check_runs();
    }

    /// Dashboard port of the current configuration
    pub fn port(&self) -> u16 {
        *self.inner.port.lock()
    }

    /// Base directory of the current configuration
    pub fn root(&self) -> PathBuf {
        self.inner.root.read().clone()
    }

    /// Last configuration error, until a good configuration is applied
    pub fn config_error(&self) -> Option<String> {
        self.inner.config_error.lock().clone()
    }

    /// Report a failed configuration load; the current services stay as they are
    pub fn set_config_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("Configuration error: {}", message);
        *self.inner.config_error.lock() = Some(message.clone());
        self.emit(ServiceEvent::configuration_error(Some(message)));
    }

    fn clear_config_error(&self) {
        if self.inner.config_error.lock().take().is_some() {
            self.emit(ServiceEvent::configuration_error(None));
        }
    }

    /// Start a service, or one of its jobs.
    ///
    /// Without a job the service is queued and started once its dependencies
    /// run. A job runs right away as the service's process.
    pub fn start(&self, name: &str, job: Option<&str>) -> Result<()> {
        let svc = self.get_or_err(name)?;
        if !svc.current_state().is_running() {
            svc.state_machine().set_off(&svc);
        }
        if let Some(job) = job {
            return svc.runner().start_job(&svc, job);
        }
        {
            let mut queue = self.inner.queue.lock();
            if !queue.iter().any(|s| s.same_as(&svc)) {
                queue.push(svc);
            }
        }
        self.check_runs();
        Ok(())
    }

    /// Remove a service from the queue and stop its runners
    pub fn stop(&self, name: &str) -> Result<()> {
        let svc = self.get_or_err(name)?;
        self.inner.queue.lock().retain(|s| !s.same_as(&svc));
        svc.runner().stop(&svc);
        svc.state_machine().reset_state(&svc);
        self.check_runs();
        Ok(())
    }

    /// Queue every service that is not excluded from start-all
    pub fn start_all(&self) {
        info!("Start all");
        {
            let mut queue = self.inner.queue.lock();
            for svc in self.all() {
                if svc.spec().exclude_from_start_all || queue.iter().any(|s| s.same_as(&svc)) {
                    continue;
                }
                queue.push(svc);
            }
            for svc in queue.iter() {
                if !svc.current_state().is_running() {
                    svc.state_machine().set_off(svc);
                }
            }
        }
        self.check_runs();
    }

    /// Empty the queue and stop every runner
    pub fn stop_all(&self) {
        info!("Stop all");
        self.clear_start();
        for svc in self.all() {
            svc.runner().stop(&svc);
        }
    }

    /// Empty the queue; services waiting in it go back to OFF
    pub fn clear_start(&self) {
        let mut queue = self.inner.queue.lock();
        queue.clear();
        for svc in self.all() {
            svc.state_machine().reset_state(&svc);
        }
    }

    /// Start what can be started now
    pub fn check_runs(&self) {
        let mut queue = self.inner.queue.lock();
        queue.retain(|s| {
            let state = s.current_state();
            !(state.is_running() || state.is_init_error() || state.is_exit_error())
        });
        if queue.is_empty() {
            return;
        }

        let flags = self.flags();
        let services = self.all();
        for svc in queue.iter() {
            let state = svc.current_state();
            if !state.is_waiting() && !state.is_init_error() {
                self.update_waiting_state(svc, flags, &services);
            }
        }

        if !flags.parallel
            && services
                .iter()
                .any(|s| s.current_state().is_starting())
        {
            return;
        }

        let limit = if flags.parallel { usize::MAX } else { 1 };
        let ready: Vec<Service> = queue
            .iter()
            .filter(|s| s.current_state().is_waiting())
            .filter(|s| s.runner().can_be_started(s))
            .filter(|s| self.dependencies_running(s, flags, &services))
            .take(limit)
            .cloned()
            .collect();
        for svc in ready {
            debug!(service = %svc.name(), "Dependencies met, starting");
            queue.retain(|s| !s.same_as(&svc));
            svc.runner().start(&svc);
        }
    }

    /// Resolve the dependencies of `svc`; unknown names are reported and
    /// skipped
    fn dependencies(&self, svc: &Service, flags: StartFlags, services: &[Service]) -> Vec<Service> {
        if flags.ignore_deps {
            return Vec::new();
        }
        let quiet = svc.current_state().is_waiting();
        svc.spec()
            .depends_on
            .iter()
            .filter_map(|dep| {
                let found = services.iter().find(|s| s.name() == *dep).cloned();
                if found.is_none() && !quiet {
                    warn!(service = %svc.name(), "Unknown dependency: {}", dep);
                    svc.logger()
                        .log_other(svc, format!("[ERROR] Unknown dependency: {dep}"));
                }
                found
            })
            .collect()
    }

    fn dependencies_running(&self, svc: &Service, flags: StartFlags, services: &[Service]) -> bool {
        self.dependencies(svc, flags, services).iter().all(|dep| {
            let state = dep.current_state();
            state.is_running_ok() && !state.is_starting()
        })
    }

    fn update_waiting_state(&self, svc: &Service, flags: StartFlags, services: &[Service]) {
        let deps = self.dependencies(svc, flags, services);
        let logger = svc.logger();
        if deps.is_empty() {
            if !flags.parallel {
                logger.log_waiting(svc, NO_PARALLEL_NOTE);
            }
            if flags.ignore_deps {
                logger.log_waiting(svc, "Ignoring dependencies");
            }
        } else {
            logger.log_waiting(svc, "Waiting for dependencies:");
            for dep in &deps {
                logger.log_waiting(svc, format!(" - {}", dep.name()));
            }
            if !flags.parallel {
                logger.log_waiting(svc, NO_PARALLEL_NOTE);
            }
        }
        svc.state_machine().set_waiting(svc);
    }

    /// Fire due timers, deliver coalesced notifications and reschedule
    pub fn tick(&self) {
        for svc in self.all() {
            svc.tick();
        }
        self.check_runs();
    }

    /// Lines per minute per service
    pub fn log_velocities(&self) -> BTreeMap<String, u64> {
        self.all()
            .iter()
            .map(|s| (s.name(), s.log_velocity()))
            .collect()
    }

    /// Broadcast the current log velocities
    pub fn broadcast_velocities(&self) {
        self.emit(ServiceEvent::log_velocities(self.log_velocities()));
    }

    /// Retry jar resolution for JAR services without a jar
    pub fn refresh_jar_locations(&self) {
        for svc in self.all() {
            if svc.location_type() == LocationType::Jar && svc.file_location().is_none() {
                if let Some(jar) = svc.refresh_file_location() {
                    info!(service = %svc.name(), "Found jar {}", jar.display());
                }
            }
        }
    }

    /// State history rows, time to letters
    pub fn history_snapshot(&self) -> BTreeMap<u64, String> {
        self.update_history();
        self.inner.history.lock().as_time_to_string()
    }

    fn update_history(&self) {
        let states: Vec<ServiceState> = self.all().iter().map(Service::current_state).collect();
        self.inner.history.lock().update(&states);
    }

    fn on_state_change(&self, svc: &Service) {
        self.update_history();
        self.emit(ServiceEvent::state_changed(svc.info()));
        let last = self.inner.history.lock().last_row_string();
        if let Some((time, row)) = last {
            self.emit(ServiceEvent::StateHistory { time, row });
        }
        self.check_runs();
    }

    fn watch(&self, svc: &Service) {
        let scheduler: Weak<ServicesInner> = Arc::downgrade(&self.inner);
        let weak = svc.downgrade();
        svc.add_listener(move |_state| {
            let (Some(inner), Some(svc)) = (scheduler.upgrade(), weak.upgrade()) else {
                return;
            };
            Services { inner }.on_state_change(&svc);
        });
    }

    fn init_loaded_service(&self, svc: &Service, auto_start: bool) {
        self.watch(svc);
        match svc.location_type() {
            LocationType::Url | LocationType::Port | LocationType::Log => svc.runner().start(svc),
            _ if auto_start => {
                if let Err(e) = self.start(&svc.name(), None) {
                    warn!(service = %svc.name(), "Auto start failed: {}", e);
                }
            }
            _ => {}
        }
    }

    /// Apply a loaded configuration.
    ///
    /// The first call creates the services. Later calls reconcile: services
    /// are matched by name, or by jar location for two JAR services, and a
    /// matched service keeps its state, log and running process. When the
    /// location or log file of a matched service changed, its runners are
    /// stopped and external runners are restarted with the new definition.
    pub fn apply_configuration(&self, config: LoadedConfig) -> ReloadSummary {
        let first = !self.inner.loaded.swap(true, Ordering::SeqCst);
        let mut summary = ReloadSummary::default();
        let mut fresh = Vec::new();
        let mut restart_external = Vec::new();

        {
            let mut queue = self.inner.queue.lock();
            let mut services = self.inner.services.write();
            let old: Vec<Service> = services.clone();
            let mut matched = vec![false; old.len()];
            let mut old_to_new: Vec<Option<usize>> = vec![None; old.len()];
            let mut next = Vec::with_capacity(config.services.len());

            for spec in config.services {
                let like = find_like(&old, &matched, &spec);
                match like {
                    Some(index) => {
                        matched[index] = true;
                        old_to_new[index] = Some(next.len());
                        let svc = old[index].clone();
                        let before = svc.spec();
                        let moved = before.location != spec.location || before.log_file != spec.log_file;
                        if moved {
                            svc.runner().stop(&svc);
                        }
                        svc.rebind(spec, config.root.clone());
                        if moved {
                            svc.refresh_file_location();
                            if svc.location_type() != LocationType::Jar {
                                restart_external.push(svc.clone());
                            }
                        } else {
                            svc.runner().reconfigure();
                        }
                        summary.kept.push(svc.name());
                        next.push(svc);
                    }
                    None => {
                        let svc = Service::new(spec, config.root.clone(), self.inner.env.clone());
                        svc.refresh_file_location();
                        summary.added.push(svc.name());
                        fresh.push(svc.clone());
                        next.push(svc);
                    }
                }
            }

            for (index, svc) in old.iter().enumerate() {
                if matched[index] {
                    continue;
                }
                queue.retain(|s| !s.same_as(svc));
                svc.runner().stop(svc);
                svc.clear_listeners();
                summary.removed.push(svc.name());
            }

            assign_group_leads(&next);
            self.inner
                .history
                .lock()
                .services_were_updated(&old_to_new, next.len());
            *services = next;
            *self.inner.root.write() = config.root.clone();
        }

        let old_port = std::mem::replace(&mut *self.inner.port.lock(), config.port);
        if !first && old_port != config.port {
            summary.port_changed = Some((old_port, config.port));
        }
        self.clear_config_error();

        for svc in restart_external {
            if matches!(
                svc.location_type(),
                LocationType::Url | LocationType::Port | LocationType::Log
            ) {
                svc.runner().start(&svc);
            }
        }
        let options = self.inner.options;
        for svc in &fresh {
            let auto_start = !options.no_auto_start && (svc.spec().start || (first && options.start_all));
            self.init_loaded_service(svc, auto_start);
        }
        self.update_history();

        if first {
            info!("Loaded {} services", fresh.len());
        } else {
            info!(
                kept = summary.kept.len(),
                added = summary.added.len(),
                removed = summary.removed.len(),
                "Configuration reloaded"
            );
        }
        match summary.port_changed {
            Some((old_port, new_port)) => {
                warn!("Dashboard port changed from {} to {}", old_port, new_port);
                self.emit(ServiceEvent::PortChanged { old_port, new_port });
            }
            None => self.emit(ServiceEvent::services_reloaded(self.names())),
        }
        self.check_runs();
        summary
    }
}

fn find_like(old: &[Service], matched: &[bool], spec: &ServiceSpec) -> Option<usize> {
    let available = |i: &usize| !matched[*i];
    (0..old.len())
        .filter(available)
        .find(|&i| old[i].name() == spec.name)
        .or_else(|| {
            if spec.location_type() != LocationType::Jar {
                return None;
            }
            (0..old.len()).filter(available).find(|&i| {
                let other = old[i].spec();
                other.location_type() == LocationType::Jar && other.location == spec.location
            })
        })
}

/// Mark the lexicographically first member of each group as its leader.
/// Ungrouped services lead themselves when they have a restart command.
fn assign_group_leads(services: &[Service]) {
    let mut leaders: BTreeMap<String, String> = BTreeMap::new();
    for svc in services {
        if let Some(group) = svc.spec().group.clone() {
            let name = svc.name();
            leaders
                .entry(group)
                .and_modify(|lead| {
                    if name < *lead {
                        *lead = name.clone();
                    }
                })
                .or_insert(name);
        }
    }
    let leads: BTreeSet<&String> = leaders.values().collect();
    for svc in services {
        let spec = svc.spec();
        let lead = match &spec.group {
            Some(_) => leads.contains(&spec.name),
            None => spec.restart_cmd.is_some(),
        };
        svc.set_group_lead(lead);
    }
}
