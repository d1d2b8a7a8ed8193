//! Daemon library for devdash
//!
//! The daemon owns the scheduler and drives its periodic work:
//!
//! - maintenance tick every 250 ms (timers, coalesced notifications, starts)
//! - services file change detection every second
//! - jar re-resolution every 5 seconds
//! - log velocity broadcast every 10 seconds

#![allow(unused_crate_dependencies)]

pub mod bootstrap;
pub mod simple_error;


use bootstrap::BootstrapHandle;
use devdash_core::{load_services_from_toml_path, ConfigWatcher, ReloadSummary, ServiceEvent, Services};
use parking_lot::Mutex;
pub use simple_error::{DaemonError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const TICK_INTERVAL: Duration = Duration::from_millis(250);
const CONFIG_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const JAR_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
const VELOCITY_INTERVAL: Duration = Duration::from_secs(10);

/// How long shutdown waits for stopped processes to go away
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The devdash daemon
#[derive(Debug, Clone)]
pub struct Daemon {
    services: Services,
    watcher: Arc<Mutex<ConfigWatcher>>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl Daemon {
    /// Create a daemon around a bootstrapped engine
    #[must_use]
    pub fn new(handle: BootstrapHandle) -> Self {
        Self {
            services: handle.services,
            watcher: Arc::new(Mutex::new(handle.watcher)),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// The scheduler
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Whether the run loop is active
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Drive the periodic work until [`Daemon::stop`] is called, then stop
    /// every service
    pub async fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!("Daemon running, watching {}", self.watcher.lock().path().display());
        let echo = tokio::spawn(echo_events(self.services.clone()));

        let mut tick = interval(TICK_INTERVAL);
        let mut config_check = interval(CONFIG_CHECK_INTERVAL);
        let mut jar_refresh = interval(JAR_REFRESH_INTERVAL);
        let mut velocities = interval(VELOCITY_INTERVAL);

        while self.is_running() {
            tokio::select! {
                _ = tick.tick() => self.services.tick(),
                _ = config_check.tick() => {
                    self.reload_if_changed();
                }
                _ = jar_refresh.tick() => self.services.refresh_jar_locations(),
                _ = velocities.tick() => self.services.broadcast_velocities(),
                _ = self.shutdown.notified() => break,
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.shutdown_services().await;
        echo.abort();
        info!("Daemon stopped");
        Ok(())
    }

    /// Ask the run loop to finish
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Reload the services file when it changed on disk.
    ///
    /// A file that fails to load leaves the services as they are and
    /// becomes the scheduler's configuration error.
    pub fn reload_if_changed(&self) -> Option<ReloadSummary> {
        let path = {
            let mut watcher = self.watcher.lock();
            if !watcher.changed() {
                return None;
            }
            watcher.path().to_path_buf()
        };
        info!("Services file {} changed, reloading", path.display());
        match load_services_from_toml_path(&path) {
            Ok(config) => Some(self.services.apply_configuration(config)),
            Err(e) => {
                self.services.set_config_error(e.to_string());
                None
            }
        }
    }

    async fn shutdown_services(&self) {
        self.services.stop_all();
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while tokio::time::Instant::now() < deadline {
            self.services.tick();
            let busy = self
                .services
                .all()
                .iter()
                .any(|s| s.runner().has_live_process());
            if !busy {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        warn!("Some processes did not stop within {:?}", SHUTDOWN_GRACE);
    }
}

fn interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Echo the event stream to tracing; the transport to clients lives outside
/// the daemon
async fn echo_events(services: Services) {
    let mut events = services.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => log_event(&event),
            Err(RecvError::Lagged(missed)) => debug!("Event echo lagged, {} events skipped", missed),
            Err(RecvError::Closed) => break,
        }
    }
}

fn log_event(event: &ServiceEvent) {
    match serde_json::to_string(event) {
        Ok(json) => debug!(service = ?event.service_name(), "event {}", json),
        Err(e) => warn!("Failed to serialize event: {}", e),
    }
}
