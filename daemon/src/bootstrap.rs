//! Daemon bootstrap: load the services file and build the scheduler
//!
//! A services file that cannot be loaded does not prevent the daemon from
//! starting. The scheduler starts empty with the load failure as its
//! configuration error, and the file keeps being watched so that fixing it
//! loads the services.

use devdash_core::{
    load_services_from_toml_path, system_adapter, system_clock, ConfigWatcher, ProcessAdapter,
    ServiceEnv, Services, StartFlags, StartOptions,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::Result;

/// Capacity of the event channel; slow subscribers lag instead of blocking
const EVENT_CAPACITY: usize = 4096;

/// What the daemon was asked to run
#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    /// The services file
    pub config_path: PathBuf,
    /// Auto-start behavior of the first load
    pub start: StartOptions,
    /// Initial start policy
    pub flags: StartFlags,
}

impl BootstrapOptions {
    /// Options for `config_path` with default start behavior
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            start: StartOptions::default(),
            flags: StartFlags::default(),
        }
    }
}

/// The running engine and the watcher of its services file
#[allow(missing_debug_implementations)]
pub struct BootstrapHandle {
    #[allow(missing_docs)]
    pub services: Services,
    #[allow(missing_docs)]
    pub watcher: ConfigWatcher,
}

/// Bootstrap with the platform process adapter
pub async fn bootstrap(options: BootstrapOptions) -> Result<BootstrapHandle> {
    bootstrap_with_adapter(options, system_adapter()).await
}

/// Bootstrap with a given process adapter
pub async fn bootstrap_with_adapter(
    options: BootstrapOptions,
    adapter: Arc<dyn ProcessAdapter>,
) -> Result<BootstrapHandle> {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let env = ServiceEnv {
        clock: system_clock(),
        events,
        adapter,
    };
    let services = Services::new(env, options.start, options.flags);

    // baseline before loading so that an edit made meanwhile is picked up
    let watcher = ConfigWatcher::new(&options.config_path);
    match load_services_from_toml_path(&options.config_path) {
        Ok(config) => {
            info!(
                "Loaded {} services from {}",
                config.services.len(),
                options.config_path.display()
            );
            services.apply_configuration(config);
        }
        Err(e) => {
            warn!("Starting without services: {}", e);
            services.set_config_error(e.to_string());
        }
    }

    Ok(BootstrapHandle { services, watcher })
}
