//! Core engine of devdash, the local development service dashboard
//!
//! This crate loads the services file, supervises the configured services
//! (spawned processes, jars, remote URLs/ports and log files), tracks their
//! states and output, and schedules starts in dependency order. The daemon
//! drives it and exposes it to clients.

pub mod clock;
pub mod config;
pub mod error;
pub mod framing;
pub mod health;
pub mod historic_count;
pub mod history;
pub mod logging;
pub mod notifier;
pub mod output_log;
pub mod process;
pub mod runner;
pub mod scheduler;
pub mod service;
pub mod utilities;

#[cfg(test)]
mod scheduler_tests;

// Re-export schema types for convenience
pub use schema::*;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::{load_services_from_toml_path, load_services_from_toml_str, ConfigWatcher, LoadedConfig};
pub use error::{CoreError, Result};
pub use history::{HistoryRow, ServicesStateHistory};
pub use runner::{system_adapter, MockInstruction, MockProcessAdapter, ProcessAdapter};
pub use scheduler::{ReloadSummary, Services, StartFlags, StartOptions};
pub use service::{Service, ServiceEnv};
pub use utilities::*;

/// Core utilities and helper functions
pub mod utils {
    use tracing::info;

    /// Initialize tracing for the application
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|e| crate::CoreError::InitializationError(e.to_string()))?;

        info!("Tracing initialized with level: {}", level);
        Ok(())
    }
}
