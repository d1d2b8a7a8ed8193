//! Event stream emitted by the devdash engine
//!
//! Events are broadcast fire-and-forget to whatever transport is attached;
//! the engine never waits for delivery. They are designed to be serializable
//! so a transport can forward them as JSON without further mapping.

use crate::log::LineInfo;
use crate::service::ServiceInfo;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Events emitted by the orchestration engine
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "eventType", rename_all = "camelCase")]
pub enum ServiceEvent {
    /// Service state (or observed port) has changed
    StateChanged {
        /// Snapshot of the service after the change
        service: ServiceInfo,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// A line was added to a service log
    LogLine {
        /// Service name
        service: String,
        /// The classified line
        line: LineInfo,
    },

    /// A service log buffer was cleared
    LogCleared {
        /// Service name
        service: String,
    },

    /// Periodic log velocities, lines per minute, keyed by service name
    LogVelocities {
        /// Velocity per service
        velocities: BTreeMap<String, u64>,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// Most recent state history row
    StateHistory {
        /// Row start time in epoch millis
        time: u64,
        /// Comma separated letters per service
        row: String,
    },

    /// The services file was reloaded
    ServicesReloaded {
        /// Names of the services now loaded
        services: Vec<String>,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// The configured dashboard port changed; the server must restart
    PortChanged {
        /// Previous port
        old_port: u16,
        /// New port
        new_port: u16,
    },

    /// The services file could not be loaded
    ConfigurationError {
        /// Error message, or `None` once the error was resolved
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },
}

impl ServiceEvent {
    /// Get the service name for events that belong to a single service
    pub fn service_name(&self) -> Option<&str> {
        match self {
            ServiceEvent::StateChanged { service, .. } => Some(&service.name),
            ServiceEvent::LogLine { service, .. } | ServiceEvent::LogCleared { service } => {
                Some(service)
            }
            _ => None,
        }
    }

    /// Get the current timestamp in RFC3339 format
    pub fn current_timestamp() -> String {
        humantime::format_rfc3339_seconds(SystemTime::now()).to_string()
    }

    /// Create a state changed event
    #[must_use]
    pub fn state_changed(service: ServiceInfo) -> Self {
        Self::StateChanged {
            service,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a services reloaded event
    #[must_use]
    pub fn services_reloaded(services: Vec<String>) -> Self {
        Self::ServicesReloaded {
            services,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a log velocities event
    #[must_use]
    pub fn log_velocities(velocities: BTreeMap<String, u64>) -> Self {
        Self::LogVelocities {
            velocities,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a configuration error event
    #[must_use]
    pub fn configuration_error(message: Option<String>) -> Self {
        Self::ConfigurationError {
            message,
            timestamp: Self::current_timestamp(),
        }
    }
}
