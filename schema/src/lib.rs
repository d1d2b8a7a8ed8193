//! Schema definitions for devdash
//!
//! This crate contains the data structures shared by the orchestration
//! engine and its collaborators (daemon, transports). All types here
//! implement JSON Schema generation for external consumption.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod events;
pub mod log;
pub mod service;

pub use events::ServiceEvent;
pub use log::{LineInfo, LineType};
pub use service::{LocationType, ServiceExit, ServiceInfo, ServiceSpec, ServiceState};

/// Contents of a services file after defaults and variables were applied
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServicesConfig {
    /// Port of the dashboard server
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base directory for relative paths
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    /// Values for `${name}` substitution
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Service definitions, in file order
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            root: None,
            variables: BTreeMap::new(),
            services: Vec::new(),
        }
    }
}

/// Default dashboard port
pub const fn default_port() -> u16 {
    8099
}
