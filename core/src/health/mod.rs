//! Up/down probing of external services
//!
//! URL services are probed with an HTTP GET and port services with a TCP
//! connect. A probe either succeeds (the service is up) or fails with a
//! [`HealthError`] describing why it is considered down.
//!
//! ## Types
//!
//! - [`Probe`]: The trait shared by all probes
//! - [`TcpProbe`]: TCP connection probe for `[host:]port` locations
//! - [`HttpProbe`]: HTTP GET probe for `http(s)://` locations, any 2xx is up

pub mod error;
pub mod http;
pub mod tcp;
pub mod types;

pub use error::HealthError;
pub use http::HttpProbe;
pub use tcp::TcpProbe;
pub use types::Probe;

use schema::LocationType;
use std::time::Duration;

/// Timeout applied to every external probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Host used when a port location has none
pub const DEFAULT_PROBE_HOST: &str = "localhost";

/// Split a `[host]:port` or bare `port` location into host and port
pub fn parse_port_location(location: &str) -> Result<(String, u16), HealthError> {
    let location = location.trim();
    let (host, port) = match location.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None => ("", location),
    };
    let port = port
        .parse::<u16>()
        .map_err(|_| HealthError::BadAddress(location.to_string()))?;
    let host = if host.is_empty() { DEFAULT_PROBE_HOST } else { host };
    Ok((host.to_string(), port))
}

/// Create the probe for a service location
pub fn create_probe(
    location_type: LocationType,
    location: &str,
    timeout: Duration,
) -> Result<Box<dyn Probe + Send + Sync>, HealthError> {
    match location_type {
        LocationType::Url => Ok(Box::new(HttpProbe::new(location.to_string(), timeout)?)),
        LocationType::Port => {
            let (host, port) = parse_port_location(location)?;
            Ok(Box::new(TcpProbe::new(host, port, timeout)))
        }
        other => Err(HealthError::BadAddress(format!(
            "{location} is not a probe location ({other:?})"
        ))),
    }
}
