//! Error types for up/down probing

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while probing an external service
#[derive(Error, Debug)]
pub enum HealthError {
    /// The probe timed out
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// TCP connection failed
    #[error("tcp connection failed: {0}")]
    Tcp(#[from] std::io::Error),

    /// HTTP request failed, including TLS failures
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Response status was not 2xx
    #[error("unexpected status code: {0}")]
    UnexpectedStatus(u16),

    /// URL could not be parsed
    #[error("invalid url {0}: {1}")]
    InvalidUrl(String, String),

    /// Port location could not be parsed
    #[error("bad address: {0}")]
    BadAddress(String),
}
