//! TCP connect probe for port services

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

use super::{HealthError, Probe};

/// Considers a service up when a TCP connection can be established
///
/// ```rust
/// use devdash_core::health::{Probe, TcpProbe};
/// use std::time::Duration;
///
/// # async fn example() {
/// let probe = TcpProbe::new("localhost", 5432, Duration::from_secs(10));
/// let up = probe.check().await.is_ok();
/// # let _ = up;
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    /// Create a probe for `host:port`
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    /// `host:port`
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn check(&self) -> Result<(), HealthError> {
        let address = self.address();
        match timeout(self.timeout, TcpStream::connect(&address)).await {
            // dropping the stream closes the connection again
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => {
                trace!("Port probe {} failed: {}", address, e);
                Err(HealthError::Tcp(e))
            }
            Err(_) => Err(HealthError::Timeout(self.timeout)),
        }
    }

    fn target(&self) -> String {
        self.address()
    }
}
