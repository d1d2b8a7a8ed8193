//! HTTP GET probe for URL services

use async_trait::async_trait;
use reqwest::{Client, Url};
use std::time::Duration;
use tokio::time::timeout;
use tracing::trace;

use super::{HealthError, Probe};

/// Considers a service up when a GET on its URL returns a 2xx status.
///
/// `https://` URLs go through rustls with the bundled web PKI roots.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    url: String,
    client: Client,
    timeout: Duration,
}

impl HttpProbe {
    /// Create a probe for `url`
    pub fn new(url: String, timeout: Duration) -> Result<Self, HealthError> {
        let client = Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            url,
            client,
            timeout,
        })
    }

    /// Probed URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self) -> Result<(), HealthError> {
        let url = Url::parse(&self.url)
            .map_err(|e| HealthError::InvalidUrl(self.url.clone(), e.to_string()))?;

        let response = match timeout(self.timeout, self.client.get(url).send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                trace!("URL probe {} failed: {}", self.url, e);
                return Err(HealthError::Http(e));
            }
            Err(_) => return Err(HealthError::Timeout(self.timeout)),
        };

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(HealthError::UnexpectedStatus(status.as_u16()))
        }
    }

    fn target(&self) -> String {
        self.url.clone()
    }
}
