//! Probe trait

use super::HealthError;
use async_trait::async_trait;

/// A single up/down check of an external service
#[async_trait]
pub trait Probe {
    /// `Ok(())` when the service is up; the error explains why it is down
    async fn check(&self) -> Result<(), HealthError>;

    /// Human-readable probe target, used in log lines
    fn target(&self) -> String;
}
