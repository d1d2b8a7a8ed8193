//! Helpers shared by the daemon integration tests

use devdash_core::{ServiceState, Services};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for one integration test; real processes and sockets are involved
const TEST_DEADLINE: Duration = Duration::from_secs(60);

/// Fail the test when `fut` does not finish before the deadline
pub async fn within_deadline<T>(fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(TEST_DEADLINE, fut).await {
        Ok(value) => value,
        Err(_) => panic!("test did not finish within {TEST_DEADLINE:?}"),
    }
}

/// Write a services file into `dir`
pub fn write_services(dir: &Path, toml: &str) -> PathBuf {
    let path = dir.join("services.toml");
    std::fs::write(&path, toml).unwrap();
    path
}

/// Tick the scheduler until the service reaches `state`
pub async fn wait_for_state(services: &Services, name: &str, state: ServiceState) {
    while services.get(name).map(|s| s.current_state()) != Some(state) {
        services.tick();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
