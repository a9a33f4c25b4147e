use crate::gateway::Gateway;
use crate::types::{InstanceId, TargetName};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Path of a test certificate file under `src/testing/certs`.
///
/// `ca.pem` signs `server.pem`, which is valid for `localhost` and
/// `127.0.0.1`; `server-key.pem` is its key.
pub fn cert_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("src/testing/certs")
        .join(name)
}

/// Route test logs to the test writer when `RUST_LOG` is set.
#[cfg(test)]
pub fn init_test_logging() {
    if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    }
}

/// Wait for a condition with timeout
pub async fn wait_for<F>(condition: F, timeout: Duration, check_interval: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(check_interval).await;
    }
    condition()
}

/// Owner of every target claimed by any of `gateways`.
///
/// Returns the first target found owned by two instances as the error.
pub fn ownership_map(
    gateways: &[&Gateway],
) -> Result<BTreeMap<TargetName, InstanceId>, TargetName> {
    let mut owners = BTreeMap::new();
    for gateway in gateways {
        for target in gateway.owned_targets() {
            if owners
                .insert(target.clone(), gateway.instance_id().clone())
                .is_some()
            {
                return Err(target);
            }
        }
    }
    Ok(owners)
}

/// Wait until `gateways` together own exactly `targets`, each once.
pub async fn wait_for_partition(
    gateways: &[&Gateway],
    targets: &[&str],
    timeout: Duration,
) -> Option<BTreeMap<TargetName, InstanceId>> {
    let mut expected: Vec<TargetName> = targets.iter().map(|t| TargetName::new(*t)).collect();
    expected.sort();
    let start = Instant::now();
    while start.elapsed() < timeout {
        if let Ok(owners) = ownership_map(gateways) {
            if owners.keys().cloned().collect::<Vec<_>>() == expected {
                return Some(owners);
            }
        }
        sleep(Duration::from_millis(20)).await;
    }
    None
}
