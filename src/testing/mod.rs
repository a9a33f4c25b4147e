//! Testing utilities for the telemetry gateway.
//!
//! This module provides tools for testing clustered gateways including:
//! - Scripted targets, in-process ([`MockDialer`]) and over TCP
//!   ([`MockTargetServer`])
//! - [`TestCluster`]: several gateways sharing one in-memory lock service
//! - Wait helpers for asynchronous assertions
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          TestCluster                            │
//! │                                                                 │
//! │   Gateway gw-0     Gateway gw-1     ...     Gateway gw-N        │
//! │        │                │                        │              │
//! │        └───────┬────────┴───────────┬────────────┘              │
//! │                ▼                    ▼                           │
//! │       MemoryLockService        MockDialer                       │
//! │   (partition / expire)     (one MockTarget per target)          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use telemetry_gateway::testing::TestCluster;
//! use std::time::Duration;
//!
//! let mut cluster = TestCluster::start(2, &["r1", "r2", "r3"], 2, Duration::from_secs(2)).await?;
//! cluster.wait_for_partition(Duration::from_secs(5)).await;
//!
//! // Simulate a crash: the instance stops renewing and its locks expire.
//! cluster.crash(0).await;
//! ```

pub mod mock;
pub mod utils;


pub use mock::{MockDialer, MockTarget, MockTargetServer};

use crate::cluster::MemoryLockService;
use crate::config::{ClusterConfig, GatewayConfig, ServerConfig, TargetsConfig};
use crate::error::Result;
use crate::gateway::Gateway;
use crate::targets::{StaticSource, Target};
use crate::types::{InstanceId, TargetName};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Several gateways coordinating through one [`MemoryLockService`].
pub struct TestCluster {
    /// Shared lock service; use it to partition or expire instances.
    pub locks: Arc<MemoryLockService>,

    /// Shared dialer; every instance reaches the same mock targets.
    pub dialer: Arc<MockDialer>,

    /// Shared target list.
    pub source: Arc<StaticSource>,

    gateways: Vec<Option<Gateway>>,
    targets: Vec<String>,
}

impl TestCluster {
    /// Start `instances` gateways over `targets`, each limited to `limit`
    /// connections.
    pub async fn start(
        instances: usize,
        targets: &[&str],
        limit: usize,
        session_timeout: Duration,
    ) -> Result<Self> {
        #[cfg(test)]
        utils::init_test_logging();
        let locks = Arc::new(MemoryLockService::new());
        let dialer = Arc::new(MockDialer::new());
        let source = Arc::new(StaticSource::new(
            targets.iter().map(|name| Self::target(name)).collect(),
        ));

        let mut gateways = Vec::with_capacity(instances);
        for i in 0..instances {
            let config = GatewayConfig::new(InstanceId::new(format!("gw-{}", i)))
                .with_server(ServerConfig::new(SocketAddr::from(([127, 0, 0, 1], 0))))
                .with_targets(TargetsConfig {
                    limit,
                    reload_interval: Duration::from_millis(200),
                    ..Default::default()
                })
                .with_cluster(
                    ClusterConfig::default()
                        .with_lock_prefix("/test/gateway")
                        .with_session_timeout(session_timeout),
                );
            let gateway = Gateway::builder(config)
                .with_dialer(dialer.clone())
                .with_target_source(source.clone())
                .with_lock_service(locks.clone())
                .build()?;
            gateway.start().await?;
            gateways.push(Some(gateway));
        }

        Ok(Self {
            locks,
            dialer,
            source,
            gateways,
            targets: targets.iter().map(|t| t.to_string()).collect(),
        })
    }

    fn target(name: &str) -> Target {
        Target::new(name, format!("{}.lab:57400", name))
    }

    /// The gateway at `index`, unless it was crashed or stopped.
    pub fn gateway(&self, index: usize) -> Option<&Gateway> {
        self.gateways.get(index).and_then(|g| g.as_ref())
    }

    /// Gateways still running.
    pub fn live(&self) -> Vec<&Gateway> {
        self.gateways.iter().flatten().collect()
    }

    /// Replace the target list; instances pick it up on their next reload.
    pub fn set_targets(&mut self, targets: &[&str]) {
        self.source
            .set(targets.iter().map(|name| Self::target(name)).collect());
        self.targets = targets.iter().map(|t| t.to_string()).collect();
    }

    /// Stop an instance without letting it release its locks. Its session
    /// lingers in the lock service until it times out.
    pub async fn crash(&mut self, index: usize) {
        if let Some(gateway) = self.gateways.get_mut(index).and_then(Option::take) {
            self.locks.partition(gateway.instance_id());
            gateway.stop().await;
        }
    }

    /// Stop an instance cleanly, releasing its locks.
    pub async fn stop_instance(&mut self, index: usize) {
        if let Some(gateway) = self.gateways.get_mut(index).and_then(Option::take) {
            gateway.stop().await;
        }
    }

    /// Wait until the live instances together own every target exactly once.
    pub async fn wait_for_partition(
        &self,
        timeout: Duration,
    ) -> Option<BTreeMap<TargetName, InstanceId>> {
        let targets: Vec<&str> = self.targets.iter().map(String::as_str).collect();
        utils::wait_for_partition(&self.live(), &targets, timeout).await
    }

    /// Stop every instance.
    pub async fn shutdown(&mut self) {
        for gateway in self.gateways.iter_mut().filter_map(Option::take) {
            gateway.stop().await;
        }
    }
}
