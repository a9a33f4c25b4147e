//! Clustered telemetry gateway.
//!
//! A gateway instance streams telemetry from many network targets, keeps
//! the latest value of every `(target, path)` in an in-memory cache, and
//! serves that cache to downstream clients. Several instances form a
//! cluster that splits the targets between them:
//! - **Lock-based ownership**: one lock per target in a coordination
//!   service; holding the lock is owning the target
//! - **Bounded connections**: at most `limit` targets are dialed at once,
//!   the rest wait in store order
//! - **Filtered ingestion**: updates matching a rejection rule never reach
//!   the cache
//!
//! # Features
//!
//! - Failover within twice the session timeout when an instance dies
//! - Local release of ownership before the coordination service expires a
//!   session the instance can no longer renew
//! - Target list reload with structural diffs; changed targets reconnect
//! - Resync after reconnect may move timestamps backwards
//! - Optional TLS on both the server and target connections
//!
//! # Example
//!
//! ```rust,no_run
//! use telemetry_gateway::{Gateway, GatewayConfig, InstanceId};
//! use telemetry_gateway::config::{ClusterConfig, ServerConfig, TargetsConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::new(InstanceId::new("gw-1"))
//!         .with_server(ServerConfig::new("0.0.0.0:9339".parse()?).with_advertise("gw-1.lab", 9339))
//!         .with_targets(TargetsConfig::default().with_file("/etc/gateway/targets.json"))
//!         .with_cluster(
//!             ClusterConfig::new(vec!["coord-1.lab:2181".into()])
//!                 .with_session_timeout(Duration::from_secs(10)),
//!         )
//!         .with_target_limit(200);
//!
//!     let gateway = Gateway::builder(config).build()?;
//!     gateway.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     gateway.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   diff    ┌────────────────────┐  OwnershipEvent  ┌───────────────────┐
//! │ TargetStore  │──────────▶│ ClusterCoordinator │─────────────────▶│ ConnectionManager │
//! └──────────────┘           └────────────────────┘                  └───────────────────┘
//!                                      │                                       │ updates
//!                                      ▼                                       ▼
//!                              ┌───────────────┐                      ┌───────────────┐
//!                              │  LockService  │                      │ UpdateFilter  │
//!                              └───────────────┘                      └───────────────┘
//!                                                                              │
//!                                       ┌───────────────┐             ┌───────────────┐
//!                    clients ◀─────────│ GatewayServer │◀────────────│     Cache     │
//!                                       └───────────────┘             └───────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Ownership**: at most one live lock per target across the cluster
//! - **Cache**: per `(target, path)`, last writer by generation then
//!   timestamp; purged when the target is lost
//! - **Reads**: only targets with a live stream on this instance are
//!   served; others answer with the owner's address

pub mod cache;
pub mod cluster;
pub mod config;
pub mod connections;
pub mod error;
pub mod filter;
pub mod gateway;
pub mod metrics;
pub mod network;
pub mod server;
pub mod targets;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use gateway::{Gateway, GatewayBuilder};
pub use config::{
    ClientTlsConfig, ClusterConfig, GatewayConfig, ReconnectConfig, ServerConfig, TargetsConfig,
};
pub use error::{Error, Result};
pub use types::{InstanceId, Notification, Path, PathElem, TargetName, TypedValue, Update};

// Re-export cluster types
pub use cluster::{
    ClusterCoordinator, LockOwner, LockService, MemoryLockService, OwnershipEvent,
    OwnershipListener,
};

// Re-export ingestion types
pub use cache::{Cache, CacheEntry, CacheEvent};
pub use connections::{ConnectionState, Dialer, TcpDialer};
pub use filter::{RejectionRule, UpdateFilter};
pub use targets::{Target, TargetSource, TargetStore};

// Re-export metrics types
pub use metrics::{Counter, Gauge, GatewayMetrics, LabeledCounter, MetricsSnapshot};
