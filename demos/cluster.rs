//! Two gateways sharing three simulated devices.
//!
//! Everything runs in one process: a lock server, three mock devices
//! speaking the gateway protocol, and two gateway instances with a limit of
//! two connections each. After the targets are partitioned, gateway A is
//! stopped without releasing its locks and gateway B takes over.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example cluster

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry_gateway::cluster::{LockServer, LoggingOwnershipListener};
use telemetry_gateway::config::{ClusterConfig, ServerConfig, TargetsConfig};
use telemetry_gateway::targets::StaticSource;
use telemetry_gateway::testing::MockTargetServer;
use telemetry_gateway::{
    Gateway, GatewayConfig, InstanceId, MemoryLockService, Notification, Path, Target, Update,
};

const SESSION_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    println!("===========================================");
    println!("  Telemetry Gateway Cluster Example");
    println!("===========================================");
    println!();

    // Coordination service
    let locks = Arc::new(MemoryLockService::new());
    let lock_server = LockServer::start(locks.clone(), "127.0.0.1:0".parse()?).await?;
    println!("Lock server:      {}", lock_server.local_addr());

    // Simulated devices
    let mut devices = Vec::new();
    let mut targets = Vec::new();
    for name in ["leaf1", "leaf2", "spine1"] {
        let device = MockTargetServer::start(
            name,
            vec![Notification::new(1)
                .with_prefix(Path::parse("/system")?)
                .with_update(Update::new(Path::parse("/hostname")?, name))],
        )
        .await?;
        println!("Device {:<9} {}", format!("{}:", name), device.addr());
        targets.push(Target::new(name, device.addr().to_string()));
        devices.push(device);
    }
    let source = Arc::new(StaticSource::new(targets));
    println!();

    let mut gateways = Vec::new();
    for id in ["gw-a", "gw-b"] {
        let listen: SocketAddr = "127.0.0.1:0".parse()?;
        let config = GatewayConfig::new(InstanceId::new(id))
            .with_server(ServerConfig::new(listen))
            .with_targets(TargetsConfig {
                limit: 2,
                reload_interval: Duration::from_secs(1),
                ..Default::default()
            })
            .with_cluster(
                ClusterConfig::new(vec![lock_server.local_addr().to_string()])
                    .with_session_timeout(SESSION_TIMEOUT),
            );
        let gateway = Gateway::builder(config)
            .with_target_source(source.clone())
            .with_ownership_listener(Arc::new(LoggingOwnershipListener))
            .build()?;
        gateway.start().await?;
        gateways.push(gateway);
    }

    tokio::time::sleep(SESSION_TIMEOUT).await;
    print_ownership(&gateways);

    // Stream a change from every device.
    for (i, device) in devices.iter().enumerate() {
        device.push(
            Notification::new(2).with_update(Update::new(Path::parse("/system/uptime")?, i as i64)),
        );
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    for gateway in &gateways {
        let stats = gateway.cache().stats();
        println!(
            "{}: {} targets, {} cached entries",
            gateway.instance_id(),
            stats.targets,
            stats.entries
        );
    }
    println!();

    // Crash gw-a: cut it off from the lock service, then stop it.
    let crashed = gateways.remove(0);
    println!("Stopping {} without releasing its locks...", crashed.instance_id());
    locks.partition(crashed.instance_id());
    let started = Instant::now();
    crashed.stop().await;

    let survivor = &gateways[0];
    while survivor.owned_targets().len() < 2 && started.elapsed() < SESSION_TIMEOUT * 3 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    println!(
        "{} owns {:?} after {:?} (bound {:?})",
        survivor.instance_id(),
        survivor.owned_targets(),
        started.elapsed(),
        SESSION_TIMEOUT * 2
    );
    println!();
    println!("Metrics: {:#?}", survivor.metrics().snapshot());

    for gateway in &gateways {
        gateway.stop().await;
    }
    lock_server.stop().await;
    Ok(())
}

fn print_ownership(gateways: &[Gateway]) {
    println!("Ownership:");
    for gateway in gateways {
        println!(
            "  {} owns {:?}, streaming {:?}",
            gateway.instance_id(),
            gateway.owned_targets(),
            gateway.served_targets()
        );
    }
    println!();
}
