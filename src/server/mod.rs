//! Northbound server: the cache and pass-through writes, exposed to
//! downstream clients.
//!
//! Only targets with a live stream on this instance are served. Requests
//! for anything else answer [`Response::NotServed`], naming the owning
//! peer's advertised address when the coordination service knows it, so
//! clients never read data this instance is no longer authoritative for.

pub mod rpc;

use crate::cache::{Cache, CacheEvent, SubscriptionError};
use crate::cluster::ClusterCoordinator;
use crate::connections::ConnectionManager;
use crate::error::Result;
use crate::metrics::GatewayMetrics;
use crate::network::{read_frame, write_frame, BoxedStream, ConnectionHandler};
use crate::types::{now_nanos, InstanceId, Path, SetRequest, TargetName};
use async_trait::async_trait;
use rpc::{Capabilities, Request, Response, SubscribeMode, TargetNotification, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Request handler for downstream client connections.
pub struct GatewayServer {
    instance: InstanceId,
    cache: Arc<Cache>,
    connections: Arc<ConnectionManager>,
    coordinator: Arc<dyn ClusterCoordinator>,
    metrics: Arc<GatewayMetrics>,
}

impl GatewayServer {
    pub fn new(
        instance: InstanceId,
        cache: Arc<Cache>,
        connections: Arc<ConnectionManager>,
        coordinator: Arc<dyn ClusterCoordinator>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            instance,
            cache,
            connections,
            coordinator,
            metrics,
        }
    }

    /// Answer for a target this instance does not serve.
    async fn not_served(&self, target: TargetName) -> Response {
        let owner = self
            .coordinator
            .owner_of(&target)
            .await
            .filter(|owner| owner.instance != self.instance)
            .and_then(|owner| owner.advertise_addr);
        Response::NotServed { target, owner }
    }

    fn capabilities(&self) -> Response {
        Response::Capabilities(Capabilities {
            version: PROTOCOL_VERSION.to_string(),
            instance: self.instance.to_string(),
            targets: self.connections.served_targets(),
        })
    }

    async fn get(&self, target: TargetName, prefix: Path) -> Response {
        if !target.is_wildcard() && !self.connections.is_serving(&target) {
            return self.not_served(target).await;
        }
        let notifications = self
            .cache
            .get(&target, &prefix)
            .iter()
            .filter(|entry| self.connections.is_serving(&entry.target))
            .map(|entry| TargetNotification::from_entry(entry))
            .collect();
        Response::Get(notifications)
    }

    async fn set(&self, target: TargetName, request: SetRequest) -> Response {
        if target.is_wildcard() {
            return Response::Error("set requires a single target".to_string());
        }
        let Some(writer) = self.connections.writer(&target) else {
            return self.not_served(target).await;
        };
        match writer.set(request).await {
            Ok(response) => Response::Set(response),
            Err(e) => {
                warn!(target = %target, error = %e, "Pass-through set failed");
                Response::Error(e.to_string())
            }
        }
    }

    /// Replay, mark the end of the replay, then stream changes.
    ///
    /// The cache subscription is taken before the replay read so no change
    /// falls between the two.
    async fn subscribe(
        &self,
        stream: &mut BoxedStream,
        target: TargetName,
        prefix: Path,
        mode: SubscribeMode,
        shutdown: CancellationToken,
    ) -> Result<()> {
        if !target.is_wildcard() && !self.connections.is_serving(&target) {
            let reply = self.not_served(target).await;
            return write_frame(stream, &reply).await;
        }

        let mut changes = self.cache.subscribe(&target, &prefix);
        for entry in self.cache.get(&target, &prefix) {
            if self.connections.is_serving(&entry.target) {
                write_frame(stream, &Response::Update(TargetNotification::from_entry(&entry)))
                    .await?;
            }
        }
        write_frame(stream, &Response::SyncComplete).await?;
        if mode == SubscribeMode::Once {
            return Ok(());
        }

        self.metrics.server_subscriptions.inc();
        let _active = SubscriptionGuard(&self.metrics);
        debug!(target = %target, %prefix, "Subscription streaming");

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                event = changes.recv() => event,
            };
            let reply = match event {
                Ok(CacheEvent::Update(entry)) => {
                    if !self.connections.is_serving(&entry.target) {
                        continue;
                    }
                    Response::Update(TargetNotification::from_entry(&entry))
                }
                Ok(CacheEvent::Delete {
                    target,
                    prefix,
                    timestamp,
                }) => {
                    if !self.connections.is_serving(&target) {
                        continue;
                    }
                    Response::Update(TargetNotification::delete(target, prefix, timestamp))
                }
                Ok(CacheEvent::TargetPurged { target: purged }) => {
                    write_frame(
                        stream,
                        &Response::Update(TargetNotification::delete(
                            purged.clone(),
                            Path::root(),
                            now_nanos(),
                        )),
                    )
                    .await?;
                    if target.is_wildcard() || self.connections.is_serving(&purged) {
                        continue;
                    }
                    // The followed target moved away; point the client at its new owner.
                    let reply = self.not_served(purged).await;
                    return write_frame(stream, &reply).await;
                }
                Ok(CacheEvent::SyncComplete { .. }) => continue,
                Err(SubscriptionError::Lagged(missed)) => {
                    warn!(target = %target, missed, "Subscriber fell behind, closing");
                    let reply = Response::Error(format!("subscription lagged, {} updates missed", missed));
                    return write_frame(stream, &reply).await;
                }
                Err(SubscriptionError::Closed) => return Ok(()),
            };
            write_frame(stream, &reply).await?;
        }
    }
}

struct SubscriptionGuard<'a>(&'a GatewayMetrics);

impl Drop for SubscriptionGuard<'_> {
    fn drop(&mut self) {
        self.0.server_subscriptions.dec();
    }
}

#[async_trait]
impl ConnectionHandler for GatewayServer {
    async fn handle(
        &self,
        mut stream: BoxedStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<()> {
        loop {
            let request = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                request = read_frame::<_, Request>(&mut stream) => request?,
            };
            let Some(request) = request else {
                debug!(%peer, "Client disconnected");
                return Ok(());
            };
            self.metrics.server_requests.inc([request.kind()]);

            let reply = match request {
                Request::Capabilities => self.capabilities(),
                Request::Get { target, prefix } => self.get(target, prefix).await,
                Request::Set { target, request } => self.set(target, request).await,
                Request::Subscribe {
                    target,
                    prefix,
                    mode,
                } => {
                    info!(%peer, target = %target, ?mode, "Subscription opened");
                    return self
                        .subscribe(&mut stream, target, prefix, mode, shutdown)
                        .await;
                }
            };
            write_frame(&mut stream, &reply).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{LockOwner, OwnershipEvent};
    use crate::config::GatewayConfig;
    use crate::filter::UpdateFilter;
    use crate::network::{NetworkServer, PlainAcceptor};
    use crate::targets::{StaticSource, Target, TargetStore};
    use crate::testing::mock::MockDialer;
    use crate::types::{Notification, TypedValue, Update};
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;

    /// Reports a fixed peer as the owner of every target.
    struct PeerOwns(LockOwner);

    #[async_trait]
    impl ClusterCoordinator for PeerOwns {
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) {}
        fn owned_targets(&self) -> Vec<TargetName> {
            Vec::new()
        }
        async fn owner_of(&self, _target: &TargetName) -> Option<LockOwner> {
            Some(self.0.clone())
        }
        fn subscribe(&self) -> mpsc::UnboundedReceiver<OwnershipEvent> {
            mpsc::unbounded_channel().1
        }
    }

    struct Harness {
        addr: SocketAddr,
        dialer: Arc<MockDialer>,
        cache: Arc<Cache>,
        connections: Arc<ConnectionManager>,
        store: Arc<TargetStore>,
        metrics: Arc<GatewayMetrics>,
        shutdown: CancellationToken,
    }

    impl Harness {
        async fn start(owned: &[&str]) -> Self {
            let metrics = Arc::new(GatewayMetrics::new());
            let cache = Arc::new(Cache::new());
            let dialer = Arc::new(MockDialer::new());
            let store = Arc::new(TargetStore::new(
                Arc::new(StaticSource::new(vec![])),
                metrics.clone(),
            ));
            store
                .set_targets(vec![
                    Target::new("r1", "10.0.0.1:57400"),
                    Target::new("r2", "10.0.0.2:57400"),
                ])
                .unwrap();
            let connections = Arc::new(ConnectionManager::new(
                Arc::new(GatewayConfig::default()),
                dialer.clone(),
                cache.clone(),
                Arc::new(UpdateFilter::allow_all(metrics.clone())),
                metrics.clone(),
            ));
            let (_ownership_tx, ownership_rx) = mpsc::unbounded_channel();
            connections.start(ownership_rx, store.watch());
            connections.reconcile(
                owned.iter().map(|n| TargetName::new(*n)).collect::<HashSet<_>>(),
                store.current(),
            );

            let peer = LockOwner::new(InstanceId::new("peer"), Some("10.1.1.2:9339".to_string()));
            let server = GatewayServer::new(
                InstanceId::new("self"),
                cache.clone(),
                connections.clone(),
                Arc::new(PeerOwns(peer)),
                metrics.clone(),
            );
            let listener = NetworkServer::bind(
                "gateway",
                "127.0.0.1:0".parse().unwrap(),
                Arc::new(PlainAcceptor),
                Arc::new(server),
            )
            .await
            .unwrap();
            let addr = listener.local_addr().unwrap();
            let shutdown = CancellationToken::new();
            tokio::spawn(listener.run(shutdown.clone()));

            let harness = Self {
                addr,
                dialer,
                cache,
                connections,
                store,
                metrics,
                shutdown,
            };
            for name in owned {
                harness.wait_serving(name).await;
            }
            harness
        }

        async fn wait_serving(&self, name: &str) {
            let name = TargetName::new(name);
            for _ in 0..100 {
                if self.connections.is_serving(&name) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("{} never became served", name);
        }

        async fn client(&self) -> TcpStream {
            TcpStream::connect(self.addr).await.unwrap()
        }

        async fn call(&self, request: Request) -> Response {
            let mut stream = self.client().await;
            write_frame(&mut stream, &request).await.unwrap();
            read_frame(&mut stream).await.unwrap().unwrap()
        }

        async fn stop(self) {
            self.shutdown.cancel();
            self.connections.stop().await;
        }
    }

    fn hostname(ts: i64, value: &str) -> Notification {
        Notification::new(ts).with_update(Update::new(Path::parse("/system/hostname").unwrap(), value))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_capabilities_lists_served_targets() {
        let h = Harness::start(&["r1"]).await;
        match h.call(Request::Capabilities).await {
            Response::Capabilities(caps) => {
                assert_eq!(caps.version, PROTOCOL_VERSION);
                assert_eq!(caps.instance, "self");
                assert_eq!(caps.targets, vec![TargetName::new("r1")]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.metrics.server_requests.get(["capabilities"]), 1);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_get_served_and_unserved() {
        let h = Harness::start(&["r1"]).await;
        h.dialer.target("r1").send(hostname(5, "r1.lab"));
        settle().await;

        match h.call(Request::Get { target: "r1".into(), prefix: Path::parse("/system").unwrap() }).await {
            Response::Get(notifications) => {
                assert_eq!(notifications.len(), 1);
                assert_eq!(notifications[0].notification.timestamp, 5);
                assert_eq!(
                    notifications[0].notification.updates[0].value,
                    TypedValue::from("r1.lab")
                );
            }
            other => panic!("unexpected {:?}", other),
        }

        let reply = h.call(Request::Get { target: "r2".into(), prefix: Path::root() }).await;
        assert_eq!(
            reply,
            Response::NotServed {
                target: "r2".into(),
                owner: Some("10.1.1.2:9339".to_string()),
            }
        );
        h.stop().await;
    }

    #[tokio::test]
    async fn test_subscribe_replays_then_streams() {
        let h = Harness::start(&["r1"]).await;
        let r1 = h.dialer.target("r1");
        r1.send(hostname(1, "before"));
        settle().await;

        let mut stream = h.client().await;
        let request = Request::Subscribe {
            target: "r1".into(),
            prefix: Path::root(),
            mode: SubscribeMode::Stream,
        };
        write_frame(&mut stream, &request).await.unwrap();

        let first: Response = read_frame(&mut stream).await.unwrap().unwrap();
        match first {
            Response::Update(n) => assert_eq!(n.notification.timestamp, 1),
            other => panic!("unexpected {:?}", other),
        }
        let second: Response = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(second, Response::SyncComplete);

        r1.send(hostname(2, "after"));
        let third: Response = read_frame(&mut stream).await.unwrap().unwrap();
        match third {
            Response::Update(n) => {
                assert_eq!(n.notification.timestamp, 2);
                assert_eq!(n.notification.updates[0].value, TypedValue::from("after"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.metrics.server_subscriptions.get(), 1);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_subscription_ends_when_target_is_removed() {
        let h = Harness::start(&["r1"]).await;
        h.dialer.target("r1").send(hostname(1, "r1.lab"));
        settle().await;

        let mut stream = h.client().await;
        let request = Request::Subscribe {
            target: "r1".into(),
            prefix: Path::root(),
            mode: SubscribeMode::Stream,
        };
        write_frame(&mut stream, &request).await.unwrap();
        let _replay: Response = read_frame(&mut stream).await.unwrap().unwrap();
        let sync: Response = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(sync, Response::SyncComplete);

        h.store
            .set_targets(vec![Target::new("r2", "10.0.0.2:57400")])
            .unwrap();

        let purge: Response = read_frame(&mut stream).await.unwrap().unwrap();
        match purge {
            Response::Update(n) => assert_eq!(n.notification.deletes, vec![Path::root()]),
            other => panic!("unexpected {:?}", other),
        }
        let last: Response = read_frame(&mut stream).await.unwrap().unwrap();
        assert!(matches!(last, Response::NotServed { .. }), "{:?}", last);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_empty_subscription_ends_when_target_is_removed() {
        let h = Harness::start(&["r1"]).await;

        let mut stream = h.client().await;
        let request = Request::Subscribe {
            target: "r1".into(),
            prefix: Path::root(),
            mode: SubscribeMode::Stream,
        };
        write_frame(&mut stream, &request).await.unwrap();
        let sync: Response = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(sync, Response::SyncComplete);

        h.store
            .set_targets(vec![Target::new("r2", "10.0.0.2:57400")])
            .unwrap();

        let purge: Response = tokio::time::timeout(Duration::from_secs(3), read_frame(&mut stream))
            .await
            .expect("no signal after target removal")
            .unwrap()
            .unwrap();
        match purge {
            Response::Update(n) => assert_eq!(n.notification.deletes, vec![Path::root()]),
            other => panic!("unexpected {:?}", other),
        }
        let last: Response = read_frame(&mut stream).await.unwrap().unwrap();
        assert!(matches!(last, Response::NotServed { .. }), "{:?}", last);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_wildcard_stream_skips_deletes_for_unserved_targets() {
        let h = Harness::start(&["r1"]).await;

        let mut stream = h.client().await;
        let request = Request::Subscribe {
            target: "*".into(),
            prefix: Path::root(),
            mode: SubscribeMode::Stream,
        };
        write_frame(&mut stream, &request).await.unwrap();
        let sync: Response = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(sync, Response::SyncComplete);

        let r2 = TargetName::new("r2");
        let stale = Path::parse("/system/hostname").unwrap();
        h.cache.put(&r2, stale.clone(), TypedValue::from("r2.lab"), 1, 1);
        assert_eq!(h.cache.delete(&r2, &stale, 2, 1), 1);
        h.dialer.target("r1").send(hostname(3, "r1.lab"));

        let next: Response = tokio::time::timeout(Duration::from_secs(3), read_frame(&mut stream))
            .await
            .expect("no update for served target")
            .unwrap()
            .unwrap();
        match next {
            Response::Update(n) => {
                assert_eq!(n.target, TargetName::new("r1"));
                assert!(n.notification.deletes.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
        h.stop().await;
    }

    #[tokio::test]
    async fn test_subscribe_once_ends_after_replay() {
        let h = Harness::start(&["r1"]).await;
        h.dialer.target("r1").send(hostname(1, "r1.lab"));
        settle().await;

        let mut stream = h.client().await;
        let request = Request::Subscribe {
            target: "*".into(),
            prefix: Path::root(),
            mode: SubscribeMode::Once,
        };
        write_frame(&mut stream, &request).await.unwrap();
        let replay: Response = read_frame(&mut stream).await.unwrap().unwrap();
        assert!(matches!(replay, Response::Update(_)));
        let sync: Response = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(sync, Response::SyncComplete);
        assert!(read_frame::<_, Response>(&mut stream).await.unwrap().is_none());
        h.stop().await;
    }

    #[tokio::test]
    async fn test_set_is_forwarded_to_live_target() {
        let h = Harness::start(&["r1"]).await;
        let request = SetRequest {
            updates: vec![Update::new(Path::parse("/interfaces/enabled").unwrap(), true)],
            ..Default::default()
        };
        let reply = h
            .call(Request::Set { target: "r1".into(), request: request.clone() })
            .await;
        assert!(matches!(reply, Response::Set(_)), "{:?}", reply);
        assert_eq!(h.dialer.target("r1").writes(), vec![request.clone()]);

        let reply = h.call(Request::Set { target: "r2".into(), request }).await;
        assert!(matches!(reply, Response::NotServed { .. }));
        h.stop().await;
    }
}
