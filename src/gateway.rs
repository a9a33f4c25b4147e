//! The assembled gateway.
//!
//! ```text
//!  TargetSource ─▶ TargetStore ──watch──┬──▶ ClusterCoordinator
//!                                       │           │ OwnershipEvent
//!                                       ▼           ▼
//!                                  ConnectionManager ──▶ UpdateFilter ──▶ Cache
//!                                                                           │
//!                                        downstream clients ◀── GatewayServer
//! ```

use crate::cache::Cache;
use crate::cluster::{
    ClusterCoordinator, LockCoordinator, LockOwner, LockService, OwnershipListener,
    RemoteLockService, StaticCoordinator,
};
use crate::config::GatewayConfig;
use crate::connections::{ConnectionManager, ConnectionState, Dialer, TcpDialer};
use crate::error::{Error, NetworkError, Result};
use crate::filter::{RejectionRule, UpdateFilter};
use crate::metrics::GatewayMetrics;
use crate::network::{Acceptor, NetworkServer, PlainAcceptor, TlsAcceptor, TlsConnector};
use crate::server::GatewayServer;
use crate::targets::{JsonFileSource, StaticSource, TargetSnapshot, TargetSource, TargetStore};
use crate::types::{InstanceId, TargetName};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Assembles a [`Gateway`] from configuration and optional collaborators.
pub struct GatewayBuilder {
    config: GatewayConfig,
    dialer: Option<Arc<dyn Dialer>>,
    source: Option<Arc<dyn TargetSource>>,
    lock_service: Option<Arc<dyn LockService>>,
    acceptor: Option<Arc<dyn Acceptor>>,
    listeners: Vec<Arc<dyn OwnershipListener>>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            dialer: None,
            source: None,
            lock_service: None,
            acceptor: None,
            listeners: Vec::new(),
        }
    }

    /// Dial targets with `dialer` instead of the TCP dialer.
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Read the target list from `source` instead of the configured file.
    pub fn with_target_source(mut self, source: Arc<dyn TargetSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Coordinate through `service` instead of the configured hosts.
    /// Enables clustering.
    pub fn with_lock_service(mut self, service: Arc<dyn LockService>) -> Self {
        self.lock_service = Some(service);
        self
    }

    /// Serve downstream clients through a prebuilt acceptor, e.g. a
    /// [`TlsAcceptor`] with credentials loaded elsewhere.
    pub fn with_acceptor(mut self, acceptor: Arc<dyn Acceptor>) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    pub fn with_ownership_listener(mut self, listener: Arc<dyn OwnershipListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Validate the configuration and wire the components.
    ///
    /// Invalid server TLS material is fatal here.
    pub fn build(self) -> Result<Gateway> {
        self.config.validate(self.acceptor.is_some())?;
        if self.lock_service.is_some() && !self.config.server.enabled {
            return Err(Error::Config(
                "clustering requires the server to be enabled".into(),
            ));
        }

        let config = Arc::new(self.config);
        let metrics = Arc::new(GatewayMetrics::new());

        let acceptor: Arc<dyn Acceptor> = match self.acceptor {
            Some(acceptor) => acceptor,
            None => match (&config.server.tls_cert, &config.server.tls_key) {
                (Some(cert), Some(key)) if config.server.enabled => {
                    Arc::new(TlsAcceptor::from_pem(cert, key)?)
                }
                _ => Arc::new(PlainAcceptor),
            },
        };

        let dialer: Arc<dyn Dialer> = match self.dialer {
            Some(dialer) => dialer,
            None => {
                let dialer = match &config.client_tls {
                    Some(tls) => TcpDialer::with_tls(Arc::new(TlsConnector::from_pem(tls)?)),
                    None => TcpDialer::new(),
                };
                Arc::new(
                    dialer.with_timeouts(config.targets.dial_timeout, config.targets.write_timeout),
                )
            }
        };

        let source: Arc<dyn TargetSource> = match (self.source, &config.targets.file) {
            (Some(source), _) => source,
            (None, Some(file)) => Arc::new(JsonFileSource::new(file.clone())),
            (None, None) => {
                warn!("No target source configured, starting with an empty target list");
                Arc::new(StaticSource::default())
            }
        };

        let cache = Arc::new(Cache::new());
        let filter = Arc::new(UpdateFilter::new(
            config.update_rejections.clone(),
            metrics.clone(),
        ));
        let store = Arc::new(TargetStore::new(source, metrics.clone()));
        let connections = Arc::new(ConnectionManager::new(
            config.clone(),
            dialer,
            cache.clone(),
            filter.clone(),
            metrics.clone(),
        ));

        Ok(Gateway {
            config,
            metrics,
            cache,
            filter,
            store,
            connections,
            acceptor,
            lock_service: self.lock_service,
            listeners: self.listeners,
            coordinator: Mutex::new(None),
            local_addr: Mutex::new(None),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// A running (or startable) telemetry gateway instance.
pub struct Gateway {
    config: Arc<GatewayConfig>,
    metrics: Arc<GatewayMetrics>,
    cache: Arc<Cache>,
    filter: Arc<UpdateFilter>,
    store: Arc<TargetStore>,
    connections: Arc<ConnectionManager>,
    acceptor: Arc<dyn Acceptor>,
    lock_service: Option<Arc<dyn LockService>>,
    listeners: Vec<Arc<dyn OwnershipListener>>,
    coordinator: Mutex<Option<Arc<dyn ClusterCoordinator>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    /// Load the target list, bind the server, and start coordination,
    /// connections and the reload loop.
    pub async fn start(&self) -> Result<()> {
        if self.coordinator.lock().is_some() {
            return Ok(());
        }
        // A failed first load is retried by the reload loop.
        let _ = self.store.reload().await;

        let listener = if self.config.server.enabled {
            let addr = self.config.server.listen_socket_addr();
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| NetworkError::ConnectionFailed {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                })?;
            let bound = listener.local_addr().map_err(NetworkError::Io)?;
            *self.local_addr.lock() = Some(bound);
            Some((listener, self.config.server.advertised(bound.port())))
        } else {
            None
        };

        let owner = LockOwner::new(
            self.config.instance_id.clone(),
            listener.as_ref().map(|(_, advertised)| advertised.clone()),
        );
        let coordinator = self.coordinator_for(owner);

        self.connections
            .start(coordinator.subscribe(), self.store.watch());
        coordinator.start().await?;
        *self.coordinator.lock() = Some(coordinator.clone());

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(self.store.clone().run(
            self.config.targets.reload_interval,
            self.shutdown.child_token(),
        )));

        if let Some((listener, advertised)) = listener {
            let handler = GatewayServer::new(
                self.config.instance_id.clone(),
                self.cache.clone(),
                self.connections.clone(),
                coordinator,
                self.metrics.clone(),
            );
            let server = NetworkServer::from_listener(
                "gateway",
                listener,
                self.acceptor.clone(),
                Arc::new(handler),
            );
            let shutdown = self.shutdown.child_token();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = server.run(shutdown).await {
                    warn!(error = %e, "Gateway server stopped with error");
                }
            }));
            info!(
                instance = %self.config.instance_id,
                advertise = %advertised,
                "Gateway started"
            );
        } else {
            info!(instance = %self.config.instance_id, "Gateway started without server");
        }
        self.tasks.lock().extend(tasks);
        Ok(())
    }

    fn coordinator_for(&self, owner: LockOwner) -> Arc<dyn ClusterCoordinator> {
        let cluster = &self.config.cluster;
        let service: Option<Arc<dyn LockService>> = match &self.lock_service {
            Some(service) => Some(service.clone()),
            None if cluster.enabled() => Some(Arc::new(RemoteLockService::new(
                cluster.hosts.clone(),
                cluster.request_timeout,
            ))),
            None => None,
        };
        match service {
            Some(service) => Arc::new(LockCoordinator::new(
                cluster.clone(),
                self.config.targets.limit,
                owner,
                service,
                self.store.watch(),
                self.listeners.clone(),
                self.metrics.clone(),
            )),
            None => Arc::new(StaticCoordinator::new(
                owner,
                self.store.watch(),
                self.listeners.clone(),
                self.metrics.clone(),
            )),
        }
    }

    /// Stop serving, close every connection, release held locks and wait
    /// for the background tasks.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.connections.stop().await;
        let coordinator = self.coordinator.lock().take();
        if let Some(coordinator) = coordinator {
            coordinator.stop().await;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!(instance = %self.config.instance_id, "Gateway stopped");
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.config.instance_id
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    /// The active target list.
    pub fn targets(&self) -> Arc<TargetSnapshot> {
        self.store.current()
    }

    /// Re-read the target source now instead of waiting for the interval.
    pub async fn reload_targets(&self) -> Result<()> {
        self.store.reload().await.map(|_| ())
    }

    /// Atomically replace the update rejection rules.
    pub fn set_rejection_rules(&self, rules: Vec<RejectionRule>) {
        self.filter.replace_rules(rules);
    }

    /// Targets whose lock this instance holds.
    pub fn owned_targets(&self) -> Vec<TargetName> {
        match self.coordinator.lock().as_ref() {
            Some(coordinator) => coordinator.owned_targets(),
            None => Vec::new(),
        }
    }

    /// Targets with a live stream on this instance.
    pub fn served_targets(&self) -> Vec<TargetName> {
        self.connections.served_targets()
    }

    pub fn connection_states(&self) -> BTreeMap<TargetName, ConnectionState> {
        self.connections.states()
    }

    /// Connections currently dialing, streaming or backing off.
    pub fn open_connections(&self) -> usize {
        self.connections.open_count()
    }

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}
