//! Configuration types for the gateway.
//!
//! A [`GatewayConfig`] is built once, validated with
//! [`GatewayConfig::validate`], and then handed to every component as an
//! immutable `Arc<GatewayConfig>`.

use crate::error::{Error, Result};
use crate::filter::RejectionRule;
use crate::types::{InstanceId, TargetName};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Lowest session timeout the coordination service accepts.
pub const MIN_SESSION_TIMEOUT: Duration = Duration::from_secs(1);

/// Main configuration for a gateway instance.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Identity of this instance in the cluster.
    pub instance_id: InstanceId,

    /// Downstream server configuration.
    pub server: ServerConfig,

    /// Target list and connection limits.
    pub targets: TargetsConfig,

    /// Cluster coordination configuration.
    pub cluster: ClusterConfig,

    /// Reconnect policy for target connections.
    pub reconnect: ReconnectConfig,

    /// TLS settings for outbound target connections. `None` dials in plaintext.
    pub client_tls: Option<ClientTlsConfig>,

    /// Updates matching any of these patterns are dropped before the cache.
    pub update_rejections: Vec<RejectionRule>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            instance_id: InstanceId::random(),
            server: ServerConfig::default(),
            targets: TargetsConfig::default(),
            cluster: ClusterConfig::default(),
            reconnect: ReconnectConfig::default(),
            client_tls: None,
            update_rejections: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Create a configuration with the given instance id.
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            ..Default::default()
        }
    }

    /// Set the server configuration.
    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.server = server;
        self
    }

    /// Set the targets configuration.
    pub fn with_targets(mut self, targets: TargetsConfig) -> Self {
        self.targets = targets;
        self
    }

    /// Set the cluster configuration.
    pub fn with_cluster(mut self, cluster: ClusterConfig) -> Self {
        self.cluster = cluster;
        self
    }

    /// Set the reconnect policy.
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Enable TLS for outbound target connections.
    pub fn with_client_tls(mut self, tls: ClientTlsConfig) -> Self {
        self.client_tls = Some(tls);
        self
    }

    /// Set the update rejection rules.
    pub fn with_update_rejections(mut self, rules: Vec<RejectionRule>) -> Self {
        self.update_rejections = rules;
        self
    }

    /// Set the maximum number of concurrently open target connections.
    pub fn with_target_limit(mut self, limit: usize) -> Self {
        self.targets.limit = limit;
        self
    }

    /// Set the dial timeout for target connections.
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.targets.dial_timeout = timeout;
        self
    }

    /// Check the configuration for combinations that cannot work.
    ///
    /// `prebuilt_server_tls` is true when the caller supplies a ready
    /// acceptor instead of certificate paths.
    pub fn validate(&self, prebuilt_server_tls: bool) -> Result<()> {
        if self.targets.limit == 0 {
            return Err(Error::Config("target limit must be at least 1".into()));
        }
        if self.targets.reload_interval.is_zero() {
            return Err(Error::Config("target reload interval must be non-zero".into()));
        }
        if self.targets.dial_timeout.is_zero() || self.targets.write_timeout.is_zero() {
            return Err(Error::Config(
                "target dial and write timeouts must be non-zero".into(),
            ));
        }

        if self.cluster.enabled() {
            if !self.server.enabled {
                return Err(Error::Config(
                    "clustering requires the server to be enabled".into(),
                ));
            }
            if self.cluster.session_timeout < MIN_SESSION_TIMEOUT {
                return Err(Error::Config(format!(
                    "session timeout {:?} is below the minimum of {:?}",
                    self.cluster.session_timeout, MIN_SESSION_TIMEOUT
                )));
            }
            if self.cluster.request_timeout.is_zero()
                || self.cluster.request_timeout >= self.cluster.tick_interval()
            {
                return Err(Error::Config(format!(
                    "coordination request timeout {:?} must be non-zero and below the renewal interval {:?}",
                    self.cluster.request_timeout,
                    self.cluster.tick_interval()
                )));
            }
        }

        if self.server.enabled && self.server.tls_requested() && !prebuilt_server_tls {
            match (&self.server.tls_cert, &self.server.tls_key) {
                (Some(_), Some(_)) => {}
                _ => {
                    return Err(Error::Config(
                        "server TLS needs both a certificate and a key".into(),
                    ))
                }
            }
        }

        if self.reconnect.initial_backoff.is_zero()
            || self.reconnect.max_backoff < self.reconnect.initial_backoff
        {
            return Err(Error::Config(
                "reconnect backoff must be non-zero and below its ceiling".into(),
            ));
        }

        Ok(())
    }
}

/// Downstream server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Whether the downstream server is started.
    pub enabled: bool,

    /// Interface address the server listens on.
    pub listen_addr: IpAddr,

    /// TCP port the server listens on. `0` picks a free port.
    pub listen_port: u16,

    /// Host where other cluster members and clients reach this server.
    /// Defaults to the listen address.
    pub advertise_addr: Option<String>,

    /// Port where other cluster members and clients reach this server.
    /// Defaults to the listen port.
    pub advertise_port: Option<u16>,

    /// PEM certificate chain for server TLS.
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for server TLS.
    pub tls_key: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 9339,
            advertise_addr: None,
            advertise_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl ServerConfig {
    /// An enabled server listening on `addr`.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            enabled: true,
            listen_addr: addr.ip(),
            listen_port: addr.port(),
            ..Default::default()
        }
    }

    /// Set the advertised host and port.
    pub fn with_advertise(mut self, host: impl Into<String>, port: u16) -> Self {
        self.advertise_addr = Some(host.into());
        self.advertise_port = Some(port);
        self
    }

    /// Serve over TLS using PEM files.
    pub fn with_tls(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.tls_cert = Some(cert.into());
        self.tls_key = Some(key.into());
        self
    }

    /// Whether any TLS material was configured.
    pub fn tls_requested(&self) -> bool {
        self.tls_cert.is_some() || self.tls_key.is_some()
    }

    /// The socket address to bind.
    pub fn listen_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.listen_port)
    }

    /// The `host:port` peers should use, given the port actually bound.
    pub fn advertised(&self, bound_port: u16) -> String {
        let host = self
            .advertise_addr
            .clone()
            .unwrap_or_else(|| self.listen_addr.to_string());
        let port = self.advertise_port.unwrap_or(bound_port);
        format!("{}:{}", host, port)
    }
}

/// Target list and connection limits.
#[derive(Debug, Clone)]
pub struct TargetsConfig {
    /// JSON file holding the target list.
    pub file: Option<PathBuf>,

    /// Interval between target list reloads.
    pub reload_interval: Duration,

    /// Timeout for dialing a target.
    pub dial_timeout: Duration,

    /// Timeout for a pass-through write once connected.
    pub write_timeout: Duration,

    /// Maximum number of targets this instance connects to at once.
    pub limit: usize,
}

impl Default for TargetsConfig {
    fn default() -> Self {
        Self {
            file: None,
            reload_interval: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            limit: 100,
        }
    }
}

impl TargetsConfig {
    /// Load targets from a JSON file.
    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Set the reload interval.
    pub fn with_reload_interval(mut self, interval: Duration) -> Self {
        self.reload_interval = interval;
        self
    }
}

/// Cluster coordination configuration.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Coordination service hosts. Non-empty enables clustering.
    pub hosts: Vec<String>,

    /// Prefix of the lock namespace, e.g. `/telemetry/gateway`.
    pub lock_prefix: String,

    /// Session timeout. Failover takes up to twice this long.
    pub session_timeout: Duration,

    /// Timeout for a single request to the coordination service.
    pub request_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            lock_prefix: "/telemetry/gateway".to_string(),
            session_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl ClusterConfig {
    /// Clustering against the given coordination hosts.
    pub fn new(hosts: Vec<String>) -> Self {
        Self {
            hosts,
            ..Default::default()
        }
    }

    /// Set the lock prefix.
    pub fn with_lock_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.lock_prefix = prefix.into();
        self
    }

    /// Set the session timeout.
    ///
    /// The request timeout is capped at half the resulting tick so a single
    /// call cannot outlast a renewal round.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self.request_timeout = self.request_timeout.min(self.tick_interval() / 2);
        self
    }

    /// Set the timeout for a single coordination request.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Whether clustering is enabled.
    pub fn enabled(&self) -> bool {
        !self.hosts.is_empty()
    }

    /// Worst-case time for a peer to take over a crashed instance's targets.
    pub fn failover_bound(&self) -> Duration {
        self.session_timeout * 2
    }

    /// The lock node path for a target.
    pub fn lock_path(&self, target: &TargetName) -> String {
        let prefix = self.lock_prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("/{}", target)
        } else {
            format!("/{}/{}", prefix, target)
        }
    }

    /// Interval of the renewal/claim loop.
    pub fn tick_interval(&self) -> Duration {
        self.session_timeout / 3
    }

    /// Upper bound on any single coordination call.
    pub fn call_timeout(&self) -> Duration {
        self.request_timeout.min(self.tick_interval())
    }
}

/// Reconnect policy for target connections.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_backoff: Duration,

    /// Ceiling for the retry delay.
    pub max_backoff: Duration,

    /// Growth factor between consecutive retries.
    pub multiplier: f64,

    /// Random spread applied to each delay, as a fraction (0.0 - 1.0).
    pub jitter: f64,

    /// A stream that stays up this long resets the backoff.
    pub healthy_after: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
            healthy_after: Duration::from_secs(30),
        }
    }
}

/// TLS settings for outbound target connections.
#[derive(Debug, Clone)]
pub struct ClientTlsConfig {
    /// PEM bundle of trusted CA certificates.
    pub ca_cert: PathBuf,

    /// PEM client certificate chain, for mutual TLS.
    pub client_cert: Option<PathBuf>,

    /// PEM client key, for mutual TLS.
    pub client_key: Option<PathBuf>,

    /// Name to verify instead of the host part of the target address.
    pub server_name: Option<String>,
}

impl ClientTlsConfig {
    /// Trust the CAs in `ca_cert`.
    pub fn new(ca_cert: impl Into<PathBuf>) -> Self {
        Self {
            ca_cert: ca_cert.into(),
            client_cert: None,
            client_key: None,
            server_name: None,
        }
    }

    /// Present a client certificate.
    pub fn with_client_auth(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.client_cert = Some(cert.into());
        self.client_key = Some(key.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = GatewayConfig::default();
        assert!(!config.cluster.enabled());
        assert!(config.validate(false).is_ok());
    }

    #[test]
    fn test_clustering_requires_server() {
        let config = GatewayConfig::default()
            .with_cluster(ClusterConfig::new(vec!["127.0.0.1:2181".into()]));
        assert!(config.validate(false).is_err());

        let config = config.with_server(ServerConfig::new("127.0.0.1:0".parse().unwrap()));
        assert!(config.validate(false).is_ok());
    }

    #[test]
    fn test_session_timeout_minimum() {
        let config = GatewayConfig::default()
            .with_server(ServerConfig::new("127.0.0.1:0".parse().unwrap()))
            .with_cluster(
                ClusterConfig::new(vec!["zk:2181".into()])
                    .with_session_timeout(Duration::from_millis(500)),
            );
        assert!(config.validate(false).is_err());
    }

    #[test]
    fn test_request_timeout_below_renewal_interval() {
        let server = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        let cluster = ClusterConfig::new(vec!["zk:2181".into()])
            .with_session_timeout(Duration::from_secs(2));
        assert!(cluster.request_timeout < cluster.tick_interval());
        let config = GatewayConfig::default()
            .with_server(server)
            .with_cluster(cluster.clone());
        assert!(config.validate(false).is_ok());

        let config = config.with_cluster(cluster.with_request_timeout(Duration::from_secs(5)));
        assert!(config.validate(false).is_err());
    }

    #[test]
    fn test_call_timeout_never_exceeds_tick() {
        let mut cluster = ClusterConfig::default().with_session_timeout(Duration::from_secs(3));
        cluster.request_timeout = Duration::from_secs(10);
        assert_eq!(cluster.call_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_server_tls_needs_cert_and_key() {
        let mut server = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        server.tls_cert = Some("cert.pem".into());
        let config = GatewayConfig::default().with_server(server);
        assert!(config.validate(false).is_err());
        assert!(config.validate(true).is_ok());

        let config = config.with_server(
            ServerConfig::new("127.0.0.1:0".parse().unwrap()).with_tls("cert.pem", "key.pem"),
        );
        assert!(config.validate(false).is_ok());
    }

    #[test]
    fn test_zero_limit_rejected() {
        let config = GatewayConfig::default().with_target_limit(0);
        assert!(config.validate(false).is_err());
    }

    #[test]
    fn test_lock_path() {
        let cluster = ClusterConfig::default().with_lock_prefix("/gnmi/gateway/");
        assert_eq!(cluster.lock_path(&"router1".into()), "/gnmi/gateway/router1");

        let cluster = ClusterConfig::default().with_lock_prefix("");
        assert_eq!(cluster.lock_path(&"router1".into()), "/router1");
    }

    #[test]
    fn test_advertised_defaults() {
        let server = ServerConfig::new("10.0.0.5:9339".parse().unwrap());
        assert_eq!(server.advertised(9339), "10.0.0.5:9339");

        let server = server.with_advertise("gw.example.net", 443);
        assert_eq!(server.advertised(9339), "gw.example.net:443");
    }

    #[test]
    fn test_failover_bound() {
        let cluster = ClusterConfig::default().with_session_timeout(Duration::from_secs(2));
        assert_eq!(cluster.failover_bound(), Duration::from_secs(4));
    }
}
