//! Outbound target sessions.
//!
//! A [`Dialer`] turns a [`Target`] into a live [`TargetSession`]: a stream
//! of notifications that starts with a full-state replay ended by
//! [`SessionEvent::SyncComplete`].

use crate::error::{Error, NetworkError, Result};
use crate::network::tls::host_of;
use crate::network::{read_frame, write_frame, BoxedStream, Connector, PlainConnector};
use crate::server::rpc::{Request, Response, SubscribeMode};
use crate::targets::Target;
use crate::types::{Notification, Path, SetRequest, SetResponse, TargetName};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Something received on a target session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Notification(Notification),
    /// The initial full-state replay is complete.
    SyncComplete,
}

/// Pass-through writes to a target.
#[async_trait]
pub trait TargetWriter: Send + Sync + 'static {
    async fn set(&self, request: SetRequest) -> Result<SetResponse>;
}

/// A live streaming session with one target.
#[async_trait]
pub trait TargetSession: Send + 'static {
    /// Next event. Errors end the session.
    async fn recv(&mut self) -> Result<SessionEvent>;

    /// Writer usable while the session is alive.
    fn writer(&self) -> Arc<dyn TargetWriter>;
}

/// Opens sessions to targets.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, target: &Target) -> Result<Box<dyn TargetSession>>;
}

/// Dials targets speaking the gateway wire protocol over TCP.
///
/// The dialer subscribes to the target's whole tree in `Stream` mode. The
/// name requested from the endpoint is the target name unless the target
/// carries an `origin` meta entry.
///
/// Pass-through writes open their own connection, bounded by the target's
/// dial timeout, and the exchange is bounded by the write timeout.
#[derive(Clone)]
pub struct TcpDialer {
    tls: Option<Arc<dyn Connector>>,
    dial_timeout: Duration,
    write_timeout: Duration,
}

impl TcpDialer {
    /// A dialer for plaintext targets only.
    pub fn new() -> Self {
        Self {
            tls: None,
            dial_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
        }
    }

    /// A dialer that uses `connector` for targets marked `tls`.
    pub fn with_tls(connector: Arc<dyn Connector>) -> Self {
        Self {
            tls: Some(connector),
            ..Self::new()
        }
    }

    /// Set the default dial timeout and the write timeout.
    pub fn with_timeouts(mut self, dial_timeout: Duration, write_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self.write_timeout = write_timeout;
        self
    }

    fn connector(&self, target: &Target) -> Result<Arc<dyn Connector>> {
        if !target.tls {
            return Ok(Arc::new(PlainConnector));
        }
        self.tls.clone().ok_or_else(|| {
            Error::Config(format!(
                "target {} requires TLS but no client TLS is configured",
                target.name
            ))
        })
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new()
    }
}

/// Connect to the first reachable address of `target`.
async fn connect(target: &Target, connector: &dyn Connector) -> Result<(String, BoxedStream)> {
    let mut last_error = None;
    for addr in &target.addresses {
        match TcpStream::connect(addr.as_str()).await {
            Ok(socket) => {
                let _ = socket.set_nodelay(true);
                let stream = connector.connect(socket, host_of(addr)).await?;
                return Ok((addr.clone(), stream));
            }
            Err(e) => {
                debug!(target = %target.name, %addr, error = %e, "Address unreachable");
                last_error = Some(NetworkError::ConnectionFailed {
                    addr: addr.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| NetworkError::InvalidAddress(format!("{} has no address", target.name)))
        .into())
}

fn origin(target: &Target) -> TargetName {
    target
        .meta
        .get("origin")
        .map(|o| TargetName::new(o.as_str()))
        .unwrap_or_else(|| target.name.clone())
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, target: &Target) -> Result<Box<dyn TargetSession>> {
        let connector = self.connector(target)?;
        let (addr, mut stream) = connect(target, connector.as_ref()).await?;
        let origin = origin(target);

        write_frame(
            &mut stream,
            &Request::Subscribe {
                target: origin.clone(),
                prefix: Path::root(),
                mode: SubscribeMode::Stream,
            },
        )
        .await?;
        debug!(target = %target.name, %addr, "Subscription sent");

        let writer = Arc::new(TcpWriter {
            target: target.clone(),
            origin: origin.clone(),
            connector,
            dial_timeout: target.dial_timeout.unwrap_or(self.dial_timeout),
            write_timeout: self.write_timeout,
        });
        Ok(Box::new(TcpSession {
            origin,
            stream,
            writer,
        }))
    }
}

struct TcpSession {
    origin: TargetName,
    stream: BoxedStream,
    writer: Arc<TcpWriter>,
}

#[async_trait]
impl TargetSession for TcpSession {
    async fn recv(&mut self) -> Result<SessionEvent> {
        match read_frame::<_, Response>(&mut self.stream).await? {
            Some(Response::Update(update)) => Ok(SessionEvent::Notification(update.notification)),
            Some(Response::SyncComplete) => Ok(SessionEvent::SyncComplete),
            Some(Response::NotServed { target, owner }) => Err(NetworkError::Remote(format!(
                "{} not served{}",
                target,
                owner.map(|o| format!(", owner {}", o)).unwrap_or_default()
            ))
            .into()),
            Some(Response::Error(reason)) => Err(NetworkError::Remote(reason).into()),
            Some(other) => Err(NetworkError::UnexpectedResponse(format!(
                "{:?} on subscription to {}",
                other, self.origin
            ))
            .into()),
            None => Err(NetworkError::ConnectionClosed.into()),
        }
    }

    fn writer(&self) -> Arc<dyn TargetWriter> {
        self.writer.clone()
    }
}

/// Writes over a short-lived request connection.
struct TcpWriter {
    target: Target,
    origin: TargetName,
    connector: Arc<dyn Connector>,
    dial_timeout: Duration,
    write_timeout: Duration,
}

impl TcpWriter {
    async fn exchange(&self, stream: &mut BoxedStream, request: SetRequest) -> Result<SetResponse> {
        write_frame(
            stream,
            &Request::Set {
                target: self.origin.clone(),
                request,
            },
        )
        .await?;
        match read_frame::<_, Response>(stream).await? {
            Some(Response::Set(response)) => Ok(response),
            Some(Response::Error(reason)) => Err(NetworkError::Remote(reason).into()),
            Some(Response::NotServed { target, .. }) => Err(Error::NotServed(target)),
            Some(other) => Err(NetworkError::UnexpectedResponse(format!("{:?}", other)).into()),
            None => Err(NetworkError::ConnectionClosed.into()),
        }
    }
}

#[async_trait]
impl TargetWriter for TcpWriter {
    async fn set(&self, request: SetRequest) -> Result<SetResponse> {
        let connecting = connect(&self.target, self.connector.as_ref());
        let (addr, mut stream) = match tokio::time::timeout(self.dial_timeout, connecting).await {
            Ok(connected) => connected?,
            Err(_) => {
                warn!(target = %self.target.name, "Write connection timed out");
                return Err(Error::Timeout);
            }
        };
        match tokio::time::timeout(self.write_timeout, self.exchange(&mut stream, request)).await {
            Ok(response) => response,
            Err(_) => {
                warn!(target = %self.target.name, %addr, "Target did not answer write");
                Err(Error::Timeout)
            }
        }
    }
}
