//! Lock service over TCP.
//!
//! [`LockServer`] exposes a [`MemoryLockService`] with the crate's framed
//! bincode codec; [`RemoteLockService`] is the client side, so gateway
//! instances in separate processes can share one lock table.

use super::lock_service::{CoordinationResult, LockOwner, LockService, SessionId};
use super::memory::MemoryLockService;
use crate::error::{CoordinationError, Result};
use crate::network::{
    read_frame, write_frame, BoxedStream, ConnectionHandler, NetworkServer, PlainAcceptor,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Request sent to a [`LockServer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LockRequest {
    OpenSession { owner: LockOwner, timeout: Duration },
    KeepAlive { session: SessionId },
    TryAcquire { path: String, session: SessionId },
    Release { path: String, session: SessionId },
    CloseSession { session: SessionId },
    Owner { path: String },
}

/// Response from a [`LockServer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LockResponse {
    Session(SessionId),
    Done,
    Acquired(bool),
    Owner(Option<LockOwner>),
    Error(CoordinationError),
}

impl<T> From<CoordinationResult<T>> for LockResponse
where
    T: Into<LockResponse>,
{
    fn from(result: CoordinationResult<T>) -> Self {
        match result {
            Ok(value) => value.into(),
            Err(e) => LockResponse::Error(e),
        }
    }
}

impl From<()> for LockResponse {
    fn from(_: ()) -> Self {
        LockResponse::Done
    }
}

impl From<bool> for LockResponse {
    fn from(acquired: bool) -> Self {
        LockResponse::Acquired(acquired)
    }
}

impl From<Option<LockOwner>> for LockResponse {
    fn from(owner: Option<LockOwner>) -> Self {
        LockResponse::Owner(owner)
    }
}

struct LockHandler {
    service: Arc<MemoryLockService>,
}

impl LockHandler {
    async fn dispatch(&self, request: LockRequest) -> LockResponse {
        let service = &self.service;
        match request {
            LockRequest::OpenSession { owner, timeout } => {
                match service.open_session(owner, timeout).await {
                    Ok(id) => LockResponse::Session(id),
                    Err(e) => LockResponse::Error(e),
                }
            }
            LockRequest::KeepAlive { session } => service.keep_alive(session).await.into(),
            LockRequest::TryAcquire { path, session } => {
                service.try_acquire(&path, session).await.into()
            }
            LockRequest::Release { path, session } => {
                service.release(&path, session).await.into()
            }
            LockRequest::CloseSession { session } => service.close_session(session).await.into(),
            LockRequest::Owner { path } => service.owner(&path).await.into(),
        }
    }
}

#[async_trait]
impl ConnectionHandler for LockHandler {
    async fn handle(
        &self,
        mut stream: BoxedStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<()> {
        loop {
            let request: LockRequest = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                frame = read_frame(&mut stream) => match frame? {
                    Some(request) => request,
                    None => {
                        debug!(%peer, "Lock client disconnected");
                        return Ok(());
                    }
                },
            };
            let response = self.dispatch(request).await;
            write_frame(&mut stream, &response).await?;
        }
    }
}

/// A running lock server.
pub struct LockServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl LockServer {
    /// Serve `service` on `addr`.
    pub async fn start(service: Arc<MemoryLockService>, addr: SocketAddr) -> Result<Self> {
        let server = NetworkServer::bind(
            "lock",
            addr,
            Arc::new(PlainAcceptor),
            Arc::new(LockHandler { service }),
        )
        .await?;
        let local_addr = server.local_addr()?;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.run(shutdown.clone()));
        Ok(Self {
            local_addr,
            shutdown,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close open client connections.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Lock server task failed");
        }
    }
}

/// Client for a [`LockServer`].
///
/// Calls are serialized over one connection, re-established on the next
/// call after any failure. Hosts are tried in rotation.
pub struct RemoteLockService {
    hosts: Vec<String>,
    request_timeout: Duration,
    conn: tokio::sync::Mutex<Option<TcpStream>>,
    next_host: AtomicUsize,
}

impl RemoteLockService {
    pub fn new(hosts: Vec<String>, request_timeout: Duration) -> Self {
        Self {
            hosts,
            request_timeout,
            conn: tokio::sync::Mutex::new(None),
            next_host: AtomicUsize::new(0),
        }
    }

    async fn connect(&self) -> std::result::Result<TcpStream, String> {
        if self.hosts.is_empty() {
            return Err("no coordination hosts configured".to_string());
        }
        let mut last_error = String::new();
        for _ in 0..self.hosts.len() {
            let idx = self.next_host.fetch_add(1, Ordering::Relaxed) % self.hosts.len();
            let host = &self.hosts[idx];
            match TcpStream::connect(host).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    debug!(%host, "Connected to lock server");
                    return Ok(stream);
                }
                Err(e) => last_error = format!("{}: {}", host, e),
            }
        }
        Err(last_error)
    }

    async fn call(&self, request: LockRequest) -> CoordinationResult<LockResponse> {
        let mut conn = self.conn.lock().await;
        let exchange = async {
            if conn.is_none() {
                *conn = Some(self.connect().await?);
            }
            let stream = match conn.as_mut() {
                Some(stream) => stream,
                None => return Err("not connected".to_string()),
            };
            write_frame(stream, &request)
                .await
                .map_err(|e| e.to_string())?;
            match read_frame::<_, LockResponse>(stream).await {
                Ok(Some(response)) => Ok::<_, String>(response),
                Ok(None) => Err("connection closed".to_string()),
                Err(e) => Err(e.to_string()),
            }
        };

        let result = match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err("request timed out".to_string()),
        };
        match result {
            Ok(LockResponse::Error(e)) => Err(e),
            Ok(response) => Ok(response),
            Err(reason) => {
                *conn = None;
                Err(CoordinationError::Unavailable(reason))
            }
        }
    }
}

fn unexpected(response: LockResponse) -> CoordinationError {
    CoordinationError::Unavailable(format!("unexpected lock response {:?}", response))
}

#[async_trait]
impl LockService for RemoteLockService {
    async fn open_session(
        &self,
        owner: LockOwner,
        timeout: Duration,
    ) -> CoordinationResult<SessionId> {
        match self.call(LockRequest::OpenSession { owner, timeout }).await? {
            LockResponse::Session(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    async fn keep_alive(&self, session: SessionId) -> CoordinationResult<()> {
        match self.call(LockRequest::KeepAlive { session }).await? {
            LockResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn try_acquire(&self, path: &str, session: SessionId) -> CoordinationResult<bool> {
        let request = LockRequest::TryAcquire {
            path: path.to_string(),
            session,
        };
        match self.call(request).await? {
            LockResponse::Acquired(acquired) => Ok(acquired),
            other => Err(unexpected(other)),
        }
    }

    async fn release(&self, path: &str, session: SessionId) -> CoordinationResult<()> {
        let request = LockRequest::Release {
            path: path.to_string(),
            session,
        };
        match self.call(request).await? {
            LockResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn close_session(&self, session: SessionId) -> CoordinationResult<()> {
        match self.call(LockRequest::CloseSession { session }).await? {
            LockResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn owner(&self, path: &str) -> CoordinationResult<Option<LockOwner>> {
        let request = LockRequest::Owner {
            path: path.to_string(),
        };
        match self.call(request).await? {
            LockResponse::Owner(owner) => Ok(owner),
            other => Err(unexpected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InstanceId;

    fn owner(name: &str) -> LockOwner {
        LockOwner::new(InstanceId::new(name), None)
    }

    #[tokio::test]
    async fn test_remote_roundtrip() {
        let table = Arc::new(MemoryLockService::new());
        let server = LockServer::start(table.clone(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let hosts = vec![server.local_addr().to_string()];
        let a = RemoteLockService::new(hosts.clone(), Duration::from_secs(1));
        let b = RemoteLockService::new(hosts, Duration::from_secs(1));

        let sa = a.open_session(owner("a"), Duration::from_secs(5)).await.unwrap();
        let sb = b.open_session(owner("b"), Duration::from_secs(5)).await.unwrap();
        assert!(a.try_acquire("/gw/r1", sa).await.unwrap());
        assert!(!b.try_acquire("/gw/r1", sb).await.unwrap());
        assert_eq!(
            b.owner("/gw/r1").await.unwrap().map(|o| o.instance),
            Some(InstanceId::new("a"))
        );
        assert_eq!(table.holder("/gw/r1"), Some(InstanceId::new("a")));

        a.keep_alive(sa).await.unwrap();
        a.release("/gw/r1", sa).await.unwrap();
        assert!(b.try_acquire("/gw/r1", sb).await.unwrap());

        assert_eq!(
            a.release("/gw/r1", sa).await,
            Err(CoordinationError::NotHeld("/gw/r1".into()))
        );

        b.close_session(sb).await.unwrap();
        assert_eq!(table.lock_count(), 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_service_is_unavailable() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = RemoteLockService::new(vec![addr.to_string()], Duration::from_secs(1));
        assert!(matches!(
            client.keep_alive(1).await,
            Err(CoordinationError::Unavailable(_))
        ));
    }
}
