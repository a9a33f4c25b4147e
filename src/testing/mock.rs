//! Scripted targets for tests.
//!
//! [`MockDialer`] hands out in-process sessions driven through
//! [`MockTarget`] handles. [`MockTargetServer`] is a real TCP endpoint
//! speaking the gateway wire protocol, for exercising [`TcpDialer`].
//!
//! [`TcpDialer`]: crate::connections::TcpDialer

use crate::connections::{Dialer, SessionEvent, TargetSession, TargetWriter};
use crate::error::{NetworkError, Result};
use crate::network::{
    read_frame, write_frame, BoxedStream, ConnectionHandler, NetworkServer, PlainAcceptor,
};
use crate::server::rpc::{Request, Response, SubscribeMode, TargetNotification};
use crate::targets::Target;
use crate::types::{now_nanos, Notification, SetRequest, SetResponse, TargetName};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Handle to one scripted target.
#[derive(Default)]
pub struct MockTarget {
    dials: AtomicUsize,
    sessions: AtomicUsize,
    peak_sessions: AtomicUsize,
    fail_dials: AtomicUsize,
    hang_dials: AtomicUsize,
    live: Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
    writes: Arc<Mutex<Vec<SetRequest>>>,
}

impl MockTarget {
    /// Fail the next `n` dials.
    pub fn fail_dials(&self, n: usize) {
        self.fail_dials.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` dials never complete.
    pub fn hang_dials(&self, n: usize) {
        self.hang_dials.store(n, Ordering::SeqCst);
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Sessions currently open, across every dialer sharing this target.
    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Highest number of sessions ever open at once.
    pub fn peak_sessions(&self) -> usize {
        self.peak_sessions.load(Ordering::SeqCst)
    }

    /// Whether a session is currently open.
    pub fn is_connected(&self) -> bool {
        self.live.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Push a notification on the open session, if any.
    pub fn send(&self, notification: Notification) -> bool {
        self.push(SessionEvent::Notification(notification))
    }

    /// Mark the end of the initial replay.
    pub fn sync_complete(&self) -> bool {
        self.push(SessionEvent::SyncComplete)
    }

    /// Drop the open session; the gateway sees a stream error.
    pub fn disconnect(&self) {
        self.live.lock().take();
    }

    /// Set requests received so far.
    pub fn writes(&self) -> Vec<SetRequest> {
        self.writes.lock().clone()
    }

    fn push(&self, event: SessionEvent) -> bool {
        match self.live.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    fn take_counter(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Dialer over in-process [`MockTarget`]s. Unknown targets are created on
/// first dial and accept the connection.
#[derive(Default)]
pub struct MockDialer {
    targets: Mutex<HashMap<TargetName, Arc<MockTarget>>>,
}

impl MockDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for `name`, created if needed.
    pub fn target(&self, name: &str) -> Arc<MockTarget> {
        self.targets
            .lock()
            .entry(TargetName::new(name))
            .or_default()
            .clone()
    }

    /// Targets with an open session, sorted.
    pub fn connected(&self) -> Vec<TargetName> {
        let mut names: Vec<_> = self
            .targets
            .lock()
            .iter()
            .filter(|(_, t)| t.is_connected())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, target: &Target) -> Result<Box<dyn TargetSession>> {
        let mock = self.target(target.name.as_str());
        mock.dials.fetch_add(1, Ordering::SeqCst);

        if MockTarget::take_counter(&mock.fail_dials) {
            return Err(NetworkError::ConnectionFailed {
                addr: target.addresses.first().cloned().unwrap_or_default(),
                reason: "connection refused".to_string(),
            }
            .into());
        }
        if MockTarget::take_counter(&mock.hang_dials) {
            std::future::pending::<()>().await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *mock.live.lock() = Some(tx);
        let open = mock.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        mock.peak_sessions.fetch_max(open, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            rx,
            writer: Arc::new(MockWriter {
                writes: mock.writes.clone(),
            }),
            target: mock,
        }))
    }
}

struct MockSession {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    writer: Arc<MockWriter>,
    target: Arc<MockTarget>,
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.target.sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TargetSession for MockSession {
    async fn recv(&mut self) -> Result<SessionEvent> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| NetworkError::ConnectionClosed.into())
    }

    fn writer(&self) -> Arc<dyn TargetWriter> {
        self.writer.clone()
    }
}

struct MockWriter {
    writes: Arc<Mutex<Vec<SetRequest>>>,
}

#[async_trait]
impl TargetWriter for MockWriter {
    async fn set(&self, request: SetRequest) -> Result<SetResponse> {
        self.writes.lock().push(request);
        Ok(SetResponse {
            timestamp: now_nanos(),
        })
    }
}

/// A TCP endpoint that behaves like a streaming telemetry target.
///
/// Subscriptions replay the notifications given to [`MockTargetServer::start`],
/// send `SyncComplete`, then forward whatever is [`pushed`](Self::push).
pub struct MockTargetServer {
    addr: SocketAddr,
    updates: broadcast::Sender<Notification>,
    writes: Arc<Mutex<Vec<SetRequest>>>,
    subscriptions: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl MockTargetServer {
    pub async fn start(name: &str, initial: Vec<Notification>) -> Result<Self> {
        let (updates, _) = broadcast::channel(1024);
        let writes = Arc::new(Mutex::new(Vec::new()));
        let subscriptions = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(TargetHandler {
            name: TargetName::new(name),
            initial,
            updates: updates.clone(),
            writes: writes.clone(),
            subscriptions: subscriptions.clone(),
        });
        let server = NetworkServer::bind(
            "mock-target",
            SocketAddr::from(([127, 0, 0, 1], 0)),
            Arc::new(PlainAcceptor),
            handler,
        )
        .await?;
        let addr = server.local_addr()?;
        let shutdown = CancellationToken::new();
        tokio::spawn(server.run(shutdown.clone()));
        Ok(Self {
            addr,
            updates,
            writes,
            subscriptions,
            shutdown,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stream a notification to every open subscription.
    pub fn push(&self, notification: Notification) {
        let _ = self.updates.send(notification);
    }

    /// Subscriptions accepted so far.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<SetRequest> {
        self.writes.lock().clone()
    }

    /// Stop accepting and close every open connection.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for MockTargetServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct TargetHandler {
    name: TargetName,
    initial: Vec<Notification>,
    updates: broadcast::Sender<Notification>,
    writes: Arc<Mutex<Vec<SetRequest>>>,
    subscriptions: Arc<AtomicUsize>,
}

impl TargetHandler {
    fn wrap(&self, notification: Notification) -> Response {
        Response::Update(TargetNotification {
            target: self.name.clone(),
            notification,
        })
    }
}

#[async_trait]
impl ConnectionHandler for TargetHandler {
    async fn handle(
        &self,
        mut stream: BoxedStream,
        _peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<()> {
        while let Some(request) = read_frame::<_, Request>(&mut stream).await? {
            match request {
                Request::Subscribe { target, mode, .. } => {
                    if target != self.name {
                        let reply = Response::NotServed {
                            target,
                            owner: None,
                        };
                        write_frame(&mut stream, &reply).await?;
                        return Ok(());
                    }
                    self.subscriptions.fetch_add(1, Ordering::SeqCst);
                    let mut updates = self.updates.subscribe();
                    for notification in &self.initial {
                        write_frame(&mut stream, &self.wrap(notification.clone())).await?;
                    }
                    write_frame(&mut stream, &Response::SyncComplete).await?;
                    if mode == SubscribeMode::Once {
                        return Ok(());
                    }
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => return Ok(()),
                            update = updates.recv() => match update {
                                Ok(notification) => {
                                    write_frame(&mut stream, &self.wrap(notification)).await?;
                                }
                                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                                Err(broadcast::error::RecvError::Closed) => return Ok(()),
                            },
                        }
                    }
                }
                Request::Set { request, .. } => {
                    self.writes.lock().push(request);
                    let reply = Response::Set(SetResponse {
                        timestamp: now_nanos(),
                    });
                    write_frame(&mut stream, &reply).await?;
                }
                Request::Capabilities | Request::Get { .. } => {
                    write_frame(&mut stream, &Response::Error("unsupported".to_string())).await?;
                }
            }
        }
        Ok(())
    }
}
