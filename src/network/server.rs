//! TCP accept loop shared by the gateway server and the lock server.

use crate::error::{NetworkError, Result};
use crate::network::tls::{Acceptor, BoxedStream};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Handler for one accepted connection.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Serve the connection until the peer closes it or `shutdown` fires.
    async fn handle(
        &self,
        stream: BoxedStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<()>;
}

/// A bound TCP listener dispatching connections to a handler.
pub struct NetworkServer {
    /// Name used in log lines.
    name: &'static str,

    listener: TcpListener,

    /// Transport wrapper applied to every accepted socket.
    acceptor: Arc<dyn Acceptor>,

    handler: Arc<dyn ConnectionHandler>,
}

impl NetworkServer {
    /// Bind to `addr`. Port `0` picks a free port.
    pub async fn bind(
        name: &'static str,
        addr: SocketAddr,
        acceptor: Arc<dyn Acceptor>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::from_listener(name, listener, acceptor, handler))
    }

    /// Serve on an already bound listener.
    pub fn from_listener(
        name: &'static str,
        listener: TcpListener,
        acceptor: Arc<dyn Acceptor>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Self {
        Self {
            name,
            listener,
            acceptor,
            handler,
        }
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(NetworkError::Io)?)
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let local = self.local_addr()?;
        info!(
            server = self.name,
            addr = %local,
            tls = self.acceptor.is_secure(),
            "Server listening"
        );

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, peer)) => {
                            debug!(server = self.name, %peer, "Accepted connection");
                            let _ = socket.set_nodelay(true);
                            let acceptor = self.acceptor.clone();
                            let handler = self.handler.clone();
                            let token = shutdown.child_token();
                            let name = self.name;
                            tokio::spawn(async move {
                                let stream = match acceptor.accept(socket).await {
                                    Ok(stream) => stream,
                                    Err(e) => {
                                        debug!(server = name, %peer, error = %e, "Handshake failed");
                                        return;
                                    }
                                };
                                if let Err(e) = handler.handle(stream, peer, token).await {
                                    debug!(server = name, %peer, error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(server = self.name, error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!(server = self.name, "Server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}
