//! Transport security capabilities.
//!
//! Servers wrap accepted sockets with an [`Acceptor`]; dialers wrap outbound
//! sockets with a [`Connector`]. The plaintext implementations are used when
//! no TLS material is configured and in tests.

use crate::config::ClientTlsConfig;
use crate::error::{Result, TlsError};
use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::info;

/// A bidirectional byte stream, plain or encrypted.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> AsyncStream for T {}

/// Boxed stream handed to protocol handlers.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Server-side transport wrapper.
#[async_trait]
pub trait Acceptor: Send + Sync + 'static {
    /// Complete the transport handshake on an accepted socket.
    async fn accept(&self, stream: TcpStream) -> Result<BoxedStream>;

    /// Whether the transport is encrypted.
    fn is_secure(&self) -> bool;
}

/// Client-side transport wrapper.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Complete the transport handshake on a connected socket to `host`.
    async fn connect(&self, stream: TcpStream, host: &str) -> Result<BoxedStream>;

    /// Whether the transport is encrypted.
    fn is_secure(&self) -> bool;
}

/// No transport security.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainAcceptor;

#[async_trait]
impl Acceptor for PlainAcceptor {
    async fn accept(&self, stream: TcpStream) -> Result<BoxedStream> {
        Ok(Box::new(stream))
    }

    fn is_secure(&self) -> bool {
        false
    }
}

/// No transport security.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainConnector;

#[async_trait]
impl Connector for PlainConnector {
    async fn connect(&self, stream: TcpStream, _host: &str) -> Result<BoxedStream> {
        Ok(Box::new(stream))
    }

    fn is_secure(&self) -> bool {
        false
    }
}

/// TLS server transport.
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl TlsAcceptor {
    /// Use a pre-built rustls configuration.
    pub fn from_config(config: Arc<rustls::ServerConfig>) -> Self {
        Self {
            inner: tokio_rustls::TlsAcceptor::from(config),
        }
    }

    /// Load a certificate chain and private key from PEM files.
    pub fn from_pem(cert: &Path, key: &Path) -> Result<Self> {
        let certs = load_certs(cert)?;
        let key = load_private_key(key)?;
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(TlsError::Rustls)?;
        info!(cert = %cert.display(), "TLS server config loaded");
        Ok(Self::from_config(Arc::new(config)))
    }
}

#[async_trait]
impl Acceptor for TlsAcceptor {
    async fn accept(&self, stream: TcpStream) -> Result<BoxedStream> {
        let tls = self
            .inner
            .accept(stream)
            .await
            .map_err(|e| TlsError::Handshake(e.to_string()))?;
        Ok(Box::new(tls))
    }

    fn is_secure(&self) -> bool {
        true
    }
}

/// TLS client transport.
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
    server_name: Option<String>,
}

impl TlsConnector {
    /// Use a pre-built rustls configuration.
    pub fn from_config(config: Arc<rustls::ClientConfig>, server_name: Option<String>) -> Self {
        Self {
            inner: tokio_rustls::TlsConnector::from(config),
            server_name,
        }
    }

    /// Build from PEM files named in the configuration.
    pub fn from_pem(tls: &ClientTlsConfig) -> Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        for cert in load_certs(&tls.ca_cert)? {
            roots.add(cert).map_err(TlsError::Rustls)?;
        }

        let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
        let config = match (&tls.client_cert, &tls.client_key) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
                .map_err(TlsError::Rustls)?,
            _ => builder.with_no_client_auth(),
        };

        info!(ca = %tls.ca_cert.display(), "TLS client config loaded");
        Ok(Self::from_config(Arc::new(config), tls.server_name.clone()))
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, stream: TcpStream, host: &str) -> Result<BoxedStream> {
        let name = self.server_name.as_deref().unwrap_or(host).to_string();
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| TlsError::InvalidServerName(name))?;
        let tls = self
            .inner
            .connect(server_name, stream)
            .await
            .map_err(|e| TlsError::Handshake(e.to_string()))?;
        Ok(Box::new(tls))
    }

    fn is_secure(&self) -> bool {
        true
    }
}

/// Host part of a `host:port` address, without IPv6 brackets.
pub fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        TlsError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = read_pem(path)?;
    let mut reader = BufReader::new(&pem[..]);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()).into());
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = read_pem(path)?;
    let mut reader = BufReader::new(&pem[..]);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::testing::utils::cert_path;
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("router1.example.net:9339"), "router1.example.net");
        assert_eq!(host_of("10.0.0.1:57400"), "10.0.0.1");
        assert_eq!(host_of("[::1]:9339"), "::1");
        assert_eq!(host_of("router1"), "router1");
    }

    #[test]
    fn test_missing_pem_file() {
        let result = TlsAcceptor::from_pem(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"));
        assert!(matches!(result, Err(Error::Tls(TlsError::Read { .. }))));
    }

    #[test]
    fn test_pem_without_certificates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not a certificate\n").unwrap();
        let result = TlsConnector::from_pem(&ClientTlsConfig::new(file.path()));
        assert!(matches!(result, Err(Error::Tls(TlsError::NoCertificates(_)))));
    }

    async fn tls_echo_server(acceptor: TlsAcceptor) -> (std::net::SocketAddr, tokio::task::JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = acceptor.accept(socket).await?;
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.flush().await.unwrap();
            Ok(())
        });
        (addr, server)
    }

    fn server_acceptor() -> TlsAcceptor {
        TlsAcceptor::from_pem(&cert_path("server.pem"), &cert_path("server-key.pem")).unwrap()
    }

    #[tokio::test]
    async fn test_tls_roundtrip() {
        let (addr, server) = tls_echo_server(server_acceptor()).await;
        let connector = TlsConnector::from_pem(&ClientTlsConfig::new(cert_path("ca.pem"))).unwrap();
        assert!(connector.is_secure());

        let socket = TcpStream::connect(addr).await.unwrap();
        let mut stream = connector.connect(socket, "localhost").await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tls_server_name_override() {
        let (addr, server) = tls_echo_server(server_acceptor()).await;
        let mut tls = ClientTlsConfig::new(cert_path("ca.pem"));
        tls.server_name = Some("127.0.0.1".to_string());
        let connector = TlsConnector::from_pem(&tls).unwrap();

        // The dialed host name is ignored in favour of the override.
        let socket = TcpStream::connect(addr).await.unwrap();
        let mut stream = connector.connect(socket, "router1.lab").await.unwrap();
        stream.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tls_rejects_unknown_name() {
        let (addr, server) = tls_echo_server(server_acceptor()).await;
        let connector = TlsConnector::from_pem(&ClientTlsConfig::new(cert_path("ca.pem"))).unwrap();

        let socket = TcpStream::connect(addr).await.unwrap();
        let result = connector.connect(socket, "router1.lab").await;
        assert!(matches!(result, Err(Error::Tls(TlsError::Handshake(_)))));
        assert!(server.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_plain_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = PlainAcceptor.accept(socket).await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let socket = TcpStream::connect(addr).await.unwrap();
        let mut stream = PlainConnector.connect(socket, "127.0.0.1").await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();
        assert!(!PlainAcceptor.is_secure());
    }
}
