//! Error types for the telemetry gateway.

use crate::types::TargetName;
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateway.
#[derive(Error, Debug)]
pub enum Error {
    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Cluster coordination errors.
    #[error("coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    /// Target list errors.
    #[error("target error: {0}")]
    Target(#[from] TargetError),

    /// Transport security errors.
    #[error("tls error: {0}")]
    Tls(#[from] TlsError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// A path or path pattern could not be parsed.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The target is not served by this instance.
    #[error("target not served: {0}")]
    NotServed(TargetName),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to send message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Failed to receive message.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The peer answered with a message that does not fit the exchange.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// The peer reported an error.
    #[error("remote error: {0}")]
    Remote(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Address parse error.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Errors from the lock/lease coordination service.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinationError {
    /// The coordination service could not be reached.
    #[error("coordination service unavailable: {0}")]
    Unavailable(String),

    /// The session has expired; all locks it held are gone.
    #[error("session expired")]
    SessionExpired,

    /// The session is not known to the service.
    #[error("unknown session: {0}")]
    UnknownSession(u64),

    /// The lock is not held by the calling session.
    #[error("lock not held: {0}")]
    NotHeld(String),

    /// The session timeout is below the enforced minimum.
    #[error("session timeout too short: {0:?}")]
    TimeoutTooShort(std::time::Duration),
}

/// Target list errors.
#[derive(Error, Debug)]
pub enum TargetError {
    /// The target list could not be read.
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    /// The target list could not be parsed.
    #[error("failed to parse target list: {0}")]
    Parse(String),

    /// A target descriptor is structurally invalid.
    #[error("invalid target {name}: {reason}")]
    Invalid { name: String, reason: String },
}

/// Transport security errors.
#[derive(Error, Debug)]
pub enum TlsError {
    /// Credential material could not be read.
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    /// No certificates were found in a PEM file.
    #[error("no certificates found in {0}")]
    NoCertificates(String),

    /// No private key was found in a PEM file.
    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    /// The server name is not valid for certificate verification.
    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    /// rustls rejected the configuration or handshake.
    #[error("rustls: {0}")]
    Rustls(#[from] rustls::Error),

    /// Handshake I/O failure.
    #[error("handshake failed: {0}")]
    Handshake(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Network(NetworkError::Io(e))
    }
}

impl Error {
    /// Whether the error is a transient fault worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::Timeout
                | Error::Coordination(CoordinationError::Unavailable(_))
        )
    }
}
