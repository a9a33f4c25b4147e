//! Distributed lock/lease service interface.
//!
//! A session is a lease kept alive by periodic [`LockService::keep_alive`]
//! calls. Locks belong to a session; when the session expires every lock it
//! held is freed and may be acquired by another session.

use crate::error::CoordinationError;
use crate::types::InstanceId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Result of a coordination call.
pub type CoordinationResult<T> = std::result::Result<T, CoordinationError>;

/// Identifier of a lease session.
pub type SessionId = u64;

/// Identity recorded with every lock a session holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockOwner {
    /// The gateway instance holding the session.
    pub instance: InstanceId,
    /// Where that instance's server can be reached, if it runs one.
    pub advertise_addr: Option<String>,
}

impl LockOwner {
    pub fn new(instance: InstanceId, advertise_addr: Option<String>) -> Self {
        Self {
            instance,
            advertise_addr,
        }
    }
}

/// A lock/lease coordination service.
#[async_trait]
pub trait LockService: Send + Sync + 'static {
    /// Open a session that expires `timeout` after its last keep-alive.
    async fn open_session(&self, owner: LockOwner, timeout: Duration)
        -> CoordinationResult<SessionId>;

    /// Renew a session. Fails with `SessionExpired` once it has lapsed.
    async fn keep_alive(&self, session: SessionId) -> CoordinationResult<()>;

    /// Acquire the lock at `path` for `session` if it is free.
    ///
    /// Returns `true` if the session holds the lock afterwards (including
    /// when it already held it).
    async fn try_acquire(&self, path: &str, session: SessionId) -> CoordinationResult<bool>;

    /// Release the lock at `path` held by `session`.
    async fn release(&self, path: &str, session: SessionId) -> CoordinationResult<()>;

    /// Close a session, freeing every lock it holds.
    async fn close_session(&self, session: SessionId) -> CoordinationResult<()>;

    /// The owner of the lock at `path`, if it is held by a live session.
    async fn owner(&self, path: &str) -> CoordinationResult<Option<LockOwner>>;
}
