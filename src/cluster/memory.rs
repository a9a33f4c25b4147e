//! In-process lock service.
//!
//! Backs single-process clusters and tests, and is the lock table served
//! by [`LockServer`](super::remote::LockServer). Time is read from
//! `tokio::time::Instant`, so session expiry follows a paused test clock.

use super::lock_service::{CoordinationResult, LockOwner, LockService, SessionId};
use crate::config::MIN_SESSION_TIMEOUT;
use crate::error::CoordinationError;
use crate::types::InstanceId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct Session {
    owner: LockOwner,
    timeout: Duration,
    last_renewed: Instant,
}

impl Session {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_renewed) >= self.timeout
    }
}

#[derive(Debug, Default)]
struct LockTable {
    next_session: SessionId,
    sessions: HashMap<SessionId, Session>,
    /// Lock path to holding session.
    locks: HashMap<String, SessionId>,
}

impl LockTable {
    /// Drop lapsed sessions and free their locks.
    fn expire(&mut self, now: Instant) {
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.expired(now))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            let freed = self.remove_session(id);
            debug!(session = id, freed, "Session expired");
        }
    }

    fn remove_session(&mut self, id: SessionId) -> usize {
        self.sessions.remove(&id);
        let before = self.locks.len();
        self.locks.retain(|_, holder| *holder != id);
        before - self.locks.len()
    }

    fn check(&self, id: SessionId) -> CoordinationResult<&Session> {
        match self.sessions.get(&id) {
            Some(session) => Ok(session),
            None if id > 0 && id <= self.next_session => Err(CoordinationError::SessionExpired),
            None => Err(CoordinationError::UnknownSession(id)),
        }
    }
}

/// Lock service holding its table in memory.
#[derive(Debug, Default)]
pub struct MemoryLockService {
    table: Mutex<LockTable>,
    /// Sessions whose calls fail as if the service were unreachable.
    paused: Mutex<HashSet<SessionId>>,
    /// Instances cut off from the service entirely.
    partitioned: Mutex<HashSet<InstanceId>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call on `session` fail with `Unavailable` while the
    /// session keeps ageing on the service side.
    pub fn pause_session(&self, session: SessionId) {
        self.paused.lock().insert(session);
    }

    /// Undo [`pause_session`](Self::pause_session).
    pub fn resume_session(&self, session: SessionId) {
        self.paused.lock().remove(&session);
    }

    /// Cut `instance` off: its existing and future sessions fail every call
    /// with `Unavailable`.
    pub fn partition(&self, instance: &InstanceId) {
        self.partitioned.lock().insert(instance.clone());
    }

    /// Undo [`partition`](Self::partition).
    pub fn heal(&self, instance: &InstanceId) {
        self.partitioned.lock().remove(instance);
    }

    /// Expire `session` immediately.
    pub fn expire_session(&self, session: SessionId) {
        let freed = self.table.lock().remove_session(session);
        debug!(session, freed, "Session expired by request");
    }

    /// Live sessions opened by `instance`.
    pub fn sessions_of(&self, instance: &InstanceId) -> Vec<SessionId> {
        let mut table = self.table.lock();
        table.expire(Instant::now());
        let mut ids: Vec<_> = table
            .sessions
            .iter()
            .filter(|(_, s)| &s.owner.instance == instance)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Instance holding the lock at `path`.
    pub fn holder(&self, path: &str) -> Option<InstanceId> {
        let mut table = self.table.lock();
        table.expire(Instant::now());
        let session = table.locks.get(path)?;
        table.sessions.get(session).map(|s| s.owner.instance.clone())
    }

    /// Number of held locks.
    pub fn lock_count(&self) -> usize {
        let mut table = self.table.lock();
        table.expire(Instant::now());
        table.locks.len()
    }

    fn reachable(&self, session: SessionId) -> CoordinationResult<()> {
        if self.paused.lock().contains(&session) {
            return Err(CoordinationError::Unavailable("session paused".into()));
        }
        let partitioned = self.partitioned.lock();
        if partitioned.is_empty() {
            return Ok(());
        }
        let table = self.table.lock();
        match table.sessions.get(&session) {
            Some(s) if partitioned.contains(&s.owner.instance) => {
                Err(CoordinationError::Unavailable("instance partitioned".into()))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn open_session(
        &self,
        owner: LockOwner,
        timeout: Duration,
    ) -> CoordinationResult<SessionId> {
        if self.partitioned.lock().contains(&owner.instance) {
            return Err(CoordinationError::Unavailable("instance partitioned".into()));
        }
        if timeout < MIN_SESSION_TIMEOUT {
            return Err(CoordinationError::TimeoutTooShort(timeout));
        }

        let mut table = self.table.lock();
        table.next_session += 1;
        let id = table.next_session;
        debug!(session = id, instance = %owner.instance, "Session opened");
        table.sessions.insert(
            id,
            Session {
                owner,
                timeout,
                last_renewed: Instant::now(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, session: SessionId) -> CoordinationResult<()> {
        self.reachable(session)?;
        let now = Instant::now();
        let mut table = self.table.lock();
        table.expire(now);
        table.check(session)?;
        if let Some(s) = table.sessions.get_mut(&session) {
            s.last_renewed = now;
        }
        Ok(())
    }

    async fn try_acquire(&self, path: &str, session: SessionId) -> CoordinationResult<bool> {
        self.reachable(session)?;
        let mut table = self.table.lock();
        table.expire(Instant::now());
        table.check(session)?;
        match table.locks.get(path) {
            Some(holder) => Ok(*holder == session),
            None => {
                table.locks.insert(path.to_string(), session);
                Ok(true)
            }
        }
    }

    async fn release(&self, path: &str, session: SessionId) -> CoordinationResult<()> {
        self.reachable(session)?;
        let mut table = self.table.lock();
        table.expire(Instant::now());
        table.check(session)?;
        match table.locks.get(path) {
            Some(holder) if *holder == session => {
                table.locks.remove(path);
                Ok(())
            }
            _ => Err(CoordinationError::NotHeld(path.to_string())),
        }
    }

    async fn close_session(&self, session: SessionId) -> CoordinationResult<()> {
        self.reachable(session)?;
        let mut table = self.table.lock();
        table.expire(Instant::now());
        table.check(session)?;
        let freed = table.remove_session(session);
        debug!(session, freed, "Session closed");
        Ok(())
    }

    async fn owner(&self, path: &str) -> CoordinationResult<Option<LockOwner>> {
        let mut table = self.table.lock();
        table.expire(Instant::now());
        Ok(table
            .locks
            .get(path)
            .and_then(|session| table.sessions.get(session))
            .map(|s| s.owner.clone()))
    }
}
