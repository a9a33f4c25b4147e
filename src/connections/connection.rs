//! Per-target connection task.
//!
//! ```text
//!   Idle ──▶ Dialing ──▶ Streaming
//!              ▲   │          │
//!              │   ▼          ▼
//!              └─ Error ◀─────┘        (any state) ──cancel──▶ Closed
//! ```

use super::backoff::Backoff;
use super::dialer::{Dialer, SessionEvent, TargetSession, TargetWriter};
use super::ManagerEvent;
use crate::cache::{Cache, PutOutcome};
use crate::config::GatewayConfig;
use crate::filter::UpdateFilter;
use crate::metrics::GatewayMetrics;
use crate::targets::Target;
use crate::types::{Notification, TargetName};
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Lifecycle state of a target connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Eligible, waiting for a connection slot.
    Idle,
    Dialing,
    Streaming,
    /// Last dial or stream failed; waiting out the backoff.
    Error,
    Closed,
}

impl ConnectionState {
    /// Whether the state holds a connection slot.
    pub fn holds_slot(self) -> bool {
        matches!(
            self,
            ConnectionState::Dialing | ConnectionState::Streaming | ConnectionState::Error
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Dialing => "dialing",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Error => "error",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// State table entry; `task` is `None` for queued targets.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StateSlot {
    pub task: Option<u64>,
    pub state: ConnectionState,
}

/// Writer of a live stream, tagged with the task that owns it.
#[derive(Clone)]
pub(crate) struct LiveWriter {
    pub task: u64,
    pub writer: Arc<dyn TargetWriter>,
}

/// Everything a connection task shares with its manager.
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub config: Arc<GatewayConfig>,
    pub dialer: Arc<dyn Dialer>,
    pub cache: Arc<Cache>,
    pub filter: Arc<UpdateFilter>,
    pub metrics: Arc<GatewayMetrics>,
    pub generations: Arc<AtomicU64>,
    pub states: Arc<DashMap<TargetName, StateSlot>>,
    pub writers: Arc<DashMap<TargetName, LiveWriter>>,
    pub events: mpsc::UnboundedSender<ManagerEvent>,
}

/// How a stream ended.
enum StreamEnd {
    Cancelled,
    Failed(crate::error::Error),
}

pub(crate) struct ConnectionTask {
    id: u64,
    target: Target,
    ctx: TaskContext,
    cancel: CancellationToken,
    /// Generation of the latest dial attempt.
    generation: u64,
}

impl ConnectionTask {
    pub fn new(id: u64, target: Target, ctx: TaskContext, cancel: CancellationToken) -> Self {
        Self {
            id,
            target,
            ctx,
            cancel,
            generation: 0,
        }
    }

    fn name(&self) -> &TargetName {
        &self.target.name
    }

    fn set_state(&self, state: ConnectionState) {
        if let Some(mut slot) = self.ctx.states.get_mut(self.name()) {
            if slot.task == Some(self.id) {
                slot.state = state;
            }
        }
    }

    pub async fn run(mut self) {
        let mut backoff = Backoff::new(self.ctx.config.reconnect.clone());
        let dial_timeout = self
            .target
            .dial_timeout
            .unwrap_or(self.ctx.config.targets.dial_timeout);

        loop {
            self.set_state(ConnectionState::Dialing);
            self.ctx.metrics.dial_attempts.inc();
            self.generation = self.ctx.generations.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(target = %self.name(), generation = self.generation, "Dialing target");

            let dialed = tokio::select! {
                _ = self.cancel.cancelled() => break,
                dialed = tokio::time::timeout(dial_timeout, self.ctx.dialer.dial(&self.target)) => dialed,
            };

            match dialed {
                Ok(Ok(session)) => {
                    let started = Instant::now();
                    match self.stream(session).await {
                        StreamEnd::Cancelled => break,
                        StreamEnd::Failed(e) => {
                            self.ctx.metrics.stream_errors.inc();
                            warn!(target = %self.name(), error = %e, "Target stream failed");
                            if started.elapsed() >= self.ctx.config.reconnect.healthy_after {
                                backoff.reset();
                            }
                        }
                    }
                }
                Ok(Err(e)) => {
                    self.ctx.metrics.dial_failures.inc();
                    warn!(target = %self.name(), error = %e, "Dial failed");
                }
                Err(_) => {
                    self.ctx.metrics.dial_failures.inc();
                    warn!(
                        target = %self.name(),
                        timeout_ms = dial_timeout.as_millis() as u64,
                        "Dial timed out"
                    );
                }
            }

            self.set_state(ConnectionState::Error);
            let delay = backoff.next_delay();
            debug!(target = %self.name(), delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.finish();
    }

    async fn stream(&self, mut session: Box<dyn TargetSession>) -> StreamEnd {
        let name = self.name().clone();
        self.ctx.writers.insert(
            name.clone(),
            LiveWriter {
                task: self.id,
                writer: session.writer(),
            },
        );
        self.set_state(ConnectionState::Streaming);
        self.ctx.metrics.connections_streaming.inc();
        info!(target = %name, generation = self.generation, "Target streaming");

        let end = loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break StreamEnd::Cancelled,
                event = session.recv() => event,
            };
            match event {
                Ok(SessionEvent::Notification(notification)) => self.ingest(notification),
                Ok(SessionEvent::SyncComplete) => {
                    self.ctx.cache.sync_complete(&name, self.generation);
                }
                Err(e) => break StreamEnd::Failed(e),
            }
        };

        self.ctx.metrics.connections_streaming.dec();
        self.ctx.writers.remove_if(&name, |_, w| w.task == self.id);
        end
    }

    /// Apply one notification: deletes first, then admitted updates.
    fn ingest(&self, notification: Notification) {
        let name = self.name();
        let Notification {
            timestamp,
            prefix,
            updates,
            deletes,
        } = notification;

        for delete in &deletes {
            let path = prefix.join(delete);
            self.ctx
                .cache
                .delete(name, &path, timestamp, self.generation);
        }

        for update in updates {
            self.ctx.metrics.updates_received.inc();
            let path = prefix.join(&update.path);
            if !self.ctx.filter.admit(&path) {
                continue;
            }
            let outcome = self
                .ctx
                .cache
                .put(name, path, update.value, timestamp, self.generation);
            if outcome == PutOutcome::Stale {
                self.ctx.metrics.updates_stale.inc();
                trace!(target = %name, timestamp, "Stale update dropped");
            }
        }
    }

    /// Tear down after cancellation: withdraw the writer, purge this task's
    /// data and hand the slot back.
    fn finish(&self) {
        let name = self.name().clone();
        self.set_state(ConnectionState::Closed);
        self.ctx.writers.remove_if(&name, |_, w| w.task == self.id);
        self.ctx.states.remove_if(&name, |_, slot| slot.task == Some(self.id));
        let purged = if self.generation > 0 {
            self.ctx.cache.purge_generation(&name, self.generation)
        } else {
            0
        };
        info!(target = %name, purged, "Target connection closed");
        let _ = self.ctx.events.send(ManagerEvent::Closed {
            target: name,
            task: self.id,
        });
    }
}

pub(crate) fn spawn(
    id: u64,
    target: Target,
    ctx: TaskContext,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(ConnectionTask::new(id, target, ctx, cancel).run())
}
