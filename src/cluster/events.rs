//! Ownership change events.

use crate::types::TargetName;

/// A change in the set of targets owned by this instance.
///
/// Events are delivered in order on a single stream; applying them in
/// sequence always reproduces the coordinator's owned set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnershipEvent {
    /// Targets were gained and/or lost.
    Changed {
        /// Newly owned targets.
        added: Vec<TargetName>,
        /// Targets no longer owned.
        removed: Vec<TargetName>,
    },
}

impl OwnershipEvent {
    pub fn added(&self) -> &[TargetName] {
        match self {
            OwnershipEvent::Changed { added, .. } => added,
        }
    }

    pub fn removed(&self) -> &[TargetName] {
        match self {
            OwnershipEvent::Changed { removed, .. } => removed,
        }
    }

    /// Check if the event carries no change.
    pub fn is_empty(&self) -> bool {
        self.added().is_empty() && self.removed().is_empty()
    }
}

/// Listener for ownership events.
pub trait OwnershipListener: Send + Sync + 'static {
    /// Called after the owned set changed.
    fn on_event(&self, event: &OwnershipEvent);
}

/// No-op event listener.
pub struct NoopOwnershipListener;

impl OwnershipListener for NoopOwnershipListener {
    fn on_event(&self, _event: &OwnershipEvent) {}
}

/// Event listener that logs events.
pub struct LoggingOwnershipListener;

impl OwnershipListener for LoggingOwnershipListener {
    fn on_event(&self, event: &OwnershipEvent) {
        for target in event.added() {
            tracing::info!(%target, "Ownership acquired");
        }
        for target in event.removed() {
            tracing::info!(%target, "Ownership released");
        }
    }
}
