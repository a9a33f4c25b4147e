//! Operational counters for the gateway.
//!
//! Every component takes an `Arc<GatewayMetrics>` and bumps the instruments
//! that belong to it. Nothing here exports anywhere; callers read a
//! [`MetricsSnapshot`] and ship it to whatever system they use.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     GatewayMetrics                        │
//! │  ingest:      updates_received / rejected / stale         │
//! │  connections: dials, dial failures, stream faults, open   │
//! │  cluster:     locks acquired / lost, owned targets        │
//! │  targets:     reloads, reload failures                    │
//! │  server:      requests by kind, active subscriptions      │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod instruments;

pub use instruments::{Counter, Gauge, LabeledCounter};

/// All gateway metrics.
#[derive(Debug)]
pub struct GatewayMetrics {
    // Ingestion
    /// Individual updates received from targets.
    pub updates_received: Counter,
    /// Updates dropped by a rejection rule.
    pub updates_rejected: Counter,
    /// Updates older than the cached value from the same stream.
    pub updates_stale: Counter,

    // Connections
    /// Dial attempts.
    pub dial_attempts: Counter,
    /// Dials that failed or timed out.
    pub dial_failures: Counter,
    /// Streams that ended with an error.
    pub stream_errors: Counter,
    /// Connections holding a slot (dialing, backing off or streaming).
    pub connections_open: Gauge,
    /// Connections currently streaming.
    pub connections_streaming: Gauge,
    /// Eligible targets waiting for a slot.
    pub connections_queued: Gauge,

    // Cluster
    /// Target locks acquired.
    pub locks_acquired: Counter,
    /// Target locks lost or released.
    pub locks_lost: Counter,
    /// Failed session renewals.
    pub session_renewal_failures: Counter,
    /// Targets currently owned.
    pub targets_owned: Gauge,

    // Target list
    /// Successful target list reloads.
    pub target_reloads: Counter,
    /// Failed target list reloads.
    pub target_reload_failures: Counter,

    // Server
    /// Downstream requests by kind.
    pub server_requests: LabeledCounter<1>,
    /// Downstream subscriptions currently streaming.
    pub server_subscriptions: Gauge,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            updates_received: Counter::new("gateway_updates_received_total", "Updates received"),
            updates_rejected: Counter::new(
                "gateway_updates_rejected_total",
                "Updates dropped by rejection rules",
            ),
            updates_stale: Counter::new("gateway_updates_stale_total", "Out-of-order updates"),

            dial_attempts: Counter::new("gateway_dial_attempts_total", "Target dial attempts"),
            dial_failures: Counter::new("gateway_dial_failures_total", "Failed target dials"),
            stream_errors: Counter::new("gateway_stream_errors_total", "Faulted target streams"),
            connections_open: Gauge::new("gateway_connections_open", "Connections holding a slot"),
            connections_streaming: Gauge::new(
                "gateway_connections_streaming",
                "Connections currently streaming",
            ),
            connections_queued: Gauge::new(
                "gateway_connections_queued",
                "Eligible targets waiting for a slot",
            ),

            locks_acquired: Counter::new("gateway_locks_acquired_total", "Target locks acquired"),
            locks_lost: Counter::new("gateway_locks_lost_total", "Target locks lost or released"),
            session_renewal_failures: Counter::new(
                "gateway_session_renewal_failures_total",
                "Failed coordination session renewals",
            ),
            targets_owned: Gauge::new("gateway_targets_owned", "Targets owned by this instance"),

            target_reloads: Counter::new("gateway_target_reloads_total", "Target list reloads"),
            target_reload_failures: Counter::new(
                "gateway_target_reload_failures_total",
                "Failed target list reloads",
            ),

            server_requests: LabeledCounter::new("gateway_server_requests_total", ["kind"]),
            server_subscriptions: Gauge::new(
                "gateway_server_subscriptions",
                "Active downstream subscriptions",
            ),
        }
    }

    /// Point-in-time copy of the scalar metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            updates_received: self.updates_received.get(),
            updates_rejected: self.updates_rejected.get(),
            updates_stale: self.updates_stale.get(),
            dial_attempts: self.dial_attempts.get(),
            dial_failures: self.dial_failures.get(),
            stream_errors: self.stream_errors.get(),
            connections_open: self.connections_open.get(),
            connections_streaming: self.connections_streaming.get(),
            connections_queued: self.connections_queued.get(),
            locks_acquired: self.locks_acquired.get(),
            locks_lost: self.locks_lost.get(),
            session_renewal_failures: self.session_renewal_failures.get(),
            targets_owned: self.targets_owned.get(),
            target_reloads: self.target_reloads.get(),
            target_reload_failures: self.target_reload_failures.get(),
            server_subscriptions: self.server_subscriptions.get(),
        }
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of [`GatewayMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub updates_received: u64,
    pub updates_rejected: u64,
    pub updates_stale: u64,
    pub dial_attempts: u64,
    pub dial_failures: u64,
    pub stream_errors: u64,
    pub connections_open: i64,
    pub connections_streaming: i64,
    pub connections_queued: i64,
    pub locks_acquired: u64,
    pub locks_lost: u64,
    pub session_renewal_failures: u64,
    pub targets_owned: i64,
    pub target_reloads: u64,
    pub target_reload_failures: u64,
    pub server_subscriptions: i64,
}

impl MetricsSnapshot {
    /// Fraction of received updates that were rejected.
    pub fn rejection_rate(&self) -> f64 {
        if self.updates_received == 0 {
            0.0
        } else {
            self.updates_rejected as f64 / self.updates_received as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let metrics = GatewayMetrics::new();
        metrics.updates_received.inc_by(10);
        metrics.updates_rejected.inc_by(2);
        metrics.connections_open.inc();
        metrics.server_requests.inc(["get"]);

        let snap = metrics.snapshot();
        assert_eq!(snap.updates_received, 10);
        assert_eq!(snap.connections_open, 1);
        assert!((snap.rejection_rate() - 0.2).abs() < f64::EPSILON);
        assert_eq!(metrics.server_requests.get(["get"]), 1);
    }
}
