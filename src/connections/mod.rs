//! Target connection management.
//!
//! A single event task owns the connection table. Ownership changes, target
//! list snapshots and task exits all arrive as [`ManagerEvent`]s and are
//! applied in order, so a target is never connected and disconnected at the
//! same time.
//!
//! ```text
//!   OwnershipEvent ─┐
//!   TargetSnapshot ─┼──▶ event task ──spawn/cancel──▶ ConnectionTask (one per target)
//!   Closed ─────────┘        ▲                              │
//!                            └──────────── Closed ──────────┘
//! ```
//!
//! A task holds a connection slot from spawn until it has exited, so the
//! number of dialing, streaming or backing-off connections never exceeds
//! the configured limit. Eligible targets beyond the limit wait in store
//! order.

pub mod backoff;
pub mod connection;
pub mod dialer;

pub use backoff::Backoff;
pub use connection::ConnectionState;
pub use dialer::{Dialer, SessionEvent, TargetSession, TargetWriter, TcpDialer};

use crate::cache::Cache;
use crate::cluster::OwnershipEvent;
use crate::config::GatewayConfig;
use crate::filter::UpdateFilter;
use crate::metrics::GatewayMetrics;
use crate::targets::{Target, TargetSnapshot};
use crate::types::TargetName;
use connection::{LiveWriter, StateSlot, TaskContext};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Input to the connection manager's event task.
#[derive(Debug)]
pub enum ManagerEvent {
    /// The coordinator's owned set changed.
    Ownership(OwnershipEvent),
    /// A new target list snapshot was published.
    Targets(Arc<TargetSnapshot>),
    /// Replace both inputs at once.
    Reconcile {
        owned: HashSet<TargetName>,
        targets: Arc<TargetSnapshot>,
    },
    /// A connection task exited.
    Closed { target: TargetName, task: u64 },
}

struct Running {
    task: u64,
    target: Target,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// The connection table, owned by the event task.
struct Table {
    owned: HashSet<TargetName>,
    snapshot: Arc<TargetSnapshot>,
    running: HashMap<TargetName, Running>,
    /// Cancelled tasks that have not exited yet; they still hold a slot.
    closing: HashMap<u64, (TargetName, JoinHandle<()>)>,
    next_task: u64,
}

impl Table {
    fn slots_used(&self) -> usize {
        self.running.len() + self.closing.len()
    }

    fn is_eligible(&self, name: &TargetName) -> bool {
        self.owned.contains(name) && self.snapshot.contains(name)
    }
}

/// Keeps one streaming connection per eligible target, within the limit.
pub struct ConnectionManager {
    ctx: TaskContext,
    limit: usize,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ManagerEvent>>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        config: Arc<GatewayConfig>,
        dialer: Arc<dyn Dialer>,
        cache: Arc<Cache>,
        filter: Arc<UpdateFilter>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        let limit = config.targets.limit;
        Self {
            ctx: TaskContext {
                config,
                dialer,
                cache,
                filter,
                metrics,
                generations: Arc::new(AtomicU64::new(0)),
                states: Arc::new(DashMap::new()),
                writers: Arc::new(DashMap::new()),
                events,
            },
            limit,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Start the event task, fed by the coordinator's ownership stream and
    /// the target store's snapshots.
    pub fn start(
        &self,
        ownership: mpsc::UnboundedReceiver<OwnershipEvent>,
        targets: watch::Receiver<Arc<TargetSnapshot>>,
    ) {
        let Some(events) = self.events_rx.lock().take() else {
            debug!("Connection manager already started");
            return;
        };
        let runner = EventLoop {
            ctx: self.ctx.clone(),
            limit: self.limit,
            shutdown: self.shutdown.clone(),
        };
        *self.task.lock() = Some(tokio::spawn(runner.run(events, ownership, targets)));
        info!(limit = self.limit, "Connection manager started");
    }

    /// Replace the owned set and target list in one step.
    pub fn reconcile(&self, owned: HashSet<TargetName>, targets: Arc<TargetSnapshot>) {
        let _ = self.ctx.events.send(ManagerEvent::Reconcile { owned, targets });
    }

    /// Cancel every connection and wait for the tasks to finish.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// State of every eligible target, keyed by name.
    pub fn states(&self) -> BTreeMap<TargetName, ConnectionState> {
        self.ctx
            .states
            .iter()
            .map(|e| (e.key().clone(), e.value().state))
            .collect()
    }

    /// Connections currently holding a slot, as seen in the state table.
    pub fn open_count(&self) -> usize {
        self.ctx
            .states
            .iter()
            .filter(|e| e.value().state.holds_slot())
            .count()
    }

    /// Targets with a live stream, sorted.
    pub fn served_targets(&self) -> Vec<TargetName> {
        let mut served: Vec<_> = self.ctx.writers.iter().map(|e| e.key().clone()).collect();
        served.sort();
        served
    }

    /// Whether `target` has a live stream.
    pub fn is_serving(&self, target: &TargetName) -> bool {
        self.ctx.writers.contains_key(target)
    }

    /// Writer for pass-through writes to a live target.
    pub fn writer(&self, target: &TargetName) -> Option<Arc<dyn TargetWriter>> {
        self.ctx.writers.get(target).map(|w| w.writer.clone())
    }
}

struct EventLoop {
    ctx: TaskContext,
    limit: usize,
    shutdown: CancellationToken,
}

impl EventLoop {
    async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<ManagerEvent>,
        mut ownership: mpsc::UnboundedReceiver<OwnershipEvent>,
        mut targets: watch::Receiver<Arc<TargetSnapshot>>,
    ) {
        let mut table = Table {
            owned: HashSet::new(),
            snapshot: targets.borrow_and_update().clone(),
            running: HashMap::new(),
            closing: HashMap::new(),
            next_task: 0,
        };
        let mut ownership_open = true;
        let mut targets_open = true;

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(event) = events.recv() => event,
                event = ownership.recv(), if ownership_open => match event {
                    Some(event) => ManagerEvent::Ownership(event),
                    None => {
                        ownership_open = false;
                        continue;
                    }
                },
                changed = targets.changed(), if targets_open => match changed {
                    Ok(()) => ManagerEvent::Targets(targets.borrow_and_update().clone()),
                    Err(_) => {
                        targets_open = false;
                        continue;
                    }
                },
            };
            self.apply(&mut table, event);
        }

        self.shutdown_all(table).await;
    }

    fn apply(&self, table: &mut Table, event: ManagerEvent) {
        match event {
            ManagerEvent::Ownership(OwnershipEvent::Changed { added, removed }) => {
                for name in removed {
                    table.owned.remove(&name);
                }
                table.owned.extend(added);
            }
            ManagerEvent::Targets(snapshot) => table.snapshot = snapshot,
            ManagerEvent::Reconcile { owned, targets } => {
                table.owned = owned;
                table.snapshot = targets;
            }
            ManagerEvent::Closed { target, task } => {
                if table.closing.remove(&task).is_none() {
                    // A task only exits on its own when it panicked.
                    if table.running.get(&target).map(|r| r.task) == Some(task) {
                        table.running.remove(&target);
                    }
                }
            }
        }
        self.reconcile(table);
    }

    /// Close ineligible or changed connections, then fill free slots in
    /// store order.
    fn reconcile(&self, table: &mut Table) {
        let mut to_close = Vec::new();
        for (name, running) in &table.running {
            if !table.is_eligible(name) {
                info!(target = %name, "Target no longer eligible, closing connection");
                to_close.push(name.clone());
            } else if table.snapshot.get(name) != Some(&running.target) {
                info!(target = %name, "Target parameters changed, reconnecting");
                to_close.push(name.clone());
            }
        }
        for name in to_close {
            if let Some(running) = table.running.remove(&name) {
                running.cancel.cancel();
                // Stop serving immediately; the task purges its data on exit.
                self.ctx.writers.remove_if(&name, |_, w| w.task == running.task);
                table.closing.insert(running.task, (name, running.handle));
            }
        }

        // A target whose previous task is still exiting is redialed on its
        // Closed event.
        let exiting: HashSet<TargetName> =
            table.closing.values().map(|(name, _)| name.clone()).collect();
        let mut queued = HashSet::new();
        let snapshot = table.snapshot.clone();
        for target in snapshot.iter() {
            if !table.owned.contains(&target.name)
                || table.running.contains_key(&target.name)
                || exiting.contains(&target.name)
            {
                continue;
            }
            if table.slots_used() >= self.limit {
                queued.insert(target.name.clone());
                continue;
            }
            self.spawn(table, target.clone());
        }

        for name in &queued {
            self.ctx.states.insert(
                name.clone(),
                StateSlot {
                    task: None,
                    state: ConnectionState::Idle,
                },
            );
        }
        self.ctx.states.retain(|name, slot| match slot.task {
            None => queued.contains(name),
            Some(task) => {
                table.running.get(name).map(|r| r.task) == Some(task)
                    || table.closing.contains_key(&task)
            }
        });

        let metrics = &self.ctx.metrics;
        metrics.connections_open.set(table.slots_used() as i64);
        metrics.connections_queued.set(queued.len() as i64);
    }

    fn spawn(&self, table: &mut Table, target: Target) {
        table.next_task += 1;
        let task = table.next_task;
        let name = target.name.clone();
        let cancel = self.shutdown.child_token();
        self.ctx.states.insert(
            name.clone(),
            StateSlot {
                task: Some(task),
                state: ConnectionState::Idle,
            },
        );
        debug!(target = %name, task, "Starting connection task");
        let handle = connection::spawn(task, target.clone(), self.ctx.clone(), cancel.clone());
        table.running.insert(
            name,
            Running {
                task,
                target,
                cancel,
                handle,
            },
        );
    }

    async fn shutdown_all(&self, mut table: Table) {
        let mut handles = Vec::new();
        for (_, running) in table.running.drain() {
            running.cancel.cancel();
            handles.push(running.handle);
        }
        for (_, (_, handle)) in table.closing.drain() {
            handles.push(handle);
        }
        for handle in handles {
            let _ = handle.await;
        }
        self.ctx.states.clear();
        self.ctx.metrics.connections_open.set(0);
        self.ctx.metrics.connections_queued.set(0);
        info!("Connection manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mock::MockDialer;
    use crate::types::{Notification, Path, TypedValue, Update};
    use std::time::Duration;

    fn snapshot(names: &[&str]) -> Arc<TargetSnapshot> {
        let store = crate::targets::TargetStore::new(
            Arc::new(crate::targets::StaticSource::new(vec![])),
            Arc::new(GatewayMetrics::new()),
        );
        store
            .set_targets(
                names
                    .iter()
                    .map(|n| Target::new(*n, format!("{}:57400", n)))
                    .collect(),
            )
            .unwrap();
        store.current()
    }

    fn owned(names: &[&str]) -> HashSet<TargetName> {
        names.iter().map(|n| TargetName::new(*n)).collect()
    }

    struct Fixture {
        manager: ConnectionManager,
        dialer: Arc<MockDialer>,
        cache: Arc<Cache>,
        metrics: Arc<GatewayMetrics>,
        _ownership: mpsc::UnboundedSender<OwnershipEvent>,
        _targets: watch::Sender<Arc<TargetSnapshot>>,
    }

    fn fixture(limit: usize) -> Fixture {
        let config = Arc::new(
            GatewayConfig::default()
                .with_target_limit(limit)
                .with_dial_timeout(Duration::from_secs(1)),
        );
        let dialer = Arc::new(MockDialer::new());
        let cache = Arc::new(Cache::new());
        let metrics = Arc::new(GatewayMetrics::new());
        let filter = Arc::new(UpdateFilter::new(
            vec![crate::filter::RejectionRule::parse("/secret").unwrap()],
            metrics.clone(),
        ));
        let manager = ConnectionManager::new(
            config,
            dialer.clone(),
            cache.clone(),
            filter,
            metrics.clone(),
        );
        let (ownership_tx, ownership_rx) = mpsc::unbounded_channel();
        let (targets_tx, targets_rx) = watch::channel(Arc::new(TargetSnapshot::default()));
        manager.start(ownership_rx, targets_rx);
        Fixture {
            manager,
            dialer,
            cache,
            metrics,
            _ownership: ownership_tx,
            _targets: targets_tx,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_eligible_targets_only() {
        let f = fixture(10);
        f.manager.reconcile(owned(&["r1"]), snapshot(&["r1", "r2"]));
        settle().await;

        assert_eq!(f.manager.served_targets(), vec![TargetName::new("r1")]);
        assert!(!f.manager.is_serving(&TargetName::new("r2")));
        assert_eq!(
            f.manager.states().get(&TargetName::new("r1")),
            Some(&ConnectionState::Streaming)
        );
        f.manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ingest_applies_filter_and_prefix() {
        let f = fixture(10);
        let r1 = f.dialer.target("r1");
        f.manager.reconcile(owned(&["r1"]), snapshot(&["r1"]));
        settle().await;

        r1.send(
            Notification::new(10)
                .with_prefix(Path::parse("/system").unwrap())
                .with_update(Update::new(Path::parse("/hostname").unwrap(), "r1.lab")),
        );
        r1.send(
            Notification::new(11)
                .with_update(Update::new(Path::parse("/secret").unwrap(), TypedValue::Int(1))),
        );
        r1.sync_complete();
        settle().await;

        let entries = f.cache.get(&TargetName::new("r1"), &Path::root());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, Path::parse("/system/hostname").unwrap());
        assert_eq!(f.metrics.updates_received.get(), 2);
        assert_eq!(f.metrics.updates_rejected.get(), 1);
        f.manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_queues_excess_in_store_order() {
        let f = fixture(2);
        f.manager
            .reconcile(owned(&["r1", "r2", "r3", "r4"]), snapshot(&["r1", "r2", "r3", "r4"]));
        settle().await;

        assert_eq!(f.manager.open_count(), 2);
        let states = f.manager.states();
        assert_eq!(states[&TargetName::new("r1")], ConnectionState::Streaming);
        assert_eq!(states[&TargetName::new("r2")], ConnectionState::Streaming);
        assert_eq!(states[&TargetName::new("r3")], ConnectionState::Idle);
        assert_eq!(f.metrics.connections_queued.get(), 2);

        // Freeing a slot starts the next target in store order.
        f.manager
            .reconcile(owned(&["r2", "r3", "r4"]), snapshot(&["r1", "r2", "r3", "r4"]));
        settle().await;
        let states = f.manager.states();
        assert!(!states.contains_key(&TargetName::new("r1")));
        assert_eq!(states[&TargetName::new("r3")], ConnectionState::Streaming);
        assert_eq!(states[&TargetName::new("r4")], ConnectionState::Idle);
        assert_eq!(f.manager.open_count(), 2);
        f.manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_losing_eligibility_purges_cache() {
        let f = fixture(10);
        let r1 = f.dialer.target("r1");
        f.manager.reconcile(owned(&["r1"]), snapshot(&["r1"]));
        settle().await;
        r1.send(Notification::new(1).with_update(Update::new(Path::parse("/a").unwrap(), 1i64)));
        settle().await;
        assert!(f.cache.contains_target(&TargetName::new("r1")));

        f.manager.reconcile(owned(&[]), snapshot(&["r1"]));
        settle().await;
        assert!(!f.cache.contains_target(&TargetName::new("r1")));
        assert!(f.manager.served_targets().is_empty());
        assert!(f.manager.states().is_empty());
        f.manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_failure_backs_off_and_retries() {
        let f = fixture(10);
        let r1 = f.dialer.target("r1");
        r1.fail_dials(2);
        f.manager.reconcile(owned(&["r1"]), snapshot(&["r1"]));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.metrics.dial_failures.get(), 2);
        assert_eq!(r1.dial_count(), 3);
        assert!(f.manager.is_serving(&TargetName::new("r1")));
        f.manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_timeout_counts_as_failure() {
        let f = fixture(10);
        let r1 = f.dialer.target("r1");
        r1.hang_dials(1);
        f.manager.reconcile(owned(&["r1"]), snapshot(&["r1"]));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(f.metrics.dial_failures.get(), 1);
        f.manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resyncs_with_new_generation() {
        let f = fixture(10);
        let r1 = f.dialer.target("r1");
        let name = TargetName::new("r1");
        f.manager.reconcile(owned(&["r1"]), snapshot(&["r1"]));
        settle().await;

        r1.send(Notification::new(100).with_update(Update::new(Path::parse("/a").unwrap(), 1i64)));
        r1.send(Notification::new(100).with_update(Update::new(Path::parse("/b").unwrap(), 1i64)));
        settle().await;
        r1.disconnect();

        // Device clock went backwards across the reconnect; only /a resent.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(f.manager.is_serving(&name));
        r1.send(Notification::new(50).with_update(Update::new(Path::parse("/a").unwrap(), 2i64)));
        r1.sync_complete();
        settle().await;

        let entries = f.cache.get(&name, &Path::root());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].timestamp, 50);
        assert_eq!(entries[0].value, TypedValue::Int(2));
        assert_eq!(f.metrics.stream_errors.get(), 1);
        f.manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_target_is_reconnected() {
        let f = fixture(10);
        let r1 = f.dialer.target("r1");
        f.manager.reconcile(owned(&["r1"]), snapshot(&["r1"]));
        settle().await;
        assert_eq!(r1.dial_count(), 1);

        let changed = {
            let store = crate::targets::TargetStore::new(
                Arc::new(crate::targets::StaticSource::new(vec![])),
                Arc::new(GatewayMetrics::new()),
            );
            store
                .set_targets(vec![Target::new("r1", "r1:57400").with_dial_timeout(Duration::from_secs(2))])
                .unwrap();
            store.current()
        };
        f.manager.reconcile(owned(&["r1"]), changed);
        settle().await;
        assert_eq!(r1.dial_count(), 2);
        assert!(f.manager.is_serving(&TargetName::new("r1")));
        f.manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_everything() {
        let f = fixture(10);
        let r1 = f.dialer.target("r1");
        f.manager.reconcile(owned(&["r1"]), snapshot(&["r1"]));
        settle().await;
        r1.send(Notification::new(1).with_update(Update::new(Path::parse("/a").unwrap(), 1i64)));
        settle().await;

        f.manager.stop().await;
        assert!(f.cache.is_empty());
        assert!(f.manager.served_targets().is_empty());
        assert_eq!(f.metrics.connections_open.get(), 0);
    }
}
