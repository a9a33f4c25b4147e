//! Target ownership coordination.
//!
//! [`LockCoordinator`] claims one lock per target from a [`LockService`];
//! holding the lock is owning the target. [`StaticCoordinator`] owns every
//! target and is used when clustering is disabled.
//!
//! Both publish changes as a single ordered stream of [`OwnershipEvent`]s.
//! The owned set is only ever mutated by the coordinator's own task.

use super::events::{OwnershipEvent, OwnershipListener};
use super::lock_service::{CoordinationResult, LockOwner, LockService, SessionId};
use crate::config::ClusterConfig;
use crate::error::{CoordinationError, Result};
use crate::metrics::GatewayMetrics;
use crate::targets::TargetSnapshot;
use crate::types::TargetName;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Decides which targets this instance owns.
#[async_trait]
pub trait ClusterCoordinator: Send + Sync + 'static {
    /// Start the background ownership task.
    async fn start(&self) -> Result<()>;

    /// Stop the task and give up every owned target.
    async fn stop(&self);

    /// Targets currently owned, sorted by name.
    fn owned_targets(&self) -> Vec<TargetName>;

    /// Who owns `target`, if anyone is known to.
    async fn owner_of(&self, target: &TargetName) -> Option<LockOwner>;

    /// Receive ownership changes.
    ///
    /// The first event on a new subscription carries the currently owned
    /// set as `added`.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<OwnershipEvent>;
}

/// Owned set plus its subscribers; shared by both coordinators.
struct OwnershipState {
    owned: RwLock<HashSet<TargetName>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<OwnershipEvent>>>,
    listeners: Vec<Arc<dyn OwnershipListener>>,
    metrics: Arc<GatewayMetrics>,
}

impl OwnershipState {
    fn new(listeners: Vec<Arc<dyn OwnershipListener>>, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            owned: RwLock::new(HashSet::new()),
            subscribers: Mutex::new(Vec::new()),
            listeners,
            metrics,
        }
    }

    fn owned_sorted(&self) -> Vec<TargetName> {
        let mut owned: Vec<_> = self.owned.read().iter().cloned().collect();
        owned.sort();
        owned
    }

    fn contains(&self, target: &TargetName) -> bool {
        self.owned.read().contains(target)
    }

    fn len(&self) -> usize {
        self.owned.read().len()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<OwnershipEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Hold the subscriber lock across the snapshot so no event is
        // emitted between reading the set and registering.
        let mut subscribers = self.subscribers.lock();
        let initial = OwnershipEvent::Changed {
            added: self.owned_sorted(),
            removed: Vec::new(),
        };
        if !initial.is_empty() {
            let _ = tx.send(initial);
        }
        subscribers.push(tx);
        rx
    }

    /// Apply a change to the owned set and publish it.
    fn apply(&self, added: Vec<TargetName>, removed: Vec<TargetName>) {
        if added.is_empty() && removed.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.lock();
        {
            let mut owned = self.owned.write();
            for target in &removed {
                owned.remove(target);
            }
            for target in &added {
                owned.insert(target.clone());
            }
            self.metrics.targets_owned.set(owned.len() as i64);
        }
        self.metrics.locks_acquired.inc_by(added.len() as u64);
        self.metrics.locks_lost.inc_by(removed.len() as u64);

        let event = OwnershipEvent::Changed { added, removed };
        for listener in &self.listeners {
            listener.on_event(&event);
        }
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn release_all(&self) {
        let removed = self.owned_sorted();
        self.apply(Vec::new(), removed);
    }
}

/// Owns every target in the store. Used when clustering is disabled.
pub struct StaticCoordinator {
    state: Arc<OwnershipState>,
    owner: LockOwner,
    targets: watch::Receiver<Arc<TargetSnapshot>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StaticCoordinator {
    pub fn new(
        owner: LockOwner,
        targets: watch::Receiver<Arc<TargetSnapshot>>,
        listeners: Vec<Arc<dyn OwnershipListener>>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            state: Arc::new(OwnershipState::new(listeners, metrics)),
            owner,
            targets,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    fn sync(state: &OwnershipState, snapshot: &TargetSnapshot) {
        let owned = state.owned_sorted();
        let removed: Vec<_> = owned
            .iter()
            .filter(|t| !snapshot.contains(t))
            .cloned()
            .collect();
        let added: Vec<_> = snapshot
            .names()
            .iter()
            .filter(|t| !state.contains(t))
            .cloned()
            .collect();
        state.apply(added, removed);
    }
}

#[async_trait]
impl ClusterCoordinator for StaticCoordinator {
    async fn start(&self) -> Result<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }
        let state = self.state.clone();
        let mut targets = self.targets.clone();
        let shutdown = self.shutdown.clone();
        *task = Some(tokio::spawn(async move {
            loop {
                let snapshot = targets.borrow_and_update().clone();
                Self::sync(&state, &snapshot);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = targets.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            state.release_all();
            debug!("Static coordinator stopped");
        }));
        info!("Static coordinator started, owning all targets");
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn owned_targets(&self) -> Vec<TargetName> {
        self.state.owned_sorted()
    }

    async fn owner_of(&self, target: &TargetName) -> Option<LockOwner> {
        self.state.contains(target).then(|| self.owner.clone())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<OwnershipEvent> {
        self.state.subscribe()
    }
}

/// Claims target locks from a [`LockService`].
///
/// Every `session_timeout / 3` the coordinator renews its session, releases
/// locks of targets that left the store and claims free targets in store
/// order, never holding more than `limit` locks. If the session goes
/// unrenewed for `session_timeout - tick` it drops every target locally,
/// ahead of the service expiring the session. That deadline holds even
/// while a call to the service is still in flight, and every call is
/// bounded by [`ClusterConfig::call_timeout`].
pub struct LockCoordinator {
    inner: Arc<LockInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct LockInner {
    cluster: ClusterConfig,
    limit: usize,
    owner: LockOwner,
    service: Arc<dyn LockService>,
    targets: watch::Receiver<Arc<TargetSnapshot>>,
    state: OwnershipState,
    shutdown: CancellationToken,
}

/// Loop-local session bookkeeping.
struct SessionState {
    session: Option<SessionId>,
    last_renewed: Instant,
    retry_at: Instant,
    backoff: Duration,
    /// Lock paths whose release failed and is retried next tick.
    pending_release: HashSet<String>,
}

impl LockCoordinator {
    pub fn new(
        cluster: ClusterConfig,
        limit: usize,
        owner: LockOwner,
        service: Arc<dyn LockService>,
        targets: watch::Receiver<Arc<TargetSnapshot>>,
        listeners: Vec<Arc<dyn OwnershipListener>>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(LockInner {
                cluster,
                limit,
                owner,
                service,
                targets,
                state: OwnershipState::new(listeners, metrics),
                shutdown: CancellationToken::new(),
            }),
            task: Mutex::new(None),
        }
    }
}

impl LockInner {
    async fn run(self: Arc<Self>) {
        let tick = self.cluster.tick_interval();
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut targets = self.targets.clone();
        let now = Instant::now();
        let mut session = SessionState {
            session: None,
            last_renewed: now,
            retry_at: now,
            backoff: tick,
            pending_release: HashSet::new(),
        };

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick(&mut session).await,
                _ = tokio::time::sleep_until(self.release_deadline(&session)),
                    if session.session.is_some() && self.state.len() > 0 => {
                    self.release_at_risk();
                }
                changed = targets.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // Store changes skip renewal and only release/claim.
                    self.reconcile(&mut session).await;
                }
            }
        }

        self.shutdown_session(&mut session).await;
        debug!(instance = %self.owner.instance, "Lock coordinator stopped");
    }

    async fn tick(&self, s: &mut SessionState) {
        let now = Instant::now();
        let Some(id) = s.session else {
            if now < s.retry_at {
                return;
            }
            self.open_session(s).await;
            if s.session.is_some() {
                self.reconcile(s).await;
            }
            return;
        };

        let deadline = self.release_deadline(s);
        match self.call(deadline, self.service.keep_alive(id)).await {
            Ok(()) => {
                // The service restarts the session clock no earlier than
                // the request was sent.
                s.last_renewed = now;
                self.reconcile(s).await;
            }
            Err(CoordinationError::SessionExpired) | Err(CoordinationError::UnknownSession(_)) => {
                warn!(instance = %self.owner.instance, session = id, "Session expired, releasing all targets");
                self.state.metrics.session_renewal_failures.inc();
                s.session = None;
                s.pending_release.clear();
                self.state.release_all();
            }
            Err(e) => {
                self.state.metrics.session_renewal_failures.inc();
                let silent_for = Instant::now().duration_since(s.last_renewed);
                let at_risk_after = self
                    .cluster
                    .session_timeout
                    .saturating_sub(self.cluster.tick_interval());
                warn!(
                    instance = %self.owner.instance,
                    error = %e,
                    silent_ms = silent_for.as_millis() as u64,
                    "Session renewal failed"
                );
                if silent_for >= at_risk_after {
                    self.release_at_risk();
                }
            }
        }
    }

    /// When held targets are dropped if the session is still unrenewed.
    fn release_deadline(&self, s: &SessionState) -> Instant {
        s.last_renewed
            + self
                .cluster
                .session_timeout
                .saturating_sub(self.cluster.tick_interval())
    }

    fn release_at_risk(&self) {
        if self.state.len() == 0 {
            return;
        }
        warn!(
            instance = %self.owner.instance,
            "Session at risk of expiry, releasing all targets locally"
        );
        self.state.release_all();
    }

    /// Run one coordination call bounded by the call timeout. Held targets
    /// are still dropped at `deadline` while the call is pending.
    async fn call<T>(
        &self,
        deadline: Instant,
        call: impl Future<Output = CoordinationResult<T>>,
    ) -> CoordinationResult<T> {
        let bounded = tokio::time::timeout(self.cluster.call_timeout(), call);
        tokio::pin!(bounded);
        let finished = tokio::select! {
            result = &mut bounded => Some(result),
            _ = tokio::time::sleep_until(deadline), if self.state.len() > 0 => None,
        };
        let result = match finished {
            Some(result) => result,
            None => {
                self.release_at_risk();
                bounded.await
            }
        };
        match result {
            Ok(result) => result,
            Err(_) => Err(CoordinationError::Unavailable(
                "coordination request timed out".to_string(),
            )),
        }
    }

    async fn open_session(&self, s: &mut SessionState) {
        let timeout = self.cluster.session_timeout;
        let deadline = self.release_deadline(s);
        match self
            .call(deadline, self.service.open_session(self.owner.clone(), timeout))
            .await
        {
            Ok(id) => {
                let now = Instant::now();
                info!(instance = %self.owner.instance, session = id, "Coordination session opened");
                s.session = Some(id);
                s.last_renewed = now;
                s.backoff = self.cluster.tick_interval();
            }
            Err(e) => {
                self.state.metrics.session_renewal_failures.inc();
                warn!(
                    instance = %self.owner.instance,
                    error = %e,
                    retry_in_ms = s.backoff.as_millis() as u64,
                    "Failed to open coordination session"
                );
                s.retry_at = Instant::now() + s.backoff;
                s.backoff = (s.backoff * 2).min(timeout);
            }
        }
    }

    /// Release targets gone from the store and claim free ones.
    async fn reconcile(&self, s: &mut SessionState) {
        let Some(id) = s.session else {
            return;
        };
        // Renewal is lagging: claim nothing until it recovers.
        if Instant::now().duration_since(s.last_renewed) >= self.cluster.tick_interval() * 2 {
            return;
        }
        let snapshot = self.targets.borrow().clone();

        let mut removed = Vec::new();
        for target in self.state.owned_sorted() {
            if !snapshot.contains(&target) {
                s.pending_release.insert(self.cluster.lock_path(&target));
                removed.push(target);
            }
        }
        let pending: Vec<String> = s.pending_release.iter().cloned().collect();
        for path in pending {
            let deadline = self.release_deadline(s);
            match self.call(deadline, self.service.release(&path, id)).await {
                Ok(()) | Err(CoordinationError::NotHeld(_)) => {
                    s.pending_release.remove(&path);
                }
                Err(e) => {
                    debug!(%path, error = %e, "Lock release failed, will retry");
                }
            }
        }
        // A local release during the calls above already dropped these.
        removed.retain(|target| self.state.contains(target));
        let mut owned_after = self.state.len() - removed.len();

        let mut added = Vec::new();
        for target in snapshot.names() {
            if owned_after >= self.limit || Instant::now() >= self.release_deadline(s) {
                break;
            }
            if self.state.contains(target) {
                continue;
            }
            let path = self.cluster.lock_path(target);
            if s.pending_release.contains(&path) {
                continue;
            }
            let deadline = self.release_deadline(s);
            match self.call(deadline, self.service.try_acquire(&path, id)).await {
                Ok(true) => {
                    owned_after += 1;
                    added.push(target.clone());
                }
                Ok(false) => {}
                Err(CoordinationError::SessionExpired) | Err(CoordinationError::UnknownSession(_)) => {
                    // Tick handles the expiry on its next renewal.
                    break;
                }
                Err(e) => {
                    debug!(%target, error = %e, "Lock acquisition failed");
                    break;
                }
            }
        }

        // Locks won after the deadline are not taken into use.
        if !added.is_empty() && Instant::now() >= self.release_deadline(s) {
            for target in added.drain(..) {
                s.pending_release.insert(self.cluster.lock_path(&target));
            }
        }

        self.state.apply(added, removed);
    }

    async fn shutdown_session(&self, s: &mut SessionState) {
        let owned = self.state.owned_sorted();
        self.state.release_all();
        let Some(id) = s.session.take() else {
            return;
        };
        for target in owned {
            let path = self.cluster.lock_path(&target);
            let deadline = self.release_deadline(s);
            if let Err(e) = self.call(deadline, self.service.release(&path, id)).await {
                debug!(%path, error = %e, "Lock release on shutdown failed");
            }
        }
        let deadline = self.release_deadline(s);
        if let Err(e) = self.call(deadline, self.service.close_session(id)).await {
            debug!(session = id, error = %e, "Closing coordination session failed");
        }
    }
}

#[async_trait]
impl ClusterCoordinator for LockCoordinator {
    async fn start(&self) -> Result<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }
        info!(
            instance = %self.inner.owner.instance,
            prefix = %self.inner.cluster.lock_prefix,
            session_timeout_ms = self.inner.cluster.session_timeout.as_millis() as u64,
            limit = self.inner.limit,
            "Lock coordinator started"
        );
        *task = Some(tokio::spawn(self.inner.clone().run()));
        Ok(())
    }

    async fn stop(&self) {
        self.inner.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn owned_targets(&self) -> Vec<TargetName> {
        self.inner.state.owned_sorted()
    }

    async fn owner_of(&self, target: &TargetName) -> Option<LockOwner> {
        if self.inner.state.contains(target) {
            return Some(self.inner.owner.clone());
        }
        let path = self.inner.cluster.lock_path(target);
        match tokio::time::timeout(
            self.inner.cluster.call_timeout(),
            self.inner.service.owner(&path),
        )
        .await
        {
            Ok(Ok(owner)) => owner,
            Ok(Err(e)) => {
                debug!(%target, error = %e, "Owner lookup failed");
                None
            }
            Err(_) => None,
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<OwnershipEvent> {
        self.inner.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryLockService;
    use crate::targets::{StaticSource, Target, TargetStore};
    use crate::types::InstanceId;
    use std::sync::atomic::{AtomicBool, Ordering};

    const SESSION: Duration = Duration::from_secs(3);

    fn owner(name: &str) -> LockOwner {
        LockOwner::new(InstanceId::new(name), Some(format!("{}:9339", name)))
    }

    async fn store(names: &[&str]) -> Arc<TargetStore> {
        let targets = names
            .iter()
            .map(|n| Target::new(*n, format!("{}:57400", n)))
            .collect();
        let store = Arc::new(TargetStore::new(
            Arc::new(StaticSource::new(targets)),
            Arc::new(GatewayMetrics::new()),
        ));
        store.reload().await.unwrap();
        store
    }

    fn coordinator(
        name: &str,
        limit: usize,
        service: Arc<dyn LockService>,
        store: &TargetStore,
    ) -> LockCoordinator {
        LockCoordinator::new(
            ClusterConfig::new(vec!["memory".into()]).with_session_timeout(SESSION),
            limit,
            owner(name),
            service,
            store.watch(),
            Vec::new(),
            Arc::new(GatewayMetrics::new()),
        )
    }

    /// Forwards to a memory lock table, or hangs on every call once
    /// stalled, like a coordination host that stopped answering.
    struct StallingLockService {
        table: Arc<MemoryLockService>,
        stalled: AtomicBool,
    }

    impl StallingLockService {
        fn new(table: Arc<MemoryLockService>) -> Self {
            Self {
                table,
                stalled: AtomicBool::new(false),
            }
        }

        fn stall(&self) {
            self.stalled.store(true, Ordering::SeqCst);
        }

        async fn gate(&self) -> CoordinationResult<()> {
            if self.stalled.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(5)).await;
                return Err(CoordinationError::Unavailable("no answer".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl LockService for StallingLockService {
        async fn open_session(
            &self,
            owner: LockOwner,
            timeout: Duration,
        ) -> CoordinationResult<SessionId> {
            self.gate().await?;
            self.table.open_session(owner, timeout).await
        }

        async fn keep_alive(&self, session: SessionId) -> CoordinationResult<()> {
            self.gate().await?;
            self.table.keep_alive(session).await
        }

        async fn try_acquire(&self, path: &str, session: SessionId) -> CoordinationResult<bool> {
            self.gate().await?;
            self.table.try_acquire(path, session).await
        }

        async fn release(&self, path: &str, session: SessionId) -> CoordinationResult<()> {
            self.gate().await?;
            self.table.release(path, session).await
        }

        async fn close_session(&self, session: SessionId) -> CoordinationResult<()> {
            self.gate().await?;
            self.table.close_session(session).await
        }

        async fn owner(&self, path: &str) -> CoordinationResult<Option<LockOwner>> {
            self.gate().await?;
            self.table.owner(path).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_instance_claims_up_to_limit() {
        let service = Arc::new(MemoryLockService::new());
        let store = store(&["r1", "r2", "r3"]).await;
        let coord = coordinator("a", 2, service.clone(), &store);
        let mut events = coord.subscribe();
        coord.start().await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.added(), &[TargetName::new("r1"), TargetName::new("r2")]);
        assert_eq!(coord.owned_targets().len(), 2);
        assert_eq!(service.holder("/telemetry/gateway/r3"), None);

        coord.stop().await;
        assert!(coord.owned_targets().is_empty());
        assert_eq!(service.lock_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_instances_partition_targets() {
        let service = Arc::new(MemoryLockService::new());
        let store = store(&["r1", "r2", "r3"]).await;
        let a = coordinator("a", 2, service.clone(), &store);
        let b = coordinator("b", 2, service.clone(), &store);
        a.start().await.unwrap();
        b.start().await.unwrap();
        tokio::time::sleep(SESSION).await;

        let owned_a: HashSet<_> = a.owned_targets().into_iter().collect();
        let owned_b: HashSet<_> = b.owned_targets().into_iter().collect();
        assert!(owned_a.is_disjoint(&owned_b));
        assert_eq!(owned_a.len() + owned_b.len(), 3);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_target_is_released() {
        let service = Arc::new(MemoryLockService::new());
        let store = store(&["r1", "r2"]).await;
        let coord = coordinator("a", 10, service.clone(), &store);
        let mut events = coord.subscribe();
        coord.start().await.unwrap();
        events.recv().await.unwrap();

        store.set_targets(vec![Target::new("r1", "r1:57400")]).unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.removed(), &[TargetName::new("r2")]);
        assert_eq!(service.holder("/telemetry/gateway/r2"), None);

        coord.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_session_releases_locally_before_expiry() {
        let service = Arc::new(MemoryLockService::new());
        let store = store(&["r1"]).await;
        let coord = coordinator("a", 10, service.clone(), &store);
        let mut events = coord.subscribe();
        coord.start().await.unwrap();
        events.recv().await.unwrap();
        let start = Instant::now();

        service.partition(&InstanceId::new("a"));
        let event = events.recv().await.unwrap();
        assert_eq!(event.removed(), &[TargetName::new("r1")]);
        // Dropped locally while the service still holds the lock.
        assert!(start.elapsed() < SESSION);
        assert_eq!(service.holder("/telemetry/gateway/r1"), Some(InstanceId::new("a")));

        coord.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_within_twice_session_timeout() {
        let service = Arc::new(MemoryLockService::new());
        let store = store(&["r1"]).await;
        let a = coordinator("a", 10, service.clone(), &store);
        a.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(a.owned_targets(), vec![TargetName::new("r1")]);

        let b = coordinator("b", 10, service.clone(), &store);
        let mut events = b.subscribe();
        b.start().await.unwrap();

        let crashed_at = Instant::now();
        service.partition(&InstanceId::new("a"));
        let event = events.recv().await.unwrap();
        assert_eq!(event.added(), &[TargetName::new("r1")]);
        assert!(crashed_at.elapsed() <= SESSION * 2);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_renewal_never_overlaps_peer() {
        let table = Arc::new(MemoryLockService::new());
        let stalling = Arc::new(StallingLockService::new(table.clone()));
        let store = store(&["r1"]).await;
        let r1 = TargetName::new("r1");

        let a = coordinator("a", 10, stalling.clone(), &store);
        a.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(a.owned_targets(), vec![r1.clone()]);
        let b = coordinator("b", 10, table.clone(), &store);
        b.start().await.unwrap();

        let stalled_at = Instant::now();
        stalling.stall();
        while stalled_at.elapsed() < SESSION * 4 {
            let a_owns = a.owned_targets().contains(&r1);
            let b_owns = b.owned_targets().contains(&r1);
            assert!(
                !(a_owns && b_owns),
                "r1 owned by both after {:?}",
                stalled_at.elapsed()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(a.owned_targets().is_empty());
        assert_eq!(b.owned_targets(), vec![r1]);
        assert!(a.inner.state.metrics.session_renewal_failures.get() > 0);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_reopens_and_reclaims() {
        let service = Arc::new(MemoryLockService::new());
        let store = store(&["r1"]).await;
        let coord = coordinator("a", 10, service.clone(), &store);
        let mut events = coord.subscribe();
        coord.start().await.unwrap();
        events.recv().await.unwrap();

        let session = service.sessions_of(&InstanceId::new("a"))[0];
        service.expire_session(session);

        let event = events.recv().await.unwrap();
        assert_eq!(event.removed(), &[TargetName::new("r1")]);
        let event = events.recv().await.unwrap();
        assert_eq!(event.added(), &[TargetName::new("r1")]);

        coord.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_of_reports_peer() {
        let service = Arc::new(MemoryLockService::new());
        let store = store(&["r1"]).await;
        let a = coordinator("a", 10, service.clone(), &store);
        let b = coordinator("b", 10, service.clone(), &store);
        a.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        b.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let owner = b.owner_of(&TargetName::new("r1")).await.unwrap();
        assert_eq!(owner.instance, InstanceId::new("a"));
        assert_eq!(owner.advertise_addr.as_deref(), Some("a:9339"));
        assert!(b.owner_of(&TargetName::new("r9")).await.is_none());

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_static_coordinator_follows_store() {
        let store = store(&["r1", "r2"]).await;
        let coord = StaticCoordinator::new(
            owner("a"),
            store.watch(),
            Vec::new(),
            Arc::new(GatewayMetrics::new()),
        );
        let mut events = coord.subscribe();
        coord.start().await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.added().len(), 2);

        store
            .set_targets(vec![Target::new("r2", "r2:1"), Target::new("r3", "r3:1")])
            .unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.added(), &[TargetName::new("r3")]);
        assert_eq!(event.removed(), &[TargetName::new("r1")]);
        assert!(coord.owner_of(&TargetName::new("r2")).await.is_some());

        coord.stop().await;
        assert!(coord.owned_targets().is_empty());
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_current_set() {
        let store = store(&["r1"]).await;
        let coord = StaticCoordinator::new(
            owner("a"),
            store.watch(),
            Vec::new(),
            Arc::new(GatewayMetrics::new()),
        );
        coord.start().await.unwrap();
        let mut first = coord.subscribe();
        first.recv().await.unwrap();

        let mut late = coord.subscribe();
        let event = late.recv().await.unwrap();
        assert_eq!(event.added(), &[TargetName::new("r1")]);
        coord.stop().await;
    }
}
