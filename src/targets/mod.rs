//! Desired target set and its reload loop.
//!
//! The [`TargetStore`] holds an immutable [`TargetSnapshot`], swapped as a
//! whole on every successful reload and published on a `watch` channel.
//! A failed reload keeps the previous snapshot.

mod source;

pub use source::{JsonFileSource, StaticSource, TargetDescriptor, TargetFile, TargetSource};

use crate::error::{Result, TargetError};
use crate::metrics::GatewayMetrics;
use crate::types::TargetName;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Login material for a target.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A remote endpoint to stream telemetry from.
///
/// Two targets with the same name but any differing field are "changed":
/// the connection is dropped and re-established rather than patched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: TargetName,
    /// Candidate `host:port` addresses, tried in order.
    pub addresses: Vec<String>,
    pub credentials: Option<Credentials>,
    /// Overrides the configured dial timeout.
    pub dial_timeout: Option<Duration>,
    /// Dial with TLS.
    pub tls: bool,
    pub meta: BTreeMap<String, String>,
}

impl Target {
    /// A plaintext target at a single address.
    pub fn new(name: impl Into<TargetName>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addresses: vec![address.into()],
            credentials: None,
            dial_timeout: None,
            tls: false,
            meta: BTreeMap::new(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = Some(timeout);
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Check the descriptor is usable.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| TargetError::Invalid {
            name: self.name.to_string(),
            reason: reason.to_string(),
        };
        if self.name.as_str().is_empty() {
            return Err(invalid("empty name").into());
        }
        if self.name.is_wildcard() {
            return Err(invalid("'*' is reserved").into());
        }
        if self.addresses.is_empty() || self.addresses.iter().any(|a| a.is_empty()) {
            return Err(invalid("no usable address").into());
        }
        if self.dial_timeout == Some(Duration::ZERO) {
            return Err(invalid("zero dial timeout").into());
        }
        Ok(())
    }
}

/// An immutable, ordered view of the desired targets.
///
/// Order is stable across reloads: a name keeps the position it had when
/// first seen, and new names are appended.
#[derive(Debug, Clone, Default)]
pub struct TargetSnapshot {
    order: Vec<TargetName>,
    targets: HashMap<TargetName, Target>,
    version: u64,
}

impl TargetSnapshot {
    pub fn get(&self, name: &TargetName) -> Option<&Target> {
        self.targets.get(name)
    }

    pub fn contains(&self, name: &TargetName) -> bool {
        self.targets.contains_key(name)
    }

    /// Targets in priority order.
    pub fn iter(&self) -> impl Iterator<Item = &Target> + '_ {
        self.order.iter().filter_map(|n| self.targets.get(n))
    }

    /// Names in priority order.
    pub fn names(&self) -> &[TargetName] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Incremented on every published change.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Build the next snapshot and the diff from `self`.
    fn next(&self, targets: Vec<Target>) -> (TargetSnapshot, TargetDiff) {
        let incoming: HashMap<TargetName, Target> = targets
            .iter()
            .map(|t| (t.name.clone(), t.clone()))
            .collect();

        let mut order: Vec<TargetName> = self
            .order
            .iter()
            .filter(|n| incoming.contains_key(*n))
            .cloned()
            .collect();
        let mut known: HashSet<TargetName> = order.iter().cloned().collect();
        for target in &targets {
            if known.insert(target.name.clone()) {
                order.push(target.name.clone());
            }
        }

        let mut diff = TargetDiff::default();
        for name in &order {
            let target = &incoming[name];
            match self.targets.get(name) {
                None => diff.added.push(target.clone()),
                Some(previous) if previous != target => diff.changed.push(target.clone()),
                Some(_) => {}
            }
        }
        for name in &self.order {
            if !incoming.contains_key(name) {
                diff.removed.push(name.clone());
            }
        }

        let version = if diff.is_empty() {
            self.version
        } else {
            self.version + 1
        };
        (
            TargetSnapshot {
                order,
                targets: incoming,
                version,
            },
            diff,
        )
    }
}

/// Difference between two target snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetDiff {
    pub added: Vec<Target>,
    pub removed: Vec<TargetName>,
    /// Same name, different connection parameters.
    pub changed: Vec<Target>,
}

impl TargetDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Holds the desired target set and refreshes it from a [`TargetSource`].
pub struct TargetStore {
    source: Arc<dyn TargetSource>,
    current: RwLock<Arc<TargetSnapshot>>,
    publish: watch::Sender<Arc<TargetSnapshot>>,
    // Serializes reloads so diffs are computed against the latest snapshot.
    reload_lock: Mutex<()>,
    metrics: Arc<GatewayMetrics>,
}

impl TargetStore {
    pub fn new(source: Arc<dyn TargetSource>, metrics: Arc<GatewayMetrics>) -> Self {
        let initial = Arc::new(TargetSnapshot::default());
        let (publish, _) = watch::channel(initial.clone());
        Self {
            source,
            current: RwLock::new(initial),
            publish,
            reload_lock: Mutex::new(()),
            metrics,
        }
    }

    /// The current snapshot.
    pub fn current(&self) -> Arc<TargetSnapshot> {
        self.current.read().clone()
    }

    /// Receive every published snapshot.
    pub fn watch(&self) -> watch::Receiver<Arc<TargetSnapshot>> {
        self.publish.subscribe()
    }

    /// Re-read the source and publish the result if it differs.
    ///
    /// On error the previous snapshot stays active.
    pub async fn reload(&self) -> Result<TargetDiff> {
        match self.source.load().await {
            Ok(targets) => {
                self.metrics.target_reloads.inc();
                Ok(self.apply(targets))
            }
            Err(e) => {
                self.metrics.target_reload_failures.inc();
                warn!(error = %e, "Target list reload failed, keeping previous set");
                Err(e)
            }
        }
    }

    /// Replace the target set with `targets` directly.
    pub fn set_targets(&self, targets: Vec<Target>) -> Result<TargetDiff> {
        for target in &targets {
            target.validate()?;
        }
        Ok(self.apply(targets))
    }

    fn apply(&self, targets: Vec<Target>) -> TargetDiff {
        let _guard = self.reload_lock.lock();
        let (next, diff) = self.current().next(targets);
        if diff.is_empty() {
            debug!("Target list unchanged");
            return diff;
        }

        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            changed = diff.changed.len(),
            total = next.len(),
            "Target list updated"
        );
        let next = Arc::new(next);
        *self.current.write() = next.clone();
        self.publish.send_replace(next);
        diff
    }

    /// Reload on a fixed interval until `shutdown` fires. The first reload
    /// happens immediately.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Target reload loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    // Errors are logged and counted inside reload.
                    let _ = self.reload().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakySource {
        inner: StaticSource,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl TargetSource for FlakySource {
        async fn load(&self) -> Result<Vec<Target>> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(TargetError::Parse("boom".into()).into());
            }
            self.inner.load().await
        }
    }

    fn names(snapshot: &TargetSnapshot) -> Vec<&str> {
        snapshot.names().iter().map(|n| n.as_str()).collect()
    }

    fn store_with(targets: Vec<Target>) -> (Arc<StaticSource>, TargetStore) {
        let source = Arc::new(StaticSource::new(targets));
        let store = TargetStore::new(source.clone(), Arc::new(GatewayMetrics::new()));
        (source, store)
    }

    #[tokio::test]
    async fn test_initial_reload_adds_everything() {
        let (_, store) = store_with(vec![Target::new("a", "a:1"), Target::new("b", "b:1")]);
        let diff = store.reload().await.unwrap();
        assert_eq!(diff.added.len(), 2);
        assert!(diff.removed.is_empty());
        assert_eq!(names(&store.current()), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_diff_added_removed_changed() {
        let (source, store) = store_with(vec![Target::new("a", "a:1"), Target::new("b", "b:1")]);
        store.reload().await.unwrap();

        source.set(vec![Target::new("b", "b:2"), Target::new("c", "c:1")]);
        let diff = store.reload().await.unwrap();

        assert_eq!(diff.added.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(diff.removed, vec![TargetName::new("a")]);
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].addresses, vec!["b:2".to_string()]);
    }

    #[tokio::test]
    async fn test_order_is_stable_across_reloads() {
        let (source, store) = store_with(vec![Target::new("a", "a:1"), Target::new("b", "b:1")]);
        store.reload().await.unwrap();

        source.set(vec![
            Target::new("c", "c:1"),
            Target::new("b", "b:1"),
            Target::new("a", "a:1"),
        ]);
        store.reload().await.unwrap();
        assert_eq!(names(&store.current()), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_unchanged_reload_publishes_nothing() {
        let (_, store) = store_with(vec![Target::new("a", "a:1")]);
        store.reload().await.unwrap();
        let version = store.current().version();

        let mut rx = store.watch();
        rx.borrow_and_update();
        let diff = store.reload().await.unwrap();
        assert!(diff.is_empty());
        assert_eq!(store.current().version(), version);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_set() {
        let source = Arc::new(FlakySource {
            inner: StaticSource::new(vec![Target::new("a", "a:1")]),
            fail: std::sync::atomic::AtomicBool::new(false),
        });
        let metrics = Arc::new(GatewayMetrics::new());
        let store = TargetStore::new(source.clone(), metrics.clone());
        store.reload().await.unwrap();

        source.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(store.reload().await.is_err());
        assert_eq!(names(&store.current()), vec!["a"]);
        assert_eq!(metrics.target_reload_failures.get(), 1);

        source.fail.store(false, std::sync::atomic::Ordering::SeqCst);
        source.inner.set(vec![]);
        let diff = store.reload().await.unwrap();
        assert_eq!(diff.removed.len(), 1);
    }

    #[test]
    fn test_set_targets_validates() {
        let (_, store) = store_with(vec![]);
        let bad = Target {
            addresses: vec![],
            ..Target::new("a", "a:1")
        };
        assert!(store.set_targets(vec![bad]).is_err());
        assert!(store.current().is_empty());
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let target = Target::new("a", "a:1").with_credentials("admin", "hunter2");
        let debug = format!("{:?}", target);
        assert!(debug.contains("admin"));
        assert!(!debug.contains("hunter2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_picks_up_changes() {
        let (source, store) = store_with(vec![Target::new("a", "a:1")]);
        let store = Arc::new(store);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(store.clone().run(Duration::from_secs(5), shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.current().len(), 1);

        source.set(vec![]);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(store.current().is_empty());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
