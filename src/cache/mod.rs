//! Telemetry cache: the latest value per `(target, path)`.
//!
//! Many ingestion streams write concurrently (one per live connection) while
//! server handlers read and subscribe. The store is sharded twice: targets
//! live in a [`DashMap`], and each target's entries live in their own
//! [`DashMap`] keyed by path, so writes to disjoint keys only meet when they
//! hash to the same inner shard.
//!
//! ```text
//! ┌───────────────────────────────────────────────────┐
//! │ Cache                                              │
//! │  targets: DashMap<TargetName, TargetCache>         │
//! │     └── entries: DashMap<Path, Arc<CacheEntry>>    │
//! │  events:  broadcast::Sender<CacheEvent>            │
//! └───────────────────────────────────────────────────┘
//! ```
//!
//! Puts run under the outer map's read guard; removing a whole target takes
//! its write guard, so a put can never land in a target map that has
//! already been dropped.

pub mod storage;

use crate::types::{Path, TargetName, Timestamp, TypedValue};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

pub use storage::{CacheEntry, PutOutcome, TargetCache};

/// Default capacity of the change event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 8192;

/// A change applied to the cache.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// An entry was inserted or replaced.
    Update(Arc<CacheEntry>),
    /// Entries at or below `prefix` were deleted by the target.
    Delete {
        target: TargetName,
        prefix: Path,
        timestamp: Timestamp,
    },
    /// All entries for the target were dropped (ownership or target lost).
    TargetPurged { target: TargetName },
    /// The target finished a full resync for `generation`.
    SyncComplete { target: TargetName, generation: u64 },
}

impl CacheEvent {
    /// The target this event belongs to.
    pub fn target(&self) -> &TargetName {
        match self {
            CacheEvent::Update(entry) => &entry.target,
            CacheEvent::Delete { target, .. }
            | CacheEvent::TargetPurged { target }
            | CacheEvent::SyncComplete { target, .. } => target,
        }
    }
}

/// Cache size statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Targets with at least one entry.
    pub targets: usize,
    /// Entries across all targets.
    pub entries: usize,
}

/// Why a subscription could not yield an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The subscriber fell behind and missed this many events.
    Lagged(u64),
    /// The cache was dropped.
    Closed,
}

/// A filtered stream of cache changes.
pub struct CacheSubscription {
    rx: broadcast::Receiver<CacheEvent>,
    target: TargetName,
    prefix: Path,
}

impl CacheSubscription {
    /// Wait for the next event matching this subscription.
    pub async fn recv(&mut self) -> std::result::Result<CacheEvent, SubscriptionError> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(SubscriptionError::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(SubscriptionError::Closed);
                }
            }
        }
    }

    /// The target this subscription follows (`*` for all).
    pub fn target(&self) -> &TargetName {
        &self.target
    }

    fn matches(&self, event: &CacheEvent) -> bool {
        if !self.target.is_wildcard() && event.target() != &self.target {
            return false;
        }
        match event {
            CacheEvent::Update(entry) => entry.path.has_prefix(&self.prefix),
            CacheEvent::Delete { prefix, .. } => {
                prefix.has_prefix(&self.prefix) || self.prefix.has_prefix(prefix)
            }
            CacheEvent::TargetPurged { .. } | CacheEvent::SyncComplete { .. } => true,
        }
    }
}

/// Concurrent store of the latest value per `(target, path)`.
pub struct Cache {
    targets: DashMap<TargetName, TargetCache>,
    events: broadcast::Sender<CacheEvent>,
}

impl Cache {
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create a cache whose subscribers may fall `capacity` events behind.
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            targets: DashMap::new(),
            events,
        }
    }

    /// Store a value; see [`TargetCache::put`] for ordering rules.
    pub fn put(
        &self,
        target: &TargetName,
        path: Path,
        value: TypedValue,
        timestamp: Timestamp,
        generation: u64,
    ) -> PutOutcome {
        let (outcome, entry) = match self.targets.get(target) {
            Some(cache) => cache.put(path, value, timestamp, generation),
            None => self
                .targets
                .entry(target.clone())
                .or_insert_with(|| TargetCache::new(target.clone()))
                .downgrade()
                .put(path, value, timestamp, generation),
        };

        match entry {
            Some(entry) => {
                trace!(%target, path = %entry.path, "Cache updated");
                let _ = self.events.send(CacheEvent::Update(entry));
            }
            None => {
                trace!(%target, timestamp, generation, "Stale update ignored");
            }
        }
        outcome
    }

    /// Apply a target-side delete of everything at or below `prefix`.
    pub fn delete(
        &self,
        target: &TargetName,
        prefix: &Path,
        timestamp: Timestamp,
        generation: u64,
    ) -> usize {
        let removed = match self.targets.get(target) {
            Some(cache) => cache.remove_prefix(prefix, generation),
            None => return 0,
        };
        self.drop_if_empty(target);

        if removed > 0 {
            let _ = self.events.send(CacheEvent::Delete {
                target: target.clone(),
                prefix: prefix.clone(),
                timestamp,
            });
        }
        removed
    }

    /// Entries for `target` at or below `prefix`, ordered by path.
    ///
    /// The `*` target reads every target.
    pub fn get(&self, target: &TargetName, prefix: &Path) -> Vec<Arc<CacheEntry>> {
        let mut entries = if target.is_wildcard() {
            self.targets
                .iter()
                .flat_map(|t| t.value().scan(prefix))
                .collect::<Vec<_>>()
        } else {
            match self.targets.get(target) {
                Some(cache) => cache.scan(prefix),
                None => Vec::new(),
            }
        };
        entries.sort_by(|a, b| (&a.target, &a.path).cmp(&(&b.target, &b.path)));
        entries
    }

    /// Subscribe to changes for `target` (or `*`) at or below `prefix`.
    ///
    /// Call [`Cache::get`] after subscribing to obtain the starting state;
    /// changes racing with the read are then delivered on the subscription.
    pub fn subscribe(&self, target: &TargetName, prefix: &Path) -> CacheSubscription {
        CacheSubscription {
            rx: self.events.subscribe(),
            target: target.clone(),
            prefix: prefix.clone(),
        }
    }

    /// Finish a resync: drop entries of `target` from generations older than
    /// `generation`, which the new stream did not refresh.
    pub fn sync_complete(&self, target: &TargetName, generation: u64) -> usize {
        let removed = match self.targets.get(target) {
            Some(cache) => cache.retain(|e| e.generation >= generation),
            None => 0,
        };
        self.drop_if_empty(target);

        debug!(%target, generation, removed, "Resync complete");
        let _ = self.events.send(CacheEvent::SyncComplete {
            target: target.clone(),
            generation,
        });
        removed
    }

    /// Drop every entry of `target` written by `generation` or earlier.
    ///
    /// Used when a connection ends for good; entries from a newer
    /// connection to the same target survive. `TargetPurged` is emitted
    /// whenever the target is left without entries, including when the
    /// connection never cached anything.
    pub fn purge_generation(&self, target: &TargetName, generation: u64) -> usize {
        let removed = match self.targets.get(target) {
            Some(cache) => cache.retain(|e| e.generation > generation),
            None => 0,
        };
        let emptied = self.drop_if_empty(target);

        if emptied {
            debug!(%target, removed, "Target purged from cache");
            let _ = self.events.send(CacheEvent::TargetPurged {
                target: target.clone(),
            });
        }
        removed
    }

    /// Drop every entry of `target`.
    pub fn purge_target(&self, target: &TargetName) -> usize {
        let removed = match self.targets.remove(target) {
            Some((_, cache)) => cache.len(),
            None => return 0,
        };
        debug!(%target, removed, "Target purged from cache");
        let _ = self.events.send(CacheEvent::TargetPurged {
            target: target.clone(),
        });
        removed
    }

    /// Targets with cached entries.
    pub fn targets(&self) -> Vec<TargetName> {
        let mut names: Vec<_> = self.targets.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }

    /// Whether `target` has any cached entries.
    pub fn contains_target(&self, target: &TargetName) -> bool {
        self.targets.contains_key(target)
    }

    /// Total entries.
    pub fn len(&self) -> usize {
        self.targets.iter().map(|t| t.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for target in self.targets.iter() {
            stats.targets += 1;
            stats.entries += target.value().len();
        }
        stats
    }

    fn drop_if_empty(&self, target: &TargetName) -> bool {
        self.targets
            .remove_if(target, |_, cache| cache.is_empty())
            .is_some()
            || !self.targets.contains_key(target)
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Cache")
            .field("targets", &stats.targets)
            .field("entries", &stats.entries)
            .finish()
    }
}
