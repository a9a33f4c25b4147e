//! Per-target entry storage.

use crate::types::{Path, TargetName, Timestamp, TypedValue};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Latest known value for one `(target, path)`.
///
/// Entries are immutable once built; an update replaces the whole `Arc`, so
/// value and timestamp are always read as the pair written by one put.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub target: TargetName,
    pub path: Path,
    pub value: TypedValue,
    pub timestamp: Timestamp,
    /// Generation of the connection attempt that produced the value.
    pub generation: u64,
}

/// What a put did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The path had no entry.
    Inserted,
    /// An existing entry was replaced.
    Updated,
    /// The update was older than the cached entry and was dropped.
    Stale,
}

impl PutOutcome {
    pub fn applied(self) -> bool {
        !matches!(self, PutOutcome::Stale)
    }
}

/// Entries of a single target, sharded by path.
#[derive(Debug)]
pub struct TargetCache {
    target: TargetName,
    entries: DashMap<Path, Arc<CacheEntry>>,
}

impl TargetCache {
    pub fn new(target: TargetName) -> Self {
        Self {
            target,
            entries: DashMap::new(),
        }
    }

    /// Store `value` at `path` unless the cached entry supersedes it.
    ///
    /// A newer generation always wins, so a resync after reconnect may move
    /// timestamps backwards. Within a generation timestamps never decrease.
    pub fn put(
        &self,
        path: Path,
        value: TypedValue,
        timestamp: Timestamp,
        generation: u64,
    ) -> (PutOutcome, Option<Arc<CacheEntry>>) {
        match self.entries.entry(path) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if generation < current.generation
                    || (generation == current.generation && timestamp < current.timestamp)
                {
                    return (PutOutcome::Stale, None);
                }
                let entry = Arc::new(CacheEntry {
                    target: self.target.clone(),
                    path: occupied.key().clone(),
                    value,
                    timestamp,
                    generation,
                });
                occupied.insert(entry.clone());
                (PutOutcome::Updated, Some(entry))
            }
            Entry::Vacant(vacant) => {
                let entry = Arc::new(CacheEntry {
                    target: self.target.clone(),
                    path: vacant.key().clone(),
                    value,
                    timestamp,
                    generation,
                });
                vacant.insert(entry.clone());
                (PutOutcome::Inserted, Some(entry))
            }
        }
    }

    /// Entry at exactly `path`.
    pub fn get(&self, path: &Path) -> Option<Arc<CacheEntry>> {
        self.entries.get(path).map(|e| e.value().clone())
    }

    /// Entries at or below `prefix`.
    pub fn scan(&self, prefix: &Path) -> Vec<Arc<CacheEntry>> {
        self.entries
            .iter()
            .filter(|e| e.key().has_prefix(prefix))
            .map(|e| e.value().clone())
            .collect()
    }

    /// Remove entries at or below `prefix` written by `generation` or earlier.
    pub fn remove_prefix(&self, prefix: &Path, generation: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|path, entry| !(path.has_prefix(prefix) && entry.generation <= generation));
        before - self.entries.len()
    }

    /// Keep only entries for which `keep` returns true.
    pub fn retain(&self, keep: impl Fn(&CacheEntry) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| keep(entry.as_ref()));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
