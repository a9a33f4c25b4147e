//! Update rejection rules.
//!
//! A [`RejectionRule`] is a path pattern where each element either matches
//! one path element exactly or is a `*` wildcard. An update is dropped when
//! its full path matches any rule element-for-element over the whole length;
//! a rule never matches a longer or shorter path.

use crate::error::{Error, Result};
use crate::metrics::GatewayMetrics;
use crate::types::{Path, PathElem};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::{info, trace};

/// One element of a rejection pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternElem {
    /// Matches an equal path element (name and keys).
    Exact(PathElem),
    /// Matches any single path element.
    Wildcard,
}

impl PatternElem {
    fn matches(&self, elem: &PathElem) -> bool {
        match self {
            PatternElem::Exact(expected) => expected == elem,
            PatternElem::Wildcard => true,
        }
    }
}

/// A path pattern whose matches are kept out of the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectionRule {
    elems: Vec<PatternElem>,
}

impl RejectionRule {
    pub fn new(elems: Vec<PatternElem>) -> Self {
        Self { elems }
    }

    /// Parse a pattern like `/interfaces/interface[name=eth0]/*/counters`.
    pub fn parse(pattern: &str) -> Result<Self> {
        // Parse wildcards as literal "*" elements first, then convert.
        let path = Path::parse(pattern)?;
        if path.is_empty() {
            return Err(Error::InvalidPath(format!(
                "rejection rule '{}' has no elements",
                pattern
            )));
        }
        let elems = path
            .elems()
            .iter()
            .map(|e| {
                if e.name == "*" && e.keys.is_empty() {
                    PatternElem::Wildcard
                } else {
                    PatternElem::Exact(e.clone())
                }
            })
            .collect();
        Ok(Self { elems })
    }

    pub fn elems(&self) -> &[PatternElem] {
        &self.elems
    }

    /// Whether this rule matches the full `path`.
    pub fn matches(&self, path: &Path) -> bool {
        self.elems.len() == path.len()
            && self
                .elems
                .iter()
                .zip(path.elems())
                .all(|(pattern, elem)| pattern.matches(elem))
    }
}

impl fmt::Display for RejectionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for elem in &self.elems {
            match elem {
                PatternElem::Exact(e) => write!(f, "/{}", e)?,
                PatternElem::Wildcard => f.write_str("/*")?,
            }
        }
        Ok(())
    }
}

/// Admission check applied to every inbound update before it reaches the cache.
///
/// The rule set is an immutable snapshot swapped as a whole; an evaluation
/// always runs against a single snapshot.
#[derive(Debug)]
pub struct UpdateFilter {
    rules: RwLock<Arc<[RejectionRule]>>,
    metrics: Arc<GatewayMetrics>,
}

impl UpdateFilter {
    pub fn new(rules: Vec<RejectionRule>, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            rules: RwLock::new(rules.into()),
            metrics,
        }
    }

    /// A filter that admits everything.
    pub fn allow_all(metrics: Arc<GatewayMetrics>) -> Self {
        Self::new(Vec::new(), metrics)
    }

    /// Current rule snapshot.
    pub fn rules(&self) -> Arc<[RejectionRule]> {
        self.rules.read().clone()
    }

    /// Atomically replace the whole rule set.
    pub fn replace_rules(&self, rules: Vec<RejectionRule>) {
        let count = rules.len();
        *self.rules.write() = rules.into();
        info!(rules = count, "Update rejection rules replaced");
    }

    /// Whether an update at `path` may enter the cache. Rejections are counted.
    pub fn admit(&self, path: &Path) -> bool {
        let rules = self.rules();
        match rules.iter().find(|rule| rule.matches(path)) {
            Some(rule) => {
                self.metrics.updates_rejected.inc();
                trace!(%path, %rule, "Update rejected");
                false
            }
            None => true,
        }
    }

    /// Number of updates rejected so far.
    pub fn rejected_count(&self) -> u64 {
        self.metrics.updates_rejected.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(rules: &[&str]) -> UpdateFilter {
        let rules = rules
            .iter()
            .map(|r| RejectionRule::parse(r).unwrap())
            .collect();
        UpdateFilter::new(rules, Arc::new(GatewayMetrics::new()))
    }

    fn path(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    #[test]
    fn test_exact_match_rejected() {
        let f = filter(&["/system/processes"]);
        assert!(!f.admit(&path("/system/processes")));
        assert_eq!(f.rejected_count(), 1);
    }

    #[test]
    fn test_wildcard_element() {
        let f = filter(&["/interfaces/interface/*/counters"]);
        assert!(!f.admit(&path("/interfaces/interface/state/counters")));
        assert!(!f.admit(&path("/interfaces/interface/config/counters")));
        assert!(f.admit(&path("/interfaces/interface/state/status")));
    }

    #[test]
    fn test_length_must_match() {
        let f = filter(&["/a/b"]);
        assert!(f.admit(&path("/a")));
        assert!(f.admit(&path("/a/b/c")));
        assert!(!f.admit(&path("/a/b")));
    }

    #[test]
    fn test_keys_are_part_of_exact_match() {
        let f = filter(&["/interfaces/interface[name=mgmt0]/state"]);
        assert!(!f.admit(&path("/interfaces/interface[name=mgmt0]/state")));
        assert!(f.admit(&path("/interfaces/interface[name=eth0]/state")));
        assert!(f.admit(&path("/interfaces/interface/state")));
    }

    #[test]
    fn test_wildcard_covers_keyed_element() {
        let f = filter(&["/interfaces/*/state"]);
        assert!(!f.admit(&path("/interfaces/interface[name=eth0]/state")));
    }

    #[test]
    fn test_difference_in_non_wildcard_position_admitted() {
        let f = filter(&["/a/*/c"]);
        assert!(f.admit(&path("/x/b/c")));
        assert!(f.admit(&path("/a/b/x")));
        assert_eq!(f.rejected_count(), 0);
    }

    #[test]
    fn test_replace_rules() {
        let f = filter(&["/a"]);
        assert!(!f.admit(&path("/a")));
        f.replace_rules(vec![RejectionRule::parse("/b").unwrap()]);
        assert!(f.admit(&path("/a")));
        assert!(!f.admit(&path("/b")));
    }

    #[test]
    fn test_empty_rule_rejected_at_parse() {
        assert!(RejectionRule::parse("/").is_err());
    }

    #[test]
    fn test_display() {
        let rule = RejectionRule::parse("/a/*/c[k=v]").unwrap();
        assert_eq!(rule.to_string(), "/a/*/c[k=v]");
    }
}
