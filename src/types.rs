//! Core types used throughout the gateway.

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Update timestamp in nanoseconds since the Unix epoch.
pub type Timestamp = i64;

/// Target name that addresses every target served by an instance.
pub const ALL_TARGETS: &str = "*";

/// Current wall-clock time as a [`Timestamp`].
pub fn now_nanos() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as Timestamp)
        .unwrap_or_default()
}

/// Identity of a target endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetName(String);

impl TargetName {
    /// Create a new target name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the `*` name addressing all targets.
    pub fn is_wildcard(&self) -> bool {
        self.0 == ALL_TARGETS
    }
}

impl fmt::Display for TargetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TargetName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identity of a gateway instance within the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    /// Create an instance id from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random instance id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One element of a [`Path`]: a name plus optional list keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathElem {
    /// Element name.
    pub name: String,
    /// List keys selecting a single list entry.
    pub keys: BTreeMap<String, String>,
}

impl PathElem {
    /// Create an element without keys.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: BTreeMap::new(),
        }
    }

    /// Add a key to the element.
    pub fn with_key(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.keys.insert(key.into(), value.into());
        self
    }

    fn parse(segment: &str) -> Result<Self> {
        let (name, mut rest) = match segment.find('[') {
            Some(idx) => (&segment[..idx], &segment[idx..]),
            None => (segment, ""),
        };
        if name.is_empty() {
            return Err(Error::InvalidPath(format!("empty element name in '{}'", segment)));
        }

        let mut elem = PathElem::new(name);
        while !rest.is_empty() {
            if !rest.starts_with('[') {
                return Err(Error::InvalidPath(format!("unexpected text in '{}'", segment)));
            }
            let close = rest
                .find(']')
                .ok_or_else(|| Error::InvalidPath(format!("unclosed key in '{}'", segment)))?;
            let (key, value) = rest[1..close]
                .split_once('=')
                .ok_or_else(|| Error::InvalidPath(format!("key without value in '{}'", segment)))?;
            if key.is_empty() {
                return Err(Error::InvalidPath(format!("empty key name in '{}'", segment)));
            }
            elem.keys.insert(key.to_string(), value.to_string());
            rest = &rest[close + 1..];
        }
        Ok(elem)
    }
}

impl fmt::Display for PathElem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for (k, v) in &self.keys {
            write!(f, "[{}={}]", k, v)?;
        }
        Ok(())
    }
}

/// A path into a target's data tree, from the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Path {
    elems: Vec<PathElem>,
}

impl Path {
    /// The root path (no elements).
    pub fn root() -> Self {
        Self::default()
    }

    /// Build a path from elements.
    pub fn new(elems: Vec<PathElem>) -> Self {
        Self { elems }
    }

    /// Parse the textual form `/a/b[k=v]/c`.
    ///
    /// Slashes inside `[...]` belong to the key value, so
    /// `/interfaces/interface[name=Ethernet1/1]` has two elements.
    pub fn parse(s: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut in_key = false;
        for c in s.chars() {
            match c {
                '[' if !in_key => {
                    in_key = true;
                    current.push(c);
                }
                ']' if in_key => {
                    in_key = false;
                    current.push(c);
                }
                '/' if !in_key => {
                    if !current.is_empty() {
                        segments.push(std::mem::take(&mut current));
                    }
                }
                _ => current.push(c),
            }
        }
        if in_key {
            return Err(Error::InvalidPath(format!("unclosed key in '{}'", s)));
        }
        if !current.is_empty() {
            segments.push(current);
        }

        let elems = segments
            .iter()
            .map(|seg| PathElem::parse(seg))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { elems })
    }

    /// The path elements.
    pub fn elems(&self) -> &[PathElem] {
        &self.elems
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    /// Whether this is the root path.
    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    /// Whether `prefix` is an element-wise prefix of this path.
    pub fn has_prefix(&self, prefix: &Path) -> bool {
        prefix.elems.len() <= self.elems.len()
            && prefix.elems.iter().zip(&self.elems).all(|(a, b)| a == b)
    }

    /// Append `other` below this path.
    pub fn join(&self, other: &Path) -> Path {
        let mut elems = self.elems.clone();
        elems.extend(other.elems.iter().cloned());
        Path { elems }
    }

    /// Append a single element.
    pub fn child(mut self, elem: PathElem) -> Path {
        self.elems.push(elem);
        self
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.elems.is_empty() {
            return f.write_str("/");
        }
        for elem in &self.elems {
            write!(f, "/{}", elem)?;
        }
        Ok(())
    }
}

/// A typed leaf value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypedValue {
    String(String),
    Int(i64),
    Uint(u64),
    Bool(bool),
    Double(f64),
    Bytes(Bytes),
    Json(Bytes),
}

impl From<&str> for TypedValue {
    fn from(s: &str) -> Self {
        TypedValue::String(s.to_string())
    }
}

impl From<i64> for TypedValue {
    fn from(v: i64) -> Self {
        TypedValue::Int(v)
    }
}

impl From<u64> for TypedValue {
    fn from(v: u64) -> Self {
        TypedValue::Uint(v)
    }
}

impl From<bool> for TypedValue {
    fn from(v: bool) -> Self {
        TypedValue::Bool(v)
    }
}

/// A single leaf update, relative to a notification prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub path: Path,
    pub value: TypedValue,
}

impl Update {
    pub fn new(path: Path, value: impl Into<TypedValue>) -> Self {
        Self {
            path,
            value: value.into(),
        }
    }
}

/// A batch of updates and deletes sharing a timestamp, as received from a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub timestamp: Timestamp,
    pub prefix: Path,
    pub updates: Vec<Update>,
    pub deletes: Vec<Path>,
}

impl Notification {
    /// Create an empty notification at `timestamp`.
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            prefix: Path::root(),
            updates: Vec::new(),
            deletes: Vec::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: Path) -> Self {
        self.prefix = prefix;
        self
    }

    pub fn with_update(mut self, update: Update) -> Self {
        self.updates.push(update);
        self
    }

    pub fn with_delete(mut self, path: Path) -> Self {
        self.deletes.push(path);
        self
    }
}

/// A pass-through write request for a target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetRequest {
    pub prefix: Path,
    pub deletes: Vec<Path>,
    pub replaces: Vec<Update>,
    pub updates: Vec<Update>,
}

/// Result of a pass-through write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetResponse {
    pub timestamp: Timestamp,
}
