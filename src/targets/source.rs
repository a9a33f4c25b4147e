//! Where the desired target list comes from.

use crate::error::{Result, TargetError};
use crate::targets::{Credentials, Target};
use crate::types::TargetName;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// A source of target descriptors, read on every reload.
#[async_trait]
pub trait TargetSource: Send + Sync + 'static {
    /// Read the full current list. Errors leave the active set untouched.
    async fn load(&self) -> Result<Vec<Target>>;
}

/// On-disk layout of the target list file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetFile {
    pub targets: Vec<TargetDescriptor>,
}

/// One entry of the target list file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub name: String,
    pub addresses: Vec<String>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub dial_timeout_ms: Option<u64>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl From<TargetDescriptor> for Target {
    fn from(d: TargetDescriptor) -> Self {
        Target {
            name: TargetName::new(d.name),
            addresses: d.addresses,
            credentials: d.credentials,
            dial_timeout: d.dial_timeout_ms.map(Duration::from_millis),
            tls: d.tls,
            meta: d.meta,
        }
    }
}

impl TargetFile {
    /// Parse and validate the JSON form.
    pub fn parse(data: &[u8]) -> Result<Vec<Target>> {
        let file: TargetFile =
            serde_json::from_slice(data).map_err(|e| TargetError::Parse(e.to_string()))?;

        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(file.targets.len());
        for descriptor in file.targets {
            let target = Target::from(descriptor);
            target.validate()?;
            if !seen.insert(target.name.clone()) {
                return Err(TargetError::Invalid {
                    name: target.name.to_string(),
                    reason: "duplicate target name".to_string(),
                }
                .into());
            }
            targets.push(target);
        }
        Ok(targets)
    }
}

/// Reads targets from a JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TargetSource for JsonFileSource {
    async fn load(&self) -> Result<Vec<Target>> {
        let data = tokio::fs::read(&self.path)
            .await
            .map_err(|e| TargetError::Read {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })?;
        TargetFile::parse(&data)
    }
}

/// A target list held in memory and replaced programmatically.
#[derive(Debug, Default)]
pub struct StaticSource {
    targets: RwLock<Vec<Target>>,
}

impl StaticSource {
    pub fn new(targets: Vec<Target>) -> Self {
        Self {
            targets: RwLock::new(targets),
        }
    }

    /// Replace the list returned by the next load.
    pub fn set(&self, targets: Vec<Target>) {
        *self.targets.write() = targets;
    }
}

#[async_trait]
impl TargetSource for StaticSource {
    async fn load(&self) -> Result<Vec<Target>> {
        Ok(self.targets.read().clone())
    }
}
