//! Wire messages of the gateway protocol.
//!
//! Every message travels as one length-prefixed bincode frame (see
//! [`crate::network::codec`]). A client sends one [`Request`] per
//! connection for subscriptions, and any number of `Get`/`Set`/
//! `Capabilities` requests otherwise.

use crate::cache::CacheEntry;
use crate::types::{
    Notification, Path, SetRequest, SetResponse, TargetName, Timestamp, Update,
};
use serde::{Deserialize, Serialize};

/// Protocol version reported in capabilities.
pub const PROTOCOL_VERSION: &str = "1.0";

/// How long a subscription stays open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscribeMode {
    /// Replay the current state, then end.
    Once,
    /// Replay the current state, then stream changes.
    Stream,
}

/// Client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Capabilities,
    Get {
        target: TargetName,
        prefix: Path,
    },
    Subscribe {
        target: TargetName,
        prefix: Path,
        mode: SubscribeMode,
    },
    Set {
        target: TargetName,
        request: SetRequest,
    },
}

impl Request {
    /// Label used for request metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Capabilities => "capabilities",
            Request::Get { .. } => "get",
            Request::Subscribe { .. } => "subscribe",
            Request::Set { .. } => "set",
        }
    }
}

/// What the server supports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub version: String,
    /// Instance answering the request.
    pub instance: String,
    /// Targets this instance currently serves.
    pub targets: Vec<TargetName>,
}

/// A notification attributed to one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetNotification {
    pub target: TargetName,
    pub notification: Notification,
}

impl TargetNotification {
    /// A single-update notification built from a cache entry.
    pub fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            target: entry.target.clone(),
            notification: Notification::new(entry.timestamp)
                .with_update(Update::new(entry.path.clone(), entry.value.clone())),
        }
    }

    /// A notification deleting everything at or below `prefix`.
    pub fn delete(target: TargetName, prefix: Path, timestamp: Timestamp) -> Self {
        Self {
            target,
            notification: Notification::new(timestamp).with_delete(prefix),
        }
    }
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Capabilities(Capabilities),
    /// Answer to `Get`, one notification per cached entry.
    Get(Vec<TargetNotification>),
    /// One change on a subscription.
    Update(TargetNotification),
    /// The initial replay of a subscription is complete.
    SyncComplete,
    /// Answer to `Set`.
    Set(SetResponse),
    /// This instance does not serve the target. `owner` is the advertised
    /// address of the instance that does, when known.
    NotServed {
        target: TargetName,
        owner: Option<String>,
    },
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::codec::{decode, encode};
    use crate::types::TypedValue;

    #[test]
    fn test_request_kind() {
        assert_eq!(Request::Capabilities.kind(), "capabilities");
        let req = Request::Subscribe {
            target: "r1".into(),
            prefix: Path::root(),
            mode: SubscribeMode::Stream,
        };
        assert_eq!(req.kind(), "subscribe");
    }

    #[test]
    fn test_notification_from_entry() {
        let entry = CacheEntry {
            target: "r1".into(),
            path: Path::parse("/system/hostname").unwrap(),
            value: TypedValue::from("r1.lab"),
            timestamp: 42,
            generation: 3,
        };
        let n = TargetNotification::from_entry(&entry);
        assert_eq!(n.target, TargetName::new("r1"));
        assert_eq!(n.notification.timestamp, 42);
        assert_eq!(n.notification.updates[0].path, entry.path);

        let wire = encode(&Response::Update(n.clone())).unwrap();
        assert_eq!(decode::<Response>(&wire).unwrap(), Response::Update(n));
    }
}
