//! Cluster coordination: which instance owns which target.
//!
//! ```text
//! TargetStore ──watch──▶ ClusterCoordinator ──OwnershipEvent──▶ ConnectionManager
//!                              │
//!                              ▼
//!                         LockService  (memory / remote over TCP)
//! ```

pub mod coordinator;
pub mod events;
pub mod lock_service;
pub mod memory;
pub mod remote;

pub use coordinator::{ClusterCoordinator, LockCoordinator, StaticCoordinator};
pub use events::{
    LoggingOwnershipListener, NoopOwnershipListener, OwnershipEvent, OwnershipListener,
};
pub use lock_service::{CoordinationResult, LockOwner, LockService, SessionId};
pub use memory::MemoryLockService;
pub use remote::{LockRequest, LockResponse, LockServer, RemoteLockService};
