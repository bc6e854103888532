//! Interface consumed from the ZooKeeper client library.
//!
//! The adapter only relies on single-node primitives, one-shot watches and a
//! session-scoped lock. Any client (a wire-protocol binding or the in-process
//! [`MemoryEnsemble`](crate::MemoryEnsemble)) plugs in by implementing
//! [`ZkClient`] and [`Connector`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kvstore_core::{StoreError, TlsConfig};
use thiserror::Error;
use tokio::sync::oneshot;

/// Version argument that disables the version check on `set`/`delete`.
pub const ANY_VERSION: i32 = -1;

/// Permission bits of a ZooKeeper ACL.
pub const PERM_ALL: u32 = 0x1f;

/// Errors reported by the ZooKeeper client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ZkError {
    #[error("zk: node does not exist")]
    NoNode,

    #[error("zk: node already exists")]
    NodeExists,

    #[error("zk: version conflict")]
    BadVersion,

    #[error("zk: ephemeral nodes may not have children")]
    NoChildrenForEphemerals,

    #[error("zk: node has children")]
    NotEmpty,

    #[error("zk: not locked")]
    NotLocked,

    #[error("zk: trying to acquire a lock twice")]
    Deadlock,

    #[error("zk: session has been expired by the server")]
    SessionExpired,

    #[error("zk: connection closed")]
    ConnectionClosed,

    #[error("zk: could not connect to a server: {0}")]
    NoServer(String),

    #[error("zk: {0}")]
    Other(String),
}

impl From<ZkError> for StoreError {
    fn from(err: ZkError) -> Self {
        match err {
            ZkError::NoNode => StoreError::KeyNotFound,
            ZkError::NodeExists => StoreError::KeyExists,
            ZkError::BadVersion => StoreError::KeyModified,
            ZkError::NotLocked | ZkError::Deadlock => StoreError::Lock(err.to_string()),
            ZkError::SessionExpired => StoreError::Invalidated(err.to_string()),
            ZkError::ConnectionClosed | ZkError::NoServer(_) => {
                StoreError::Unavailable(err.to_string())
            }
            ZkError::NoChildrenForEphemerals | ZkError::NotEmpty | ZkError::Other(_) => {
                StoreError::Backend(err.to_string())
            }
        }
    }
}

/// Notification delivered once to a watch registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    /// The node's data was written.
    DataChanged,
    /// A child was created or deleted.
    ChildrenChanged,
    /// The session owning the watch expired.
    SessionExpired,
    /// The watch was dropped by the client (connection closed).
    NotWatching,
    /// Anything else (node created or deleted, ...).
    Other,
}

/// One-shot receiver for a watch registration. A closed sender means the
/// client stopped watching.
pub type EventReceiver = oneshot::Receiver<WatchEvent>;

/// Node metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    /// Data version, incremented by every `set`.
    pub version: i32,
    /// Children version, incremented by every child create/delete.
    pub cversion: i32,
    pub num_children: i32,
    /// Owning session for ephemeral nodes, 0 otherwise.
    pub ephemeral_owner: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
}

impl CreateMode {
    pub fn from_ephemeral(ephemeral: bool) -> Self {
        if ephemeral {
            CreateMode::Ephemeral
        } else {
            CreateMode::Persistent
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acl {
    pub perms: u32,
    pub scheme: String,
    pub id: String,
}

/// ACL granting `perms` to everyone.
pub fn world_acl(perms: u32) -> Vec<Acl> {
    vec![Acl {
        perms,
        scheme: "world".to_string(),
        id: "anyone".to_string(),
    }]
}

/// A delete operation inside a `multi` batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    pub path: String,
    pub version: i32,
}

/// ZooKeeper client connection. Implementations serialize requests
/// internally and are shared across tasks.
#[async_trait]
pub trait ZkClient: Send + Sync {
    async fn get(&self, path: &str) -> Result<(Vec<u8>, Stat), ZkError>;

    /// Like `get`, and registers a one-shot data watch on the node.
    async fn get_w(&self, path: &str) -> Result<(Vec<u8>, Stat, EventReceiver), ZkError>;

    /// Write data. `version` must match unless it is [`ANY_VERSION`].
    async fn set(&self, path: &str, data: &[u8], version: i32) -> Result<Stat, ZkError>;

    /// Create a node. Returns the created path.
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        acl: &[Acl],
    ) -> Result<String, ZkError>;

    async fn delete(&self, path: &str, version: i32) -> Result<(), ZkError>;

    async fn exists(&self, path: &str) -> Result<(bool, Stat), ZkError>;

    /// Names of the direct children, without their parent path.
    async fn children(&self, path: &str) -> Result<Vec<String>, ZkError>;

    /// Like `children`, and registers a one-shot children watch on the node.
    async fn children_w(&self, path: &str) -> Result<(Vec<String>, EventReceiver), ZkError>;

    /// Apply every delete or none.
    async fn multi(&self, ops: &[DeleteRequest]) -> Result<(), ZkError>;

    /// Bring the connected server up to date with the leader for `path`.
    async fn sync(&self, path: &str) -> Result<(), ZkError>;

    /// Session-scoped lock on `path`.
    fn new_lock(&self, path: &str, acl: Vec<Acl>) -> Box<dyn SessionLock>;

    /// Close the session. Ephemeral nodes and pending watches go with it.
    async fn close(&self);
}

/// Lock recipe provided by the client, held for the lifetime of the session.
#[async_trait]
pub trait SessionLock: Send + Sync {
    /// Block until the lock is granted.
    async fn lock(&self) -> Result<(), ZkError>;

    /// Release the lock. Fails with [`ZkError::NotLocked`] when not held.
    async fn unlock(&self) -> Result<(), ZkError>;
}

/// Opens client sessions against an ensemble.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoints: &[String],
        session_timeout: Duration,
        tls: Option<&TlsConfig>,
    ) -> Result<Arc<dyn ZkClient>, ZkError>;
}

/// Wait for a watch event. A dropped registration reads as
/// [`WatchEvent::NotWatching`].
pub async fn next_event(events: &mut EventReceiver) -> WatchEvent {
    events.await.unwrap_or(WatchEvent::NotWatching)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_translation() {
        assert_eq!(StoreError::from(ZkError::NoNode), StoreError::KeyNotFound);
        assert_eq!(StoreError::from(ZkError::NodeExists), StoreError::KeyExists);
        assert_eq!(StoreError::from(ZkError::BadVersion), StoreError::KeyModified);
        assert!(matches!(
            StoreError::from(ZkError::SessionExpired),
            StoreError::Invalidated(_)
        ));
        assert!(matches!(
            StoreError::from(ZkError::ConnectionClosed),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            StoreError::from(ZkError::NotLocked),
            StoreError::Lock(_)
        ));
    }

    #[tokio::test]
    async fn test_dropped_registration_reads_as_not_watching() {
        let (tx, mut rx) = oneshot::channel::<WatchEvent>();
        drop(tx);
        assert_eq!(next_event(&mut rx).await, WatchEvent::NotWatching);
    }
}
