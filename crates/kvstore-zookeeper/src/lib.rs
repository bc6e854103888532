//! ZooKeeper backend for the kvstore coordination abstraction.
//!
//! [`ZooKeeper`] implements [`kvstore_core::Store`] on top of any
//! [`ZkClient`]. Register it with [`register`] to select it from
//! configuration.

mod atomic;
mod client;
mod lock;
mod memory;
mod path;
mod read;
mod store;
mod tree;
mod watch;

pub use client::{
    next_event, world_acl, Acl, Connector, CreateMode, DeleteRequest, EventReceiver,
    SessionLock, Stat, WatchEvent, ZkClient, ZkError, ANY_VERSION, PERM_ALL,
};
pub use lock::ZkLock;
pub use memory::{MemoryBackend, MemoryEnsemble};
pub use path::normalize;
pub use store::{register, ZooKeeper, DEFAULT_TIMEOUT};
