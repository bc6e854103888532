//! Core traits and types for coordination-service key/value stores.
//!
//! This crate defines the contract shared by every backend adapter:
//! - `Store`: CRUD, listing, watches and compare-and-swap on hierarchical keys
//! - `Locker`: distributed mutual exclusion with lock-loss notification
//! - `StoreRegistry`: backend selection from configuration

mod config;
mod error;
pub mod key;
mod lock;
mod registry;
mod store;
mod watch;

pub use config::{Backend, StoreConfig, TlsConfig};
pub use error::StoreError;
pub use lock::{LockLost, LockLostNotifier, LockState, Locker};
pub use registry::{Initializer, StoreRegistry};
pub use store::{KVPair, LockOptions, Store, WriteOptions};
pub use watch::{stop_channel, stopped, KvListStream, KvStream, StopSignal};
